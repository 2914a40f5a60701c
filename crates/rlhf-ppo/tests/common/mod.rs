#![allow(dead_code)]

use rlhf_ppo::adapter::{activate, with_active_head};
use rlhf_ppo::prelude::*;
use rlhf_ppo::scorer::batched_forward_pass;
use rlhf_ppo::training::{last_position_values, LEARNING_RATE_KEY, LOSS_TOTAL_KEY};
use rlhf_ppo::Result;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub const VOCAB: usize = 16;
pub const HIDDEN: usize = 8;
pub const LEARNING_RATE: f64 = 1.41e-5;

/// Everything the optimizer observed on one call.
#[derive(Clone, Debug)]
pub struct StepCall {
    pub active: HeadTarget,
    pub gradient_checkpointing: bool,
    pub use_cache: bool,
    pub queries: Vec<Vec<i64>>,
    pub responses: Vec<Vec<i64>>,
    pub rewards: Vec<f32>,
    pub mini_batch_size: usize,
    pub reward_head_values: Vec<f32>,
    pub scored_steps: usize,
}

/// Scores every batch through the mini-batched forward pass and reports the
/// call index as its loss, so interval averages are easy to predict.
#[derive(Default)]
pub struct RecordingOptimizer {
    pub report_learning_rate: bool,
    /// Switch to the reward head at the end of every step and leave it live
    pub leave_reward_live: bool,
    pub calls: Vec<StepCall>,
}

impl RecordingOptimizer {
    pub fn new() -> Self {
        Self {
            report_learning_rate: true,
            ..Self::default()
        }
    }
}

impl PolicyOptimizer<TinyCausalLm> for RecordingOptimizer {
    fn step(
        &mut self,
        model: &mut TinyCausalLm,
        queries: &[Vec<i64>],
        responses: &[Vec<i64>],
        rewards: &[f32],
        mini_batch_size: usize,
    ) -> Result<StepStats> {
        let tokens = SpecialTokens::default();
        let active = model.active_adapter();
        let gradient_checkpointing = model.gradient_checkpointing();
        let use_cache = model.use_cache();

        let inputs = prepare_model_inputs(queries, responses, tokens.pad_token_id)?;
        let scored = batched_forward_pass(&*model, &inputs, mini_batch_size, tokens.bos_token_id)?;

        let reward_head_values = with_active_head(model, HeadTarget::Reward, |m| {
            last_position_values(m.forward(&inputs)?.values.view())
        })?;

        self.calls.push(StepCall {
            active,
            gradient_checkpointing,
            use_cache,
            queries: queries.to_vec(),
            responses: responses.to_vec(),
            rewards: rewards.to_vec(),
            mini_batch_size,
            reward_head_values,
            scored_steps: scored.len(),
        });

        if self.leave_reward_live {
            activate(model, HeadTarget::Reward)?;
        }

        let mut stats = StepStats::new().with(LOSS_TOTAL_KEY, self.calls.len() as f64);
        if self.report_learning_rate {
            stats.insert(LEARNING_RATE_KEY, LEARNING_RATE);
        }
        Ok(stats)
    }
}

/// Metric sink keeping every record it receives.
#[derive(Clone, Default)]
pub struct RecordingLogger {
    pub records: Arc<Mutex<Vec<LogRecord>>>,
}

impl RecordingLogger {
    pub fn records(&self) -> Vec<LogRecord> {
        self.records.lock().unwrap().clone()
    }
}

impl MetricLogger for RecordingLogger {
    fn log_scalar(&self, _name: &str, _value: f64, _step: u64) {}

    fn log_metrics(&self, _metrics: &std::collections::HashMap<String, f64>, _step: u64) {}

    fn log_record(&self, record: &LogRecord) {
        self.records.lock().unwrap().push(record.clone());
    }
}

/// Rank 0 of a group, counting `barrier` calls.
#[derive(Clone, Default)]
pub struct CountingContext {
    pub barriers: Arc<AtomicUsize>,
}

impl CountingContext {
    pub fn barriers(&self) -> usize {
        self.barriers.load(Ordering::SeqCst)
    }
}

impl ProcessContext for CountingContext {
    fn world_size(&self) -> usize {
        2
    }

    fn rank(&self) -> usize {
        0
    }

    fn barrier(&self) {
        self.barriers.fetch_add(1, Ordering::SeqCst);
    }
}

/// `num_batches` batches of `batch_size` BOS-prefixed prompts of varying length.
pub fn prompt_loader(num_batches: usize, batch_size: usize) -> InMemoryDataloader {
    let prompts: Vec<Vec<i64>> = (0..num_batches * batch_size)
        .map(|i| {
            let len = 1 + i % 3;
            std::iter::once(1)
                .chain((0..len).map(|j| 3 + ((i + j) % (VOCAB - 3)) as i64))
                .collect()
        })
        .collect();
    InMemoryDataloader::from_prompts(&prompts, batch_size, 0).unwrap()
}

pub fn model() -> TinyCausalLm {
    TinyCausalLm::new(VOCAB, HIDDEN, 11)
}
