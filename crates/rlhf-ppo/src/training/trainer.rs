//! PPO training loop.

use super::config::PpoTrainerConfig;
use super::context::ProcessContext;
use super::meter::AverageMeter;
use super::optimizer::{PolicyOptimizer, StepStats, LEARNING_RATE_KEY, LOSS_TOTAL_KEY};
use super::reward::compute_rewards;
use super::state::{LogRecord, TrainerState, TRAINER_STATE_NAME};
use crate::adapter::activate;
use crate::checkpoint::{CheckpointConfig, CheckpointManager};
use crate::data::{Batch, Dataloader, RecyclingIterator};
use crate::log::{ConsoleLogger, MetricLogger};
use crate::model::{DualHeadModel, HeadTarget};
use crate::sampler::{self, GenerationConfig, LengthSampler, LogitsProcessorList};
use crate::sequence::{trim_batch, SpecialTokens};
use crate::{PpoError, Result};
use indicatif::{ProgressBar, ProgressStyle};
use std::fs;
use std::path::Path;

/// Optimization steps in one pass: batches per pass over accumulation steps,
/// at least 1.
pub fn steps_per_epoch(num_batches: usize, gradient_accumulation_steps: usize) -> u64 {
    (num_batches / gradient_accumulation_steps.max(1)).max(1) as u64
}

/// `ceil(num_train_epochs * steps_per_epoch)`
pub fn max_steps(num_train_epochs: f64, steps_per_epoch: u64) -> u64 {
    (num_train_epochs * steps_per_epoch as f64).ceil() as u64
}

/// Drives generation, reward scoring and policy updates.
///
/// The trainer owns the model for the whole run. The default adapter and head
/// are live between steps; the reward head is only ever live inside reward
/// scoring.
pub struct PpoTrainer<M, O, D, C>
where
    M: DualHeadModel,
    O: PolicyOptimizer<M>,
    D: Dataloader,
    C: ProcessContext,
{
    config: PpoTrainerConfig,
    model: M,
    optimizer: O,
    data: RecyclingIterator<D>,
    context: C,
    tokens: SpecialTokens,
    generation: GenerationConfig,
    processors: LogitsProcessorList,
    logger: Box<dyn MetricLogger>,
    checkpoints: CheckpointManager,
    state: TrainerState,
    loss_meter: AverageMeter,
    reward_meter: AverageMeter,
    show_progress: bool,
}

impl<M, O, D, C> PpoTrainer<M, O, D, C>
where
    M: DualHeadModel,
    O: PolicyOptimizer<M>,
    D: Dataloader,
    C: ProcessContext,
{
    pub fn new(
        model: M,
        optimizer: O,
        dataloader: D,
        context: C,
        tokens: SpecialTokens,
        config: PpoTrainerConfig,
    ) -> Result<Self> {
        config.validate()?;

        let checkpoints = CheckpointManager::new(
            CheckpointConfig::new(&config.output_dir).save_total_limit(config.save_total_limit),
        );

        Ok(Self {
            generation: GenerationConfig::sampling(&tokens),
            processors: LogitsProcessorList::standard(),
            logger: Box::new(ConsoleLogger::new()),
            checkpoints,
            state: TrainerState::new(),
            loss_meter: AverageMeter::new(),
            reward_meter: AverageMeter::new(),
            show_progress: true,
            data: RecyclingIterator::new(dataloader),
            config,
            model,
            optimizer,
            context,
            tokens,
        })
    }

    /// Replace the metric sink (console by default).
    pub fn with_logger(mut self, logger: Box<dyn MetricLogger>) -> Self {
        self.logger = logger;
        self
    }

    /// Sampling parameters; `max_new_tokens` is redrawn every step.
    pub fn with_generation_config(mut self, generation: GenerationConfig) -> Self {
        self.generation = generation;
        self
    }

    pub fn with_logits_processors(mut self, processors: LogitsProcessorList) -> Self {
        self.processors = processors;
        self
    }

    pub fn without_progress_bar(mut self) -> Self {
        self.show_progress = false;
        self
    }

    pub fn config(&self) -> &PpoTrainerConfig {
        &self.config
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn model_mut(&mut self) -> &mut M {
        &mut self.model
    }

    pub fn into_model(self) -> M {
        self.model
    }

    pub fn optimizer(&self) -> &O {
        &self.optimizer
    }

    pub fn state(&self) -> &TrainerState {
        &self.state
    }

    pub fn steps_per_epoch(&self) -> u64 {
        steps_per_epoch(
            self.data.loader().len(),
            self.config.gradient_accumulation_steps,
        )
    }

    pub fn max_steps(&self) -> u64 {
        max_steps(self.config.num_train_epochs, self.steps_per_epoch())
    }

    /// Run the full PPO schedule.
    pub fn ppo_train(&mut self) -> Result<()> {
        if self.data.loader().is_empty() {
            return Err(PpoError::Config("dataloader yields no batches".into()));
        }

        let steps_per_epoch = self.steps_per_epoch();
        let max_steps = self.max_steps();
        self.state.max_steps = max_steps;
        self.state.num_train_epochs = self.config.num_train_epochs;

        if self.context.is_primary() {
            self.log_run_banner(max_steps);
        }

        let mut length_sampler =
            LengthSampler::for_target_length(self.config.max_target_length, self.config.seed)?;

        activate(&mut self.model, HeadTarget::Default)?;

        let progress = (self.show_progress && self.context.is_primary()).then(|| {
            let pb = ProgressBar::new(max_steps);
            let style = ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")
                .map(|s| s.progress_chars("#>-"))
                .unwrap_or_else(|_| ProgressStyle::default_bar());
            pb.set_style(style);
            pb
        });

        for step in 0..max_steps {
            let mut last_stats = None;
            for _ in 0..self.config.gradient_accumulation_steps {
                let batch = self.data.next_batch()?;
                last_stats = Some(self.train_batch(&batch, &mut length_sampler)?);
            }
            let stats = last_stats.ok_or_else(|| {
                PpoError::Config("gradient_accumulation_steps must be at least 1".into())
            })?;

            self.context.barrier();

            let completed = step + 1;
            self.state.global_step = completed;
            self.state.epoch = completed as f64 / steps_per_epoch as f64;

            if let Some(ref pb) = progress {
                pb.set_position(completed);
                pb.set_message(format!(
                    "Loss: {:.4} Reward: {:.4}",
                    self.loss_meter.last(),
                    self.reward_meter.last()
                ));
            }

            if self.context.is_primary()
                && completed.is_multiple_of(self.config.logging_steps as u64)
            {
                self.log_interval(completed, steps_per_epoch, &stats)?;
            }

            if completed.is_multiple_of(self.config.save_steps as u64) {
                self.save_checkpoint(completed)?;
                self.context.barrier();
            }
        }

        if let Some(ref pb) = progress {
            pb.finish_with_message("Training complete");
        }

        if self.context.is_primary() {
            let output_dir = Path::new(&self.config.output_dir);
            fs::create_dir_all(output_dir)?;
            self.state.save_json(output_dir.join(TRAINER_STATE_NAME))?;
        }
        self.logger.close();

        Ok(())
    }

    /// One accumulation micro-step: generate, trim, score, update.
    fn train_batch(&mut self, batch: &Batch, length_sampler: &mut LengthSampler) -> Result<StepStats> {
        let rows = batch.batch_size();
        if rows == 0 || rows % self.config.mini_batch_size != 0 {
            return Err(PpoError::Config(format!(
                "mini_batch_size {} must evenly divide the batch of {} rows",
                self.config.mini_batch_size, rows
            )));
        }
        let inputs = batch.to_model_inputs()?;

        // Rollouts come from the policy adapter whatever the last update left live.
        activate(&mut self.model, HeadTarget::Default)?;
        self.model.set_gradient_checkpointing(false);
        self.model.set_use_cache(true);

        let response_ids = sampler::generate(
            &mut self.model,
            &inputs,
            Some(length_sampler),
            false,
            &self.generation,
            &self.processors,
        )?;
        let (queries, responses) = trim_batch(&batch.input_ids, &response_ids, &self.tokens)?;

        let rewards = compute_rewards(
            &mut self.model,
            &queries,
            &responses,
            self.tokens.pad_token_id,
        )?;

        activate(&mut self.model, HeadTarget::Default)?;
        self.model.set_gradient_checkpointing(true);
        self.model.set_use_cache(false);

        let stats = self.optimizer.step(
            &mut self.model,
            &queries,
            &responses,
            &rewards,
            self.config.mini_batch_size,
        )?;
        let loss = stats.require(LOSS_TOTAL_KEY)?;
        stats.require(LEARNING_RATE_KEY)?;

        let mean_reward =
            rewards.iter().map(|&r| f64::from(r)).sum::<f64>() / rewards.len() as f64;
        self.loss_meter.update(loss, 1);
        self.reward_meter.update(mean_reward, rewards.len());

        tracing::debug!(rows, loss, mean_reward, "Finished PPO micro-step");
        Ok(stats)
    }

    fn log_interval(&mut self, completed: u64, steps_per_epoch: u64, stats: &StepStats) -> Result<()> {
        let record = LogRecord::new(
            self.loss_meter.avg(),
            self.reward_meter.avg(),
            stats.require(LEARNING_RATE_KEY)?,
            completed as f64 / steps_per_epoch as f64,
            completed,
        );
        self.logger.log_record(&record);
        self.state.push_log(record)?;

        self.loss_meter.reset();
        self.reward_meter.reset();
        Ok(())
    }

    fn save_checkpoint(&self, completed: u64) -> Result<()> {
        if !self.context.is_primary() {
            return Ok(());
        }
        self.checkpoints.save(&self.model, completed, &self.state)?;
        Ok(())
    }

    fn log_run_banner(&self, max_steps: u64) {
        let loader = self.data.loader();
        let world_size = self.context.world_size();
        tracing::info!("***** Running training *****");
        tracing::info!("  Num examples = {}", loader.num_examples());
        tracing::info!("  Num Epochs = {}", self.config.num_train_epochs);
        tracing::info!("  Instantaneous batch size per device = {}", self.config.batch_size);
        tracing::info!(
            "  Total train batch size (w. parallel, distributed & accumulation) = {}",
            self.config.total_train_batch_size(world_size)
        );
        tracing::info!(
            "  Gradient Accumulation steps = {}",
            self.config.gradient_accumulation_steps
        );
        tracing::info!("  Total optimization steps = {}", max_steps);
        tracing::info!(
            "  Number of trainable parameters = {}",
            self.model.num_trainable_parameters()
        );
    }
}
