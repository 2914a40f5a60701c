//! Response sampling from the active policy.
//!
//! Provides:
//! - `generate` - run the model's decoder and strip the prompt prefix
//! - `LengthSampler` - random new-token budget in `[max / 2, max)`
//! - `LogitsProcessor` chain applied to next-token scores
//! - `sample_from_logits` - temperature / top-k / top-p / multinomial selection

use crate::model::{DualHeadModel, ModelInputs};
use crate::sequence::SpecialTokens;
use crate::{PpoError, Result};
use ndarray::{s, Array2};
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

/// Decoding options passed to `DualHeadModel::generate`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GenerationConfig {
    /// Keep only the k most likely tokens (0 disables)
    pub top_k: usize,
    /// Nucleus filtering threshold (1.0 disables)
    pub top_p: f64,
    /// Softmax temperature
    pub temperature: f64,
    /// Multinomial sampling when true, greedy otherwise
    pub do_sample: bool,
    /// Budget of newly generated tokens
    pub max_new_tokens: usize,
    pub pad_token_id: i64,
    pub eos_token_id: i64,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            top_k: 0,
            top_p: 1.0,
            temperature: 1.0,
            do_sample: true,
            max_new_tokens: 32,
            pad_token_id: 0,
            eos_token_id: 2,
        }
    }
}

impl GenerationConfig {
    /// Pure multinomial sampling with the tokenizer's pad/eos ids.
    pub fn sampling(tokens: &SpecialTokens) -> Self {
        Self {
            pad_token_id: tokens.pad_token_id,
            eos_token_id: tokens.eos_token_id,
            ..Default::default()
        }
    }

    pub fn with_max_new_tokens(mut self, max_new_tokens: usize) -> Self {
        self.max_new_tokens = max_new_tokens;
        self
    }

    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k;
        self
    }

    pub fn with_top_p(mut self, top_p: f64) -> Self {
        self.top_p = top_p;
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn greedy(mut self) -> Self {
        self.do_sample = false;
        self
    }
}

/// Draws a generation length uniformly from `[min, max)`.
pub struct LengthSampler {
    min: usize,
    max: usize,
    rng: StdRng,
}

impl LengthSampler {
    pub fn new(min: usize, max: usize, seed: u64) -> Result<Self> {
        if min >= max {
            return Err(PpoError::Config(format!(
                "length sampler needs min < max, got [{}, {})",
                min, max
            )));
        }
        Ok(Self {
            min,
            max,
            rng: StdRng::seed_from_u64(seed),
        })
    }

    /// Sampler over `[max_target_length / 2, max_target_length)`.
    pub fn for_target_length(max_target_length: usize, seed: u64) -> Result<Self> {
        Self::new(max_target_length / 2, max_target_length, seed)
    }

    pub fn range(&self) -> (usize, usize) {
        (self.min, self.max)
    }

    pub fn sample(&mut self) -> usize {
        self.rng.gen_range(self.min..self.max)
    }
}

/// Constraint applied to next-token scores of one row during decoding.
pub trait LogitsProcessor {
    /// `input_ids` is the row generated so far (prompt included).
    fn process(&self, input_ids: &[i64], scores: &mut [f32]);
}

/// Replaces NaN scores with 0 and +inf with the largest finite value.
pub struct InfNanRemoveLogitsProcessor;

impl LogitsProcessor for InfNanRemoveLogitsProcessor {
    fn process(&self, _input_ids: &[i64], scores: &mut [f32]) {
        for score in scores.iter_mut() {
            if score.is_nan() {
                *score = 0.0;
            } else if *score == f32::INFINITY {
                *score = f32::MAX;
            }
        }
    }
}

/// Forbids EOS until the row reaches `min_length` tokens (prompt included).
pub struct MinLengthLogitsProcessor {
    pub min_length: usize,
    pub eos_token_id: i64,
}

impl LogitsProcessor for MinLengthLogitsProcessor {
    fn process(&self, input_ids: &[i64], scores: &mut [f32]) {
        if input_ids.len() < self.min_length {
            if let Some(score) = usize::try_from(self.eos_token_id)
                .ok()
                .and_then(|idx| scores.get_mut(idx))
            {
                *score = f32::NEG_INFINITY;
            }
        }
    }
}

/// Never samples the listed token ids.
pub struct BannedTokensLogitsProcessor {
    pub banned: Vec<i64>,
}

impl LogitsProcessor for BannedTokensLogitsProcessor {
    fn process(&self, _input_ids: &[i64], scores: &mut [f32]) {
        for &id in &self.banned {
            if let Some(score) = usize::try_from(id).ok().and_then(|idx| scores.get_mut(idx)) {
                *score = f32::NEG_INFINITY;
            }
        }
    }
}

/// Ordered chain of logits processors.
#[derive(Default)]
pub struct LogitsProcessorList {
    processors: Vec<Box<dyn LogitsProcessor>>,
}

impl LogitsProcessorList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Chain used for PPO rollouts: inf/nan removal only.
    pub fn standard() -> Self {
        Self::new().with(Box::new(InfNanRemoveLogitsProcessor))
    }

    pub fn with(mut self, processor: Box<dyn LogitsProcessor>) -> Self {
        self.processors.push(processor);
        self
    }

    pub fn push(&mut self, processor: Box<dyn LogitsProcessor>) {
        self.processors.push(processor);
    }

    pub fn len(&self) -> usize {
        self.processors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processors.is_empty()
    }

    pub fn process(&self, input_ids: &[i64], scores: &mut [f32]) {
        for processor in &self.processors {
            processor.process(input_ids, scores);
        }
    }
}

/// Pick the next token from already-processed scores.
pub fn sample_from_logits<R: Rng + ?Sized>(
    scores: &[f32],
    config: &GenerationConfig,
    rng: &mut R,
) -> Result<i64> {
    if scores.is_empty() {
        return Err(PpoError::Validation("empty vocabulary scores".into()));
    }

    if !config.do_sample {
        let best = scores
            .iter()
            .enumerate()
            .fold((0usize, f32::NEG_INFINITY), |(bi, bs), (i, &s)| {
                if s > bs {
                    (i, s)
                } else {
                    (bi, bs)
                }
            })
            .0;
        return Ok(best as i64);
    }

    if config.temperature <= 0.0 {
        return Err(PpoError::Config(format!(
            "temperature must be positive when sampling, got {}",
            config.temperature
        )));
    }

    if !(config.top_p > 0.0 && config.top_p <= 1.0) {
        return Err(PpoError::Config(format!(
            "top_p must be in (0, 1], got {}",
            config.top_p
        )));
    }

    let temperature = config.temperature as f32;
    let mut scaled: Vec<f32> = scores.iter().map(|s| s / temperature).collect();

    let mut order: Vec<usize> = (0..scaled.len()).collect();
    order.sort_by(|&a, &b| scaled[b].total_cmp(&scaled[a]));

    if config.top_k > 0 && config.top_k < scaled.len() {
        for &idx in &order[config.top_k..] {
            scaled[idx] = f32::NEG_INFINITY;
        }
    }

    let mut probs = softmax(&scaled)?;

    if config.top_p < 1.0 {
        let mut cumulative = 0.0f64;
        for &idx in &order {
            // top_p > 0, so the most likely token always survives.
            if cumulative >= config.top_p {
                probs[idx] = 0.0;
            }
            cumulative += probs[idx] as f64;
        }
    }

    let dist = WeightedIndex::new(&probs)
        .map_err(|e| PpoError::Validation(format!("cannot sample next token: {}", e)))?;
    Ok(dist.sample(rng) as i64)
}

fn softmax(scores: &[f32]) -> Result<Vec<f32>> {
    let max = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    if max == f32::NEG_INFINITY {
        return Err(PpoError::Validation(
            "every token was masked out by the logits processors".into(),
        ));
    }
    let exp: Vec<f32> = scores.iter().map(|s| (s - max).exp()).collect();
    let sum: f32 = exp.iter().sum();
    Ok(exp.into_iter().map(|e| e / sum).collect())
}

/// Generate responses for left-padded queries.
///
/// With a length sampler the new-token budget is redrawn for this call. When
/// `return_prompt` is false on a decoder-only model, only the newly generated
/// columns are returned.
pub fn generate<M: DualHeadModel>(
    model: &mut M,
    inputs: &ModelInputs,
    length_sampler: Option<&mut LengthSampler>,
    return_prompt: bool,
    config: &GenerationConfig,
    processors: &LogitsProcessorList,
) -> Result<Array2<i64>> {
    let mut config = config.clone();
    if let Some(sampler) = length_sampler {
        config.max_new_tokens = sampler.sample();
    }

    tracing::debug!(
        rows = inputs.batch_size(),
        max_new_tokens = config.max_new_tokens,
        "Generating responses"
    );

    let output = model.generate(inputs, &config, processors)?;

    if !return_prompt && !model.is_encoder_decoder() {
        let prompt_len = inputs.seq_len();
        if output.ncols() < prompt_len || output.nrows() != inputs.batch_size() {
            return Err(PpoError::ShapeMismatch {
                expected: vec![inputs.batch_size(), prompt_len],
                actual: vec![output.nrows(), output.ncols()],
            });
        }
        return Ok(output.slice(s![.., prompt_len..]).to_owned());
    }

    Ok(output)
}
