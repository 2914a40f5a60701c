//! The policy-update seam.

use crate::model::DualHeadModel;
use crate::{PpoError, Result};
use std::collections::BTreeMap;

/// Key of the total PPO loss in `StepStats`.
pub const LOSS_TOTAL_KEY: &str = "ppo/loss/total";
/// Key of the current learning rate in `StepStats`.
pub const LEARNING_RATE_KEY: &str = "ppo/learning_rate";

/// Named scalars reported by one optimizer step.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StepStats(BTreeMap<String, f64>);

impl StepStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: f64) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: f64) {
        self.0.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<f64> {
        self.0.get(key).copied()
    }

    /// Value of `key`, or `PpoError::MissingStat`.
    pub fn require(&self, key: &str) -> Result<f64> {
        self.get(key)
            .ok_or_else(|| PpoError::MissingStat(key.to_string()))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<BTreeMap<String, f64>> for StepStats {
    fn from(map: BTreeMap<String, f64>) -> Self {
        Self(map)
    }
}

/// One PPO policy/value update.
///
/// Receives the trimmed queries and responses of a generation batch and one
/// scalar reward per row. The model arrives with the default head live,
/// gradient checkpointing on and the KV cache off. Implementations score
/// the batch with `scorer::batched_forward_pass` using `mini_batch_size`,
/// which the trainer has already checked divides the batch, and must report
/// at least `LOSS_TOTAL_KEY` and `LEARNING_RATE_KEY`.
pub trait PolicyOptimizer<M: DualHeadModel + ?Sized> {
    fn step(
        &mut self,
        model: &mut M,
        queries: &[Vec<i64>],
        responses: &[Vec<i64>],
        rewards: &[f32],
        mini_batch_size: usize,
    ) -> Result<StepStats>;
}
