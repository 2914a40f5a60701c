//! Trainer state and its per-interval log history.

use crate::{PpoError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

/// File name used for persisted trainer state.
pub const TRAINER_STATE_NAME: &str = "trainer_state.json";

/// One emitted log record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub loss: f64,
    pub reward: f64,
    pub learning_rate: f64,
    pub epoch: f64,
    pub step: u64,
}

impl LogRecord {
    /// Rounds loss and reward to 4 decimals and epoch to 2.
    pub fn new(loss: f64, reward: f64, learning_rate: f64, epoch: f64, step: u64) -> Self {
        Self {
            loss: round_to(loss, 4),
            reward: round_to(reward, 4),
            learning_rate,
            epoch: round_to(epoch, 2),
            step,
        }
    }

    /// Flat metric map for `MetricLogger` sinks.
    pub fn to_metrics(&self) -> HashMap<String, f64> {
        HashMap::from([
            ("loss".to_string(), self.loss),
            ("reward".to_string(), self.reward),
            ("learning_rate".to_string(), self.learning_rate),
            ("epoch".to_string(), self.epoch),
        ])
    }
}

fn round_to(value: f64, decimals: i32) -> f64 {
    let scale = 10f64.powi(decimals);
    (value * scale).round() / scale
}

/// Progress of a run, persisted next to each checkpoint.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainerState {
    /// Completed optimization steps
    pub global_step: u64,
    pub max_steps: u64,
    pub num_train_epochs: f64,
    /// Fractional epoch reached
    pub epoch: f64,
    /// Records ordered by step
    pub log_history: Vec<LogRecord>,
}

impl TrainerState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a record; steps must strictly increase.
    pub fn push_log(&mut self, record: LogRecord) -> Result<()> {
        if let Some(last) = self.log_history.last() {
            if record.step <= last.step {
                return Err(PpoError::Validation(format!(
                    "log record for step {} follows step {}",
                    record.step, last.step
                )));
            }
        }
        self.log_history.push(record);
        Ok(())
    }

    pub fn save_json(&self, path: impl AsRef<Path>) -> Result<()> {
        let file = fs::File::create(path)?;
        serde_json::to_writer_pretty(file, self)?;
        Ok(())
    }

    pub fn load_json(path: impl AsRef<Path>) -> Result<Self> {
        let file = fs::File::open(path)?;
        Ok(serde_json::from_reader(file)?)
    }
}
