//! Trainer configuration.

use crate::{PpoError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Configuration for the PPO trainer
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PpoTrainerConfig {
    // Batching
    /// Prompt rows per generation step (per device)
    pub batch_size: usize,
    /// Rows per forward pass inside the optimizer step
    pub mini_batch_size: usize,
    /// Batches consumed per optimization step
    pub gradient_accumulation_steps: usize,

    // Schedule
    /// Logical epochs over the dataloader (may be fractional)
    pub num_train_epochs: f64,
    /// Emit a log record every N optimization steps
    pub logging_steps: usize,
    /// Write `checkpoint-<step>` every N optimization steps
    pub save_steps: usize,

    // Generation
    /// Upper bound of the sampled response length
    pub max_target_length: usize,

    // Checkpointing
    /// Root directory for checkpoints and trainer state
    pub output_dir: String,
    /// Keep only the newest N checkpoints (0 = keep all)
    pub save_total_limit: usize,

    // Random seed
    pub seed: u64,
}

impl Default for PpoTrainerConfig {
    fn default() -> Self {
        Self {
            batch_size: 8,
            mini_batch_size: 1,
            gradient_accumulation_steps: 1,

            num_train_epochs: 1.0,
            logging_steps: 5,
            save_steps: 100,

            max_target_length: 128,

            output_dir: "output".to_string(),
            save_total_limit: 0,

            seed: 42,
        }
    }
}

impl PpoTrainerConfig {
    /// Load a JSON config; missing fields take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_mini_batch_size(mut self, mini_batch_size: usize) -> Self {
        self.mini_batch_size = mini_batch_size;
        self
    }

    pub fn with_gradient_accumulation_steps(mut self, steps: usize) -> Self {
        self.gradient_accumulation_steps = steps;
        self
    }

    pub fn with_epochs(mut self, epochs: f64) -> Self {
        self.num_train_epochs = epochs;
        self
    }

    pub fn with_logging_steps(mut self, steps: usize) -> Self {
        self.logging_steps = steps;
        self
    }

    pub fn with_save_steps(mut self, steps: usize) -> Self {
        self.save_steps = steps;
        self
    }

    pub fn with_max_target_length(mut self, length: usize) -> Self {
        self.max_target_length = length;
        self
    }

    pub fn with_output_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.output_dir = dir.as_ref().to_string_lossy().into_owned();
        self
    }

    pub fn with_save_total_limit(mut self, limit: usize) -> Self {
        self.save_total_limit = limit;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Rows consumed per optimization step across all replicas.
    pub fn total_train_batch_size(&self, world_size: usize) -> usize {
        self.batch_size * self.gradient_accumulation_steps * world_size
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(PpoError::Config("batch_size must be positive".into()));
        }
        if self.mini_batch_size == 0 || self.batch_size % self.mini_batch_size != 0 {
            return Err(PpoError::Config(format!(
                "mini_batch_size {} must evenly divide batch_size {}",
                self.mini_batch_size, self.batch_size
            )));
        }
        if self.gradient_accumulation_steps == 0 {
            return Err(PpoError::Config(
                "gradient_accumulation_steps must be at least 1".into(),
            ));
        }
        if !self.num_train_epochs.is_finite() || self.num_train_epochs <= 0.0 {
            return Err(PpoError::Config(format!(
                "num_train_epochs must be positive, got {}",
                self.num_train_epochs
            )));
        }
        if self.logging_steps == 0 || self.save_steps == 0 {
            return Err(PpoError::Config(
                "logging_steps and save_steps must be positive".into(),
            ));
        }
        if self.max_target_length == 0 {
            return Err(PpoError::Config("max_target_length must be positive".into()));
        }
        Ok(())
    }
}
