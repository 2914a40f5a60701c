//! Console logging backend.

use super::MetricLogger;
use crate::training::LogRecord;
use std::collections::HashMap;

/// Emits metrics through `tracing` at info level.
#[derive(Default)]
pub struct ConsoleLogger;

impl ConsoleLogger {
    pub fn new() -> Self {
        Self
    }
}

impl MetricLogger for ConsoleLogger {
    fn log_scalar(&self, name: &str, value: f64, step: u64) {
        tracing::info!("Step {}: {} = {:.4}", step, name, value);
    }

    fn log_metrics(&self, metrics: &HashMap<String, f64>, step: u64) {
        let mut keys: Vec<_> = metrics.keys().collect();
        keys.sort();

        let fields: Vec<String> = keys
            .into_iter()
            .map(|key| format!("{}={:.4}", key, metrics[key]))
            .collect();
        tracing::info!("Step {}: {}", step, fields.join(", "));
    }

    fn log_record(&self, record: &LogRecord) {
        tracing::info!(
            step = record.step,
            loss = record.loss,
            reward = record.reward,
            learning_rate = record.learning_rate,
            epoch = record.epoch,
            "{{'loss': {}, 'reward': {}, 'learning_rate': {:e}, 'epoch': {}}}",
            record.loss,
            record.reward,
            record.learning_rate,
            record.epoch
        );
    }
}
