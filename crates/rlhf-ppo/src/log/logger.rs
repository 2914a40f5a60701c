//! Metric logger traits and composites.

use crate::training::LogRecord;
use std::collections::HashMap;

/// Destination for training metrics.
pub trait MetricLogger: Send + Sync {
    /// Log a single scalar.
    fn log_scalar(&self, name: &str, value: f64, step: u64);

    /// Log a flat map of metrics.
    fn log_metrics(&self, metrics: &HashMap<String, f64>, step: u64);

    /// Log one interval record. Defaults to its flat metric map.
    fn log_record(&self, record: &LogRecord) {
        self.log_metrics(&record.to_metrics(), record.step);
    }

    /// Flush pending writes.
    fn close(&self) {}
}

/// Discards everything.
pub struct NoOpLogger;

impl MetricLogger for NoOpLogger {
    fn log_scalar(&self, _name: &str, _value: f64, _step: u64) {}
    fn log_metrics(&self, _metrics: &HashMap<String, f64>, _step: u64) {}
    fn log_record(&self, _record: &LogRecord) {}
}

/// Dispatches to multiple backends in order.
#[derive(Default)]
pub struct CompositeLogger {
    loggers: Vec<Box<dyn MetricLogger>>,
}

impl CompositeLogger {
    pub fn new(loggers: Vec<Box<dyn MetricLogger>>) -> Self {
        Self { loggers }
    }

    pub fn add(&mut self, logger: Box<dyn MetricLogger>) {
        self.loggers.push(logger);
    }

    pub fn len(&self) -> usize {
        self.loggers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.loggers.is_empty()
    }
}

impl MetricLogger for CompositeLogger {
    fn log_scalar(&self, name: &str, value: f64, step: u64) {
        for logger in &self.loggers {
            logger.log_scalar(name, value, step);
        }
    }

    fn log_metrics(&self, metrics: &HashMap<String, f64>, step: u64) {
        for logger in &self.loggers {
            logger.log_metrics(metrics, step);
        }
    }

    fn log_record(&self, record: &LogRecord) {
        for logger in &self.loggers {
            logger.log_record(record);
        }
    }

    fn close(&self) {
        for logger in &self.loggers {
            logger.close();
        }
    }
}
