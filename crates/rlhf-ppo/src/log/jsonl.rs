//! JSON-lines logging backend.

use super::MetricLogger;
use crate::training::LogRecord;
use crate::Result;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Mutex;

/// Appends one JSON object per line.
pub struct JsonLinesLogger {
    writer: Mutex<BufWriter<File>>,
}

#[derive(Serialize)]
struct ScalarLine<'a> {
    step: u64,
    name: &'a str,
    value: f64,
}

#[derive(Serialize)]
struct MetricsLine<'a> {
    step: u64,
    #[serde(flatten)]
    metrics: BTreeMap<&'a str, f64>,
}

impl JsonLinesLogger {
    /// Open `path` for appending, creating parent directories.
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    fn write_line<T: Serialize>(&self, line: &T) {
        let mut writer = match self.writer.lock() {
            Ok(w) => w,
            Err(poisoned) => poisoned.into_inner(),
        };
        let written = serde_json::to_writer(&mut *writer, line)
            .map_err(std::io::Error::from)
            .and_then(|_| writer.write_all(b"\n"));
        if let Err(e) = written {
            tracing::warn!("Failed to write metrics line: {}", e);
        }
    }
}

impl MetricLogger for JsonLinesLogger {
    fn log_scalar(&self, name: &str, value: f64, step: u64) {
        self.write_line(&ScalarLine { step, name, value });
    }

    fn log_metrics(&self, metrics: &HashMap<String, f64>, step: u64) {
        let metrics = metrics.iter().map(|(k, v)| (k.as_str(), *v)).collect();
        self.write_line(&MetricsLine { step, metrics });
    }

    fn log_record(&self, record: &LogRecord) {
        self.write_line(record);
    }

    fn close(&self) {
        let mut writer = match self.writer.lock() {
            Ok(w) => w,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Err(e) = writer.flush() {
            tracing::warn!("Failed to flush metrics file: {}", e);
        }
    }
}

impl Drop for JsonLinesLogger {
    fn drop(&mut self) {
        self.close();
    }
}
