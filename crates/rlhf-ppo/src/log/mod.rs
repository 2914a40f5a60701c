//! Metric sinks for training log records.
//!
//! - `MetricLogger` trait for composable backends
//! - `ConsoleLogger` emits each record through `tracing`
//! - `JsonLinesLogger` appends records to a `.jsonl` file
//! - `CompositeLogger` fans out to several backends

mod console;
mod jsonl;
mod logger;

pub use console::ConsoleLogger;
pub use jsonl::JsonLinesLogger;
pub use logger::{CompositeLogger, MetricLogger, NoOpLogger};
