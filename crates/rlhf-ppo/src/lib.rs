//! # rlhf-ppo
//!
//! PPO fine-tuning of a causal language model whose backbone carries two
//! value heads: one for the policy ("default") and one for reward scoring
//! ("reward").
//!
//! ## Overview
//!
//! - `model` - the `DualHeadModel` trait, head bundles and a tiny reference model
//! - `adapter` - switching the active adapter/value head, with scoped restoration
//! - `sampler` - response generation, length sampling and logits processors
//! - `scorer` - mini-batched forward passes producing logprobs, values and masks
//! - `training` - the PPO training loop, running meters and trainer state
//! - `checkpoint` - `checkpoint-<step>` directories written by the primary process
//! - `log` - metric sinks
//!
//! ## Features
//!
//! - `default` - ndarray-backed core
//! - `torch` - tch value head and tensor log-prob gathering (requires libtorch)
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use rlhf_ppo::prelude::*;
//!
//! let config = PpoTrainerConfig::default()
//!     .with_batch_size(8)
//!     .with_mini_batch_size(2)
//!     .with_output_dir("runs/ppo");
//! let mut trainer = PpoTrainer::new(model, optimizer, dataloader, SingleProcess, tokens, config)?;
//! trainer.ppo_train()?;
//! ```

pub mod adapter;
pub mod checkpoint;
pub mod data;
pub mod log;
pub mod model;
pub mod sampler;
pub mod scorer;
pub mod sequence;
pub mod training;

#[cfg(feature = "torch")]
pub mod torch;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::adapter::{activate, with_active_head, HeadGuard};
    pub use crate::checkpoint::{CheckpointConfig, CheckpointManager};
    pub use crate::data::{Batch, Dataloader, InMemoryDataloader, RecyclingIterator};
    pub use crate::log::{
        CompositeLogger, ConsoleLogger, JsonLinesLogger, MetricLogger, NoOpLogger,
    };
    pub use crate::model::{
        DualHeadModel, ForwardOutput, HeadBundle, HeadTarget, HeadWeights, ModelInputs,
        TinyCausalLm,
    };
    pub use crate::sampler::{
        GenerationConfig, LengthSampler, LogitsProcessor, LogitsProcessorList,
    };
    pub use crate::scorer::{batched_forward_pass, ScoredBatch};
    pub use crate::sequence::{prepare_model_inputs, SpecialTokens};
    pub use crate::training::{
        AverageMeter, LogRecord, PolicyOptimizer, PpoTrainer, PpoTrainerConfig, ProcessContext,
        SingleProcess, StaticRank, StepStats, TrainerState,
    };
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Error types for the library
#[derive(Debug, thiserror::Error)]
pub enum PpoError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("Model error: {0}")]
    Model(String),

    #[error("Optimizer statistics are missing `{0}`")]
    MissingStat(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Array shape error: {0}")]
    Shape(#[from] ndarray::ShapeError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[cfg(feature = "torch")]
    #[error("Tensor error: {0}")]
    Tensor(#[from] tch::TchError),
}

pub type Result<T> = core::result::Result<T, PpoError>;
