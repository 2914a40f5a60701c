//! `checkpoint-<step>` directories with rotation.

mod manager;

pub use manager::{checkpoint_dir, CheckpointConfig, CheckpointManager, CHECKPOINT_PREFIX};
