//! Checkpoint manager for step-numbered model snapshots.

use crate::model::DualHeadModel;
use crate::training::{TrainerState, TRAINER_STATE_NAME};
use crate::Result;
use std::fs;
use std::path::{Path, PathBuf};

/// Directory name prefix; the suffix is the completed step count.
pub const CHECKPOINT_PREFIX: &str = "checkpoint-";

/// `<output_dir>/checkpoint-<step>`
pub fn checkpoint_dir(output_dir: &Path, step: u64) -> PathBuf {
    output_dir.join(format!("{}{}", CHECKPOINT_PREFIX, step))
}

/// Configuration for checkpoint management.
#[derive(Clone, Debug)]
pub struct CheckpointConfig {
    /// Directory holding the `checkpoint-<step>` directories
    pub output_dir: PathBuf,
    /// Keep only the newest N checkpoints (0 = keep all)
    pub save_total_limit: usize,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("output"),
            save_total_limit: 0,
        }
    }
}

impl CheckpointConfig {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            ..Default::default()
        }
    }

    /// Set number of checkpoints to keep.
    pub fn save_total_limit(mut self, n: usize) -> Self {
        self.save_total_limit = n;
        self
    }
}

/// Writes and rotates checkpoints.
///
/// Only the primary process should call `save`; the manager itself does not
/// know about ranks.
///
/// # Example
///
/// ```ignore
/// let manager = CheckpointManager::new(CheckpointConfig::new("runs/ppo").save_total_limit(3));
/// let path = manager.save(&model, 100, &state)?;
/// assert!(path.ends_with("checkpoint-100"));
/// ```
pub struct CheckpointManager {
    config: CheckpointConfig,
}

impl CheckpointManager {
    pub fn new(config: CheckpointConfig) -> Self {
        Self { config }
    }

    pub fn output_dir(&self) -> &Path {
        &self.config.output_dir
    }

    /// Save `model` and `state` under `checkpoint-<step>`, then rotate.
    pub fn save<M: DualHeadModel + ?Sized>(
        &self,
        model: &M,
        step: u64,
        state: &TrainerState,
    ) -> Result<PathBuf> {
        let dir = checkpoint_dir(&self.config.output_dir, step);
        fs::create_dir_all(&dir)?;

        model.save_pretrained(&dir)?;
        state.save_json(dir.join(TRAINER_STATE_NAME))?;
        tracing::info!(path = %dir.display(), step, "Saved checkpoint");

        if self.config.save_total_limit > 0 {
            self.cleanup_old_checkpoints()?;
        }

        Ok(dir)
    }

    /// All checkpoints as `(step, path)`, oldest first.
    pub fn list_checkpoints(&self) -> Result<Vec<(u64, PathBuf)>> {
        let entries = match fs::read_dir(&self.config.output_dir) {
            Ok(e) => e,
            Err(_) => return Ok(Vec::new()),
        };

        let mut checkpoints: Vec<(u64, PathBuf)> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_dir())
            .filter_map(|p| extract_step(&p).map(|step| (step, p)))
            .collect();

        // Numeric order: checkpoint-100 after checkpoint-20
        checkpoints.sort_by_key(|(step, _)| *step);
        Ok(checkpoints)
    }

    /// Newest checkpoint, if any.
    pub fn latest_checkpoint(&self) -> Result<Option<PathBuf>> {
        Ok(self.list_checkpoints()?.pop().map(|(_, path)| path))
    }

    fn cleanup_old_checkpoints(&self) -> Result<()> {
        let checkpoints = self.list_checkpoints()?;
        let excess = checkpoints
            .len()
            .saturating_sub(self.config.save_total_limit);

        for (step, old) in checkpoints.into_iter().take(excess) {
            if let Err(e) = fs::remove_dir_all(&old) {
                tracing::warn!(path = %old.display(), "Failed to remove old checkpoint: {}", e);
            } else {
                tracing::debug!(step, "Removed old checkpoint");
            }
        }

        Ok(())
    }
}

fn extract_step(path: &Path) -> Option<u64> {
    path.file_name()
        .and_then(|n| n.to_str())
        .and_then(|n| n.strip_prefix(CHECKPOINT_PREFIX))
        .and_then(|s| s.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TinyCausalLm;
    use tempfile::tempdir;

    fn state_at(step: u64) -> TrainerState {
        TrainerState {
            global_step: step,
            ..TrainerState::default()
        }
    }

    #[test]
    fn test_checkpoint_config_builder() {
        let config = CheckpointConfig::new("./test").save_total_limit(10);
        assert_eq!(config.output_dir, PathBuf::from("./test"));
        assert_eq!(config.save_total_limit, 10);
    }

    #[test]
    fn test_save_writes_model_and_state() {
        let dir = tempdir().unwrap();
        let manager = CheckpointManager::new(CheckpointConfig::new(dir.path()));
        let model = TinyCausalLm::new(8, 4, 0);

        let path = manager.save(&model, 100, &state_at(100)).unwrap();

        assert_eq!(path, dir.path().join("checkpoint-100"));
        assert!(path.join(TRAINER_STATE_NAME).exists());
        assert_eq!(
            TrainerState::load_json(path.join(TRAINER_STATE_NAME))
                .unwrap()
                .global_step,
            100
        );
        assert!(TinyCausalLm::from_pretrained(&path, 0).is_ok());
    }

    #[test]
    fn test_list_is_numeric_and_ignores_strays() {
        let dir = tempdir().unwrap();
        let manager = CheckpointManager::new(CheckpointConfig::new(dir.path()));
        let model = TinyCausalLm::new(8, 4, 0);

        for step in [100, 20, 3] {
            manager.save(&model, step, &state_at(step)).unwrap();
        }
        fs::create_dir_all(dir.path().join("checkpoint-final")).unwrap();
        fs::write(dir.path().join("checkpoint-7"), b"not a dir").unwrap();

        let steps: Vec<u64> = manager
            .list_checkpoints()
            .unwrap()
            .into_iter()
            .map(|(s, _)| s)
            .collect();
        assert_eq!(steps, vec![3, 20, 100]);
        assert_eq!(
            manager.latest_checkpoint().unwrap(),
            Some(dir.path().join("checkpoint-100"))
        );
    }

    #[test]
    fn test_missing_output_dir_lists_nothing() {
        let dir = tempdir().unwrap();
        let manager = CheckpointManager::new(CheckpointConfig::new(dir.path().join("absent")));
        assert!(manager.list_checkpoints().unwrap().is_empty());
        assert!(manager.latest_checkpoint().unwrap().is_none());
    }

    #[test]
    fn test_cleanup_old_checkpoints() {
        let dir = tempdir().unwrap();
        let manager =
            CheckpointManager::new(CheckpointConfig::new(dir.path()).save_total_limit(2));
        let model = TinyCausalLm::new(8, 4, 0);

        for step in [10, 20, 30, 40, 50] {
            manager.save(&model, step, &state_at(step)).unwrap();
        }

        let remaining: Vec<u64> = manager
            .list_checkpoints()
            .unwrap()
            .into_iter()
            .map(|(s, _)| s)
            .collect();
        assert_eq!(remaining, vec![40, 50]);
    }

    #[test]
    fn test_zero_limit_keeps_all() {
        let dir = tempdir().unwrap();
        let manager = CheckpointManager::new(CheckpointConfig::new(dir.path()));
        let model = TinyCausalLm::new(8, 4, 0);

        for step in 1..=4 {
            manager.save(&model, step, &state_at(step)).unwrap();
        }
        assert_eq!(manager.list_checkpoints().unwrap().len(), 4);
    }
}
