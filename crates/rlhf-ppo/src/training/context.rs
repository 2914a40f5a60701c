//! Rank information for data-parallel runs.

/// Where this process sits in a data-parallel group.
///
/// Only the primary process logs records and writes checkpoints.
pub trait ProcessContext {
    /// Total number of replicas
    fn world_size(&self) -> usize;

    /// This replica's rank (0-indexed)
    fn rank(&self) -> usize;

    /// Check if this is the primary process
    fn is_primary(&self) -> bool {
        self.rank() == 0
    }

    /// Wait for every replica. No-op for a single process.
    fn barrier(&self) {}
}

/// A run with one replica.
#[derive(Clone, Copy, Debug, Default)]
pub struct SingleProcess;

impl ProcessContext for SingleProcess {
    fn world_size(&self) -> usize {
        1
    }

    fn rank(&self) -> usize {
        0
    }
}

/// Fixed rank handed down by an external launcher.
#[derive(Clone, Copy, Debug)]
pub struct StaticRank {
    pub rank: usize,
    pub world_size: usize,
}

impl StaticRank {
    pub fn new(rank: usize, world_size: usize) -> Self {
        Self { rank, world_size }
    }
}

impl ProcessContext for StaticRank {
    fn world_size(&self) -> usize {
        self.world_size
    }

    fn rank(&self) -> usize {
        self.rank
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_process_is_primary() {
        assert!(SingleProcess.is_primary());
        assert_eq!(SingleProcess.world_size(), 1);
    }

    #[test]
    fn test_only_rank_zero_is_primary() {
        assert!(StaticRank::new(0, 4).is_primary());
        assert!(!StaticRank::new(3, 4).is_primary());
        assert_eq!(StaticRank::new(3, 4).world_size(), 4);
    }
}
