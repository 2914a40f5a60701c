//! Running averages reset every logging interval.

/// Weighted running mean.
#[derive(Clone, Debug, Default)]
pub struct AverageMeter {
    last: f64,
    sum: f64,
    count: usize,
}

impl AverageMeter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `value` as the mean of `n` observations.
    pub fn update(&mut self, value: f64, n: usize) {
        self.last = value;
        self.sum += value * n as f64;
        self.count += n;
    }

    /// Mean since the last reset, 0 when empty.
    pub fn avg(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }

    pub fn last(&self) -> f64 {
        self.last
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
