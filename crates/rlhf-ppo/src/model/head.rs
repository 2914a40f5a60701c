//! Value-head parameter sets and the bundle that caches them.

use ndarray::{Array1, Array2};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Which adapter and value head is live on the shared backbone.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HeadTarget {
    /// Behavior policy adapter with its state-value head
    Default,
    /// Reward-model adapter with its scalar reward head
    Reward,
}

impl HeadTarget {
    pub fn as_str(&self) -> &'static str {
        match self {
            HeadTarget::Default => "default",
            HeadTarget::Reward => "reward",
        }
    }
}

impl fmt::Display for HeadTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Weight `[1, hidden]` and bias `[1]` of a scalar value head (`summary` layer).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HeadWeights {
    pub weight: Array2<f32>,
    pub bias: Array1<f32>,
}

impl HeadWeights {
    pub fn new(weight: Array2<f32>, bias: Array1<f32>) -> Self {
        Self { weight, bias }
    }

    /// All-zero head for the given hidden size.
    pub fn zeros(hidden_size: usize) -> Self {
        Self {
            weight: Array2::zeros((1, hidden_size)),
            bias: Array1::zeros(1),
        }
    }

    pub fn hidden_size(&self) -> usize {
        self.weight.ncols()
    }

    pub fn num_parameters(&self) -> usize {
        self.weight.len() + self.bias.len()
    }
}

/// Named value-head caches persisted on the model object.
///
/// Exactly one entry is loaded into the live head at any time; the others
/// wait here until `adapter::activate` swaps them in.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct HeadBundle {
    heads: HashMap<HeadTarget, HeadWeights>,
}

impl HeadBundle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of `insert`.
    pub fn with(mut self, target: HeadTarget, weights: HeadWeights) -> Self {
        self.heads.insert(target, weights);
        self
    }

    pub fn get(&self, target: HeadTarget) -> Option<&HeadWeights> {
        self.heads.get(&target)
    }

    pub fn insert(&mut self, target: HeadTarget, weights: HeadWeights) {
        self.heads.insert(target, weights);
    }

    pub fn remove(&mut self, target: HeadTarget) -> Option<HeadWeights> {
        self.heads.remove(&target)
    }

    pub fn contains(&self, target: HeadTarget) -> bool {
        self.heads.contains_key(&target)
    }

    pub fn len(&self) -> usize {
        self.heads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heads.is_empty()
    }
}
