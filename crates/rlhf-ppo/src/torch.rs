//! libtorch-backed value head and log-prob gathering.
//!
//! Building blocks for a tch-backed `DualHeadModel`: `TchValueHead` converts
//! to and from `HeadWeights`, so its parameters can live in a `HeadBundle`
//! and be swapped by `adapter::activate`. This module does not provide a
//! model of its own.

use crate::model::HeadWeights;
use crate::{PpoError, Result};
use ndarray::{Array1, Array2};
use tch::{nn, nn::Module, Kind, Tensor};

/// Scalar value head: a `summary` linear layer from hidden size to 1.
pub struct TchValueHead {
    summary: nn::Linear,
    hidden_size: i64,
}

impl TchValueHead {
    pub fn new(vs: &nn::Path, hidden_size: i64) -> Self {
        Self {
            summary: nn::linear(vs / "summary", hidden_size, 1, Default::default()),
            hidden_size,
        }
    }

    pub fn hidden_size(&self) -> i64 {
        self.hidden_size
    }

    /// `[batch, seq, hidden]` hidden states to `[batch, seq]` values.
    pub fn forward(&self, hidden: &Tensor) -> Tensor {
        self.summary.forward(hidden).squeeze_dim(-1)
    }

    /// Copy of the current weights.
    pub fn state(&self) -> Result<HeadWeights> {
        let weight = array2_from_tensor(&self.summary.ws)?;
        let bias = match &self.summary.bs {
            Some(bs) => Array1::from(Vec::<f32>::try_from(&bs.to_kind(Kind::Float))?),
            None => Array1::zeros(1),
        };
        Ok(HeadWeights::new(weight, bias))
    }

    /// Overwrite the weights in place, outside the autograd graph.
    pub fn load_state(&mut self, weights: &HeadWeights) -> Result<()> {
        if weights.hidden_size() as i64 != self.hidden_size || weights.bias.len() != 1 {
            return Err(PpoError::ShapeMismatch {
                expected: vec![1, self.hidden_size as usize],
                actual: vec![weights.weight.nrows(), weights.weight.ncols()],
            });
        }

        let ws = tensor_from_array2(&weights.weight);
        let bs = Tensor::from_slice(weights.bias.as_slice().unwrap_or(&[0.0]));
        tch::no_grad(|| {
            self.summary.ws.copy_(&ws);
            if let Some(ref mut b) = self.summary.bs {
                b.copy_(&bs);
            }
        });
        Ok(())
    }
}

/// `log_softmax(logits).gather(labels)` for `[batch, steps, vocab]` logits and
/// `[batch, steps]` int64 labels.
pub fn logprobs_from_logits(logits: &Tensor, labels: &Tensor) -> Tensor {
    logits
        .log_softmax(-1, Kind::Float)
        .gather(-1, &labels.unsqueeze(-1), false)
        .squeeze_dim(-1)
}

pub fn tensor_from_array2(array: &Array2<f32>) -> Tensor {
    let (rows, cols) = array.dim();
    let data: Vec<f32> = array.iter().copied().collect();
    Tensor::from_slice(&data).reshape([rows as i64, cols as i64])
}

pub fn array2_from_tensor(tensor: &Tensor) -> Result<Array2<f32>> {
    let size = tensor.size();
    if size.len() != 2 {
        return Err(PpoError::ShapeMismatch {
            expected: vec![2],
            actual: vec![size.len()],
        });
    }
    let data = Vec::<f32>::try_from(&tensor.to_kind(Kind::Float).flatten(0, -1))?;
    Ok(Array2::from_shape_vec((size[0] as usize, size[1] as usize), data)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use tch::Device;

    #[test]
    fn test_value_head_shapes() {
        let vs = nn::VarStore::new(Device::Cpu);
        let head = TchValueHead::new(&vs.root(), 4);
        let hidden = Tensor::randn([2, 3, 4], (Kind::Float, Device::Cpu));
        assert_eq!(head.forward(&hidden).size(), vec![2, 3]);
    }

    #[test]
    fn test_state_round_trip() {
        let vs = nn::VarStore::new(Device::Cpu);
        let mut head = TchValueHead::new(&vs.root(), 3);
        let weights = HeadWeights::new(array![[0.5, -1.0, 2.0]], array![0.25]);

        head.load_state(&weights).unwrap();
        assert_eq!(head.state().unwrap(), weights);

        let hidden = Tensor::from_slice(&[1.0f32, 1.0, 1.0]).reshape([1, 1, 3]);
        let value = f64::try_from(head.forward(&hidden).sum(Kind::Float)).unwrap();
        assert!((value - 1.75).abs() < 1e-6);
    }

    #[test]
    fn test_load_state_rejects_wrong_hidden_size() {
        let vs = nn::VarStore::new(Device::Cpu);
        let mut head = TchValueHead::new(&vs.root(), 3);
        let weights = HeadWeights::zeros(5);
        assert!(head.load_state(&weights).is_err());
    }

    #[test]
    fn test_tensor_gather_matches_ndarray() {
        let logits = array![[[2.0f32, 0.0, -1.0], [0.5, 0.5, 0.5]]];
        let labels = array![[0i64, 2]];

        let expected = crate::scorer::logprobs_from_logits(logits.view(), labels.view()).unwrap();

        let logits_t = Tensor::from_slice(logits.as_slice().unwrap()).reshape([1, 2, 3]);
        let labels_t = Tensor::from_slice(labels.as_slice().unwrap()).reshape([1, 2]);
        let got = array2_from_tensor(&logprobs_from_logits(&logits_t, &labels_t)).unwrap();

        for (a, b) in expected.iter().zip(got.iter()) {
            assert!((a - b).abs() < 1e-5);
        }
    }
}
