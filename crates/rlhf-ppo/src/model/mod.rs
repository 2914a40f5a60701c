//! Dual-head causal language models.
//!
//! Provides:
//! - `DualHeadModel` - the backbone + adapters + value heads consumed by the trainer
//! - `HeadBundle` / `HeadWeights` / `HeadTarget` - cached value-head parameter sets
//! - `TinyCausalLm` - a small ndarray-backed reference implementation

mod head;
mod tiny;

pub use head::{HeadBundle, HeadTarget, HeadWeights};
pub use tiny::TinyCausalLm;

use crate::sampler::{GenerationConfig, LogitsProcessorList};
use crate::{PpoError, Result};
use ndarray::{s, Array2, Array3};
use std::path::Path;

/// Token ids and attention mask for a batch of rows, both `[batch, seq_len]`.
#[derive(Clone, Debug, PartialEq)]
pub struct ModelInputs {
    pub input_ids: Array2<i64>,
    pub attention_mask: Array2<i64>,
}

impl ModelInputs {
    pub fn new(input_ids: Array2<i64>, attention_mask: Array2<i64>) -> Result<Self> {
        if input_ids.dim() != attention_mask.dim() {
            let (b, t) = input_ids.dim();
            let (mb, mt) = attention_mask.dim();
            return Err(PpoError::ShapeMismatch {
                expected: vec![b, t],
                actual: vec![mb, mt],
            });
        }
        Ok(Self {
            input_ids,
            attention_mask,
        })
    }

    /// Inputs whose attention mask marks every non-`pad_token_id` position.
    pub fn from_ids(input_ids: Array2<i64>, pad_token_id: i64) -> Self {
        let attention_mask = input_ids.mapv(|id| i64::from(id != pad_token_id));
        Self {
            input_ids,
            attention_mask,
        }
    }

    pub fn batch_size(&self) -> usize {
        self.input_ids.nrows()
    }

    pub fn seq_len(&self) -> usize {
        self.input_ids.ncols()
    }

    /// Rows `start..end` as an owned sub-batch.
    pub fn rows(&self, start: usize, end: usize) -> Self {
        Self {
            input_ids: self.input_ids.slice(s![start..end, ..]).to_owned(),
            attention_mask: self.attention_mask.slice(s![start..end, ..]).to_owned(),
        }
    }
}

/// Output of a full forward pass.
#[derive(Clone, Debug)]
pub struct ForwardOutput {
    /// Next-token logits `[batch, seq_len, vocab]`
    pub logits: Array3<f32>,
    /// Value-head output `[batch, seq_len]`
    pub values: Array2<f32>,
}

/// A causal LM with one shared backbone, switchable low-rank adapters and a
/// live scalar value head whose parameters can be swapped with the cached
/// sets in its `HeadBundle`.
///
/// The active adapter and the live value head belong together: callers go
/// through `adapter::activate` (or `with_active_head`) rather than mutating
/// them independently.
pub trait DualHeadModel {
    /// Forward pass over the full batch.
    fn forward(&self, inputs: &ModelInputs) -> Result<ForwardOutput>;

    /// Autoregressive sampling. Returns `[batch, prompt_len + new_tokens]`,
    /// right-padded with `config.pad_token_id`.
    ///
    /// Implementations must not track gradients here.
    fn generate(
        &mut self,
        inputs: &ModelInputs,
        config: &GenerationConfig,
        processors: &LogitsProcessorList,
    ) -> Result<Array2<i64>>;

    /// Adapter currently selected on the backbone.
    fn active_adapter(&self) -> HeadTarget;

    /// Make `target` the sole active adapter.
    fn set_adapter(&mut self, target: HeadTarget) -> Result<()>;

    /// Copy of the live value head parameters.
    fn value_head(&self) -> HeadWeights;

    /// Overwrite the live value head parameters.
    fn load_value_head(&mut self, weights: &HeadWeights) -> Result<()>;

    fn head_bundle(&self) -> &HeadBundle;

    fn head_bundle_mut(&mut self) -> &mut HeadBundle;

    fn set_gradient_checkpointing(&mut self, enabled: bool);

    /// Toggle key-value caching during decoding.
    fn set_use_cache(&mut self, enabled: bool);

    fn is_encoder_decoder(&self) -> bool {
        false
    }

    fn num_trainable_parameters(&self) -> usize;

    /// Persist adapters and value heads under `dir`.
    fn save_pretrained(&self, dir: &Path) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_model_inputs_from_ids_masks_padding() {
        let inputs = ModelInputs::from_ids(array![[0, 0, 5, 6], [0, 7, 8, 9]], 0);
        assert_eq!(inputs.attention_mask, array![[0, 0, 1, 1], [0, 1, 1, 1]]);
        assert_eq!(inputs.batch_size(), 2);
        assert_eq!(inputs.seq_len(), 4);
    }

    #[test]
    fn test_model_inputs_shape_mismatch() {
        let err = ModelInputs::new(array![[1, 2, 3]], array![[1, 1]]).unwrap_err();
        assert!(matches!(err, PpoError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_model_inputs_rows() {
        let inputs = ModelInputs::from_ids(array![[1, 2], [3, 4], [5, 6], [7, 8]], 0);
        let sub = inputs.rows(2, 4);
        assert_eq!(sub.input_ids, array![[5, 6], [7, 8]]);
        assert_eq!(sub.batch_size(), 2);
    }
}
