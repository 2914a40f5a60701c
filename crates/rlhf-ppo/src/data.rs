//! Prompt batches and the recycling iterator the trainer pulls from.

use crate::model::ModelInputs;
use crate::{PpoError, Result};
use ndarray::Array2;

/// One batch of left-padded prompts.
#[derive(Clone, Debug, PartialEq)]
pub struct Batch {
    pub input_ids: Array2<i64>,
    pub attention_mask: Array2<i64>,
}

impl Batch {
    /// Batch whose attention mask covers every non-padding token.
    pub fn from_ids(input_ids: Array2<i64>, pad_token_id: i64) -> Self {
        let inputs = ModelInputs::from_ids(input_ids, pad_token_id);
        Self {
            input_ids: inputs.input_ids,
            attention_mask: inputs.attention_mask,
        }
    }

    pub fn batch_size(&self) -> usize {
        self.input_ids.nrows()
    }

    pub fn to_model_inputs(&self) -> Result<ModelInputs> {
        ModelInputs::new(self.input_ids.clone(), self.attention_mask.clone())
    }
}

/// Source of prompt batches for one pass over the dataset.
pub trait Dataloader {
    /// Number of batches in one pass
    fn len(&self) -> usize;

    /// Number of examples in the underlying dataset
    fn num_examples(&self) -> usize;

    /// Batch at `index` (`0..len()`) of the current pass.
    fn batch(&self, index: usize) -> Result<Batch>;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Batches held in memory.
#[derive(Clone, Debug)]
pub struct InMemoryDataloader {
    batches: Vec<Batch>,
    num_examples: usize,
}

impl InMemoryDataloader {
    pub fn new(batches: Vec<Batch>) -> Self {
        let num_examples = batches.iter().map(Batch::batch_size).sum();
        Self {
            batches,
            num_examples,
        }
    }

    /// Collate raw prompts into left-padded batches of `batch_size` rows.
    ///
    /// A trailing partial batch is dropped so every batch has the same size.
    pub fn from_prompts(prompts: &[Vec<i64>], batch_size: usize, pad_token_id: i64) -> Result<Self> {
        if batch_size == 0 || prompts.len() < batch_size {
            return Err(PpoError::Config(format!(
                "need at least one full batch of {} prompts, got {}",
                batch_size,
                prompts.len()
            )));
        }

        let batches = prompts
            .chunks_exact(batch_size)
            .map(|chunk| {
                let width = chunk.iter().map(Vec::len).max().unwrap_or(0);
                let mut ids = Array2::from_elem((chunk.len(), width), pad_token_id);
                for (i, prompt) in chunk.iter().enumerate() {
                    let offset = width - prompt.len();
                    for (j, &id) in prompt.iter().enumerate() {
                        ids[[i, offset + j]] = id;
                    }
                }
                Batch::from_ids(ids, pad_token_id)
            })
            .collect();

        Ok(Self {
            batches,
            num_examples: prompts.len(),
        })
    }
}

impl Dataloader for InMemoryDataloader {
    fn len(&self) -> usize {
        self.batches.len()
    }

    fn num_examples(&self) -> usize {
        self.num_examples
    }

    fn batch(&self, index: usize) -> Result<Batch> {
        self.batches.get(index).cloned().ok_or_else(|| {
            PpoError::Config(format!(
                "batch index {} out of range for {} batches",
                index,
                self.batches.len()
            ))
        })
    }
}

/// Endless stream over a dataloader: when a pass is exhausted the next
/// batch starts a new pass from the beginning.
pub struct RecyclingIterator<D: Dataloader> {
    loader: D,
    position: usize,
    passes: usize,
}

impl<D: Dataloader> RecyclingIterator<D> {
    pub fn new(loader: D) -> Self {
        Self {
            loader,
            position: 0,
            passes: 0,
        }
    }

    pub fn loader(&self) -> &D {
        &self.loader
    }

    /// Completed passes over the dataloader.
    pub fn passes(&self) -> usize {
        self.passes
    }

    pub fn next_batch(&mut self) -> Result<Batch> {
        if self.loader.is_empty() {
            return Err(PpoError::Config("dataloader yields no batches".into()));
        }
        if self.position == self.loader.len() {
            self.position = 0;
            self.passes += 1;
            tracing::debug!(passes = self.passes, "Restarting data iterator");
        }
        let batch = self.loader.batch(self.position)?;
        self.position += 1;
        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_from_prompts_left_pads_and_drops_tail() {
        let prompts = vec![vec![1, 5], vec![1, 6, 7], vec![1, 8], vec![1, 9], vec![1]];
        let loader = InMemoryDataloader::from_prompts(&prompts, 2, 0).unwrap();

        assert_eq!(loader.len(), 2);
        assert_eq!(loader.num_examples(), 5);

        let first = loader.batch(0).unwrap();
        assert_eq!(first.input_ids, array![[0, 1, 5], [1, 6, 7]]);
        assert_eq!(first.attention_mask, array![[0, 1, 1], [1, 1, 1]]);
    }

    #[test]
    fn test_from_prompts_needs_full_batch() {
        assert!(InMemoryDataloader::from_prompts(&[vec![1]], 2, 0).is_err());
        assert!(InMemoryDataloader::from_prompts(&[vec![1]], 0, 0).is_err());
    }

    #[test]
    fn test_recycling_restarts_after_exhaustion() {
        let batches = (0..3)
            .map(|i| Batch::from_ids(array![[1, 10 + i]], 0))
            .collect();
        let mut iter = RecyclingIterator::new(InMemoryDataloader::new(batches));

        let seen: Vec<i64> = (0..7)
            .map(|_| iter.next_batch().unwrap().input_ids[[0, 1]])
            .collect();

        assert_eq!(seen, vec![10, 11, 12, 10, 11, 12, 10]);
        assert_eq!(iter.passes(), 2);
    }

    #[test]
    fn test_empty_loader_is_config_error() {
        let mut iter = RecyclingIterator::new(InMemoryDataloader::new(Vec::new()));
        assert!(matches!(iter.next_batch(), Err(PpoError::Config(_))));
    }
}
