//! Small ndarray-backed dual-head model.
//!
//! The hidden state at position `t` is the running mean of the attended token
//! embeddings up to `t`. Each adapter adds its own delta to the shared output
//! projection. Rows never interact, so sub-batched passes match single-row
//! passes exactly.

use super::{DualHeadModel, ForwardOutput, HeadBundle, HeadTarget, HeadWeights, ModelInputs};
use crate::sampler::{sample_from_logits, GenerationConfig, LogitsProcessorList};
use crate::{PpoError, Result};
use ndarray::{Array1, Array2, Array3, ArrayView1, Axis};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

const WEIGHTS_FILE: &str = "adapter_model.json";

#[derive(Serialize, Deserialize)]
struct SavedWeights {
    active: HeadTarget,
    embeddings: Array2<f32>,
    lm_head: Array2<f32>,
    adapters: HashMap<HeadTarget, Array2<f32>>,
    value_head: HeadWeights,
    bundle: HeadBundle,
}

/// Reference `DualHeadModel` used for tests and small experiments.
pub struct TinyCausalLm {
    vocab_size: usize,
    embeddings: Array2<f32>,
    lm_head: Array2<f32>,
    adapters: HashMap<HeadTarget, Array2<f32>>,
    active: HeadTarget,
    value_head: HeadWeights,
    bundle: HeadBundle,
    gradient_checkpointing: bool,
    use_cache: bool,
    forward_calls: AtomicUsize,
    rng: StdRng,
}

impl TinyCausalLm {
    /// Random model with both adapters installed and a reward head cached in
    /// the bundle. The default head is live and not yet cached.
    pub fn new(vocab_size: usize, hidden_size: usize, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut random = |rows: usize, cols: usize| {
            Array2::from_shape_fn((rows, cols), |_| rng.gen_range(-0.5f32..0.5))
        };

        let embeddings = random(vocab_size, hidden_size);
        let lm_head = random(hidden_size, vocab_size);
        let mut adapters = HashMap::new();
        adapters.insert(HeadTarget::Default, random(hidden_size, vocab_size) * 0.1);
        adapters.insert(HeadTarget::Reward, random(hidden_size, vocab_size) * 0.1);

        let value_head = HeadWeights::new(random(1, hidden_size), Array1::zeros(1));
        let reward_head = HeadWeights::new(random(1, hidden_size), Array1::from_elem(1, 0.25));

        Self {
            vocab_size,
            embeddings,
            lm_head,
            adapters,
            active: HeadTarget::Default,
            value_head,
            bundle: HeadBundle::new().with(HeadTarget::Reward, reward_head),
            gradient_checkpointing: false,
            use_cache: false,
            forward_calls: AtomicUsize::new(0),
            rng: StdRng::seed_from_u64(seed.wrapping_add(1)),
        }
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    pub fn hidden_size(&self) -> usize {
        self.embeddings.ncols()
    }

    /// Number of `forward` calls made so far.
    pub fn forward_calls(&self) -> usize {
        self.forward_calls.load(Ordering::Relaxed)
    }

    pub fn gradient_checkpointing(&self) -> bool {
        self.gradient_checkpointing
    }

    pub fn use_cache(&self) -> bool {
        self.use_cache
    }

    /// Restore a model written by `save_pretrained`.
    pub fn from_pretrained(dir: &Path, seed: u64) -> Result<Self> {
        let file = fs::File::open(dir.join(WEIGHTS_FILE))?;
        let saved: SavedWeights = serde_json::from_reader(file)?;
        Ok(Self {
            vocab_size: saved.embeddings.nrows(),
            embeddings: saved.embeddings,
            lm_head: saved.lm_head,
            adapters: saved.adapters,
            active: saved.active,
            value_head: saved.value_head,
            bundle: saved.bundle,
            gradient_checkpointing: false,
            use_cache: false,
            forward_calls: AtomicUsize::new(0),
            rng: StdRng::seed_from_u64(seed),
        })
    }

    fn token_index(&self, id: i64) -> Result<usize> {
        usize::try_from(id)
            .ok()
            .filter(|&idx| idx < self.vocab_size)
            .ok_or_else(|| {
                PpoError::Model(format!(
                    "token id {} outside vocabulary of {}",
                    id, self.vocab_size
                ))
            })
    }

    /// Hidden states `[seq_len, hidden]` for one row.
    fn hidden_states(&self, ids: ArrayView1<'_, i64>, mask: ArrayView1<'_, i64>) -> Result<Array2<f32>> {
        let hidden_size = self.hidden_size();
        let mut hidden = Array2::zeros((ids.len(), hidden_size));
        let mut running = Array1::<f32>::zeros(hidden_size);
        let mut attended = 0usize;

        for (t, (&id, &m)) in ids.iter().zip(mask.iter()).enumerate() {
            let embedding = self.embeddings.row(self.token_index(id)?);
            if m != 0 {
                running += &embedding;
                attended += 1;
                hidden.row_mut(t).assign(&(&running / attended as f32));
            } else {
                hidden.row_mut(t).assign(&embedding);
            }
        }
        Ok(hidden)
    }

    fn projection(&self) -> Result<Array2<f32>> {
        let delta = self.adapters.get(&self.active).ok_or_else(|| {
            PpoError::Model(format!("adapter `{}` is not installed", self.active))
        })?;
        Ok(&self.lm_head + delta)
    }

    fn values_for(&self, hidden: &Array2<f32>) -> Array1<f32> {
        hidden.dot(&self.value_head.weight.row(0)) + self.value_head.bias[0]
    }
}

impl DualHeadModel for TinyCausalLm {
    fn forward(&self, inputs: &ModelInputs) -> Result<ForwardOutput> {
        self.forward_calls.fetch_add(1, Ordering::Relaxed);

        let (batch, seq_len) = inputs.input_ids.dim();
        let projection = self.projection()?;
        let mut logits = Array3::zeros((batch, seq_len, self.vocab_size));
        let mut values = Array2::zeros((batch, seq_len));

        for (i, (ids, mask)) in inputs
            .input_ids
            .outer_iter()
            .zip(inputs.attention_mask.outer_iter())
            .enumerate()
        {
            let hidden = self.hidden_states(ids, mask)?;
            logits
                .index_axis_mut(Axis(0), i)
                .assign(&hidden.dot(&projection));
            values.row_mut(i).assign(&self.values_for(&hidden));
        }

        Ok(ForwardOutput { logits, values })
    }

    fn generate(
        &mut self,
        inputs: &ModelInputs,
        config: &GenerationConfig,
        processors: &LogitsProcessorList,
    ) -> Result<Array2<i64>> {
        let projection = self.projection()?;
        let prompt_len = inputs.seq_len();
        if prompt_len == 0 {
            return Err(PpoError::Validation("cannot generate from empty prompts".into()));
        }
        let mut rows = Vec::with_capacity(inputs.batch_size());

        for (ids, mask) in inputs
            .input_ids
            .outer_iter()
            .zip(inputs.attention_mask.outer_iter())
        {
            let mut context: Vec<i64> = ids.to_vec();
            let mut context_mask: Vec<i64> = mask.to_vec();
            let mut generated = Vec::new();

            for _ in 0..config.max_new_tokens {
                let hidden = self.hidden_states(
                    ArrayView1::from(&context[..]),
                    ArrayView1::from(&context_mask[..]),
                )?;
                let last = hidden.row(hidden.nrows() - 1);
                let mut scores = last.dot(&projection).to_vec();
                processors.process(&context, &mut scores);

                let token = sample_from_logits(&scores, config, &mut self.rng)?;
                generated.push(token);
                context.push(token);
                context_mask.push(1);
                if token == config.eos_token_id {
                    break;
                }
            }
            rows.push(generated);
        }

        let new_len = rows.iter().map(Vec::len).max().unwrap_or(0);
        let mut output = Array2::from_elem((rows.len(), prompt_len + new_len), config.pad_token_id);
        for (i, generated) in rows.iter().enumerate() {
            for (t, &id) in inputs.input_ids.row(i).iter().chain(generated).enumerate() {
                output[[i, t]] = id;
            }
        }
        Ok(output)
    }

    fn active_adapter(&self) -> HeadTarget {
        self.active
    }

    fn set_adapter(&mut self, target: HeadTarget) -> Result<()> {
        if !self.adapters.contains_key(&target) {
            return Err(PpoError::Config(format!(
                "adapter `{}` is not installed on the backbone",
                target
            )));
        }
        self.active = target;
        Ok(())
    }

    fn value_head(&self) -> HeadWeights {
        self.value_head.clone()
    }

    fn load_value_head(&mut self, weights: &HeadWeights) -> Result<()> {
        if weights.weight.dim() != self.value_head.weight.dim()
            || weights.bias.len() != self.value_head.bias.len()
        {
            return Err(PpoError::ShapeMismatch {
                expected: vec![1, self.hidden_size()],
                actual: vec![weights.weight.nrows(), weights.weight.ncols()],
            });
        }
        self.value_head = weights.clone();
        Ok(())
    }

    fn head_bundle(&self) -> &HeadBundle {
        &self.bundle
    }

    fn head_bundle_mut(&mut self) -> &mut HeadBundle {
        &mut self.bundle
    }

    fn set_gradient_checkpointing(&mut self, enabled: bool) {
        self.gradient_checkpointing = enabled;
    }

    fn set_use_cache(&mut self, enabled: bool) {
        self.use_cache = enabled;
    }

    fn num_trainable_parameters(&self) -> usize {
        self.adapters.values().map(|a| a.len()).sum::<usize>() + self.value_head.num_parameters()
    }

    fn save_pretrained(&self, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir)?;
        let saved = SavedWeights {
            active: self.active,
            embeddings: self.embeddings.clone(),
            lm_head: self.lm_head.clone(),
            adapters: self.adapters.clone(),
            value_head: self.value_head.clone(),
            bundle: self.bundle.clone(),
        };
        let file = fs::File::create(dir.join(WEIGHTS_FILE))?;
        serde_json::to_writer_pretty(file, &saved)?;
        Ok(())
    }
}
