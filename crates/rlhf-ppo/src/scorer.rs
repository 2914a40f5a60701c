//! Mini-batched forward passes for the PPO step.
//!
//! Peak memory of a forward pass grows with rows × sequence length × vocabulary,
//! so the batch is scored `mini_batch_size` rows at a time and stitched back
//! together in the original row order.

use crate::model::{DualHeadModel, ModelInputs};
use crate::sequence::MIN_RESPONSE_LEN;
use crate::{PpoError, Result};
use ndarray::{concatenate, s, Array1, Array2, Array3, ArrayView1, ArrayView2, ArrayView3, Axis};

/// Model outputs for a batch of query+response rows.
///
/// Every field covers `seq_len - 1` time steps: position `t` scores the token
/// observed at `t + 1`, so the last position has nothing to score.
#[derive(Clone, Debug)]
pub struct ScoredBatch {
    /// Log-probability of the next observed token `[batch, seq_len - 1]`
    pub logprobs: Array2<f32>,
    /// Raw logits `[batch, seq_len - 1, vocab]`
    pub logits: Array3<f32>,
    /// Value estimates `[batch, seq_len - 1]`
    pub values: Array2<f32>,
    /// 1 from the first BOS token onwards, 0 before it `[batch, seq_len - 1]`
    pub masks: Array2<i64>,
}

impl ScoredBatch {
    pub fn batch_size(&self) -> usize {
        self.logprobs.nrows()
    }

    /// Number of scored time steps (`seq_len - 1`).
    pub fn len(&self) -> usize {
        self.logprobs.ncols()
    }

    pub fn is_empty(&self) -> bool {
        self.logprobs.is_empty()
    }
}

/// `log_softmax(logits)[labels]` along the vocabulary axis.
///
/// `logits` is `[batch, steps, vocab]`, `labels` is `[batch, steps]`.
pub fn logprobs_from_logits(
    logits: ArrayView3<'_, f32>,
    labels: ArrayView2<'_, i64>,
) -> Result<Array2<f32>> {
    let (batch, steps, vocab) = logits.dim();
    if labels.dim() != (batch, steps) {
        return Err(PpoError::ShapeMismatch {
            expected: vec![batch, steps],
            actual: vec![labels.nrows(), labels.ncols()],
        });
    }

    let mut out = Array2::zeros((batch, steps));
    for b in 0..batch {
        for t in 0..steps {
            let row = logits.slice(s![b, t, ..]);
            let label = labels[[b, t]];
            let idx = usize::try_from(label)
                .ok()
                .filter(|&i| i < vocab)
                .ok_or_else(|| {
                    PpoError::Model(format!(
                        "label {} outside vocabulary of {}",
                        label, vocab
                    ))
                })?;
            out[[b, t]] = row[idx] - log_sum_exp(row);
        }
    }
    Ok(out)
}

fn log_sum_exp(row: ArrayView1<'_, f32>) -> f32 {
    let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    if max == f32::NEG_INFINITY {
        return max;
    }
    max + row.iter().map(|x| (x - max).exp()).sum::<f32>().ln()
}

/// Mask of one row: 1 on `[start, len)` where `start` is the first BOS token.
///
/// Fails with `PpoError::Validation` when the row has no BOS token or fewer
/// than two positions from it to the end of the row.
pub fn response_mask(input_ids: ArrayView1<'_, i64>, bos_token_id: i64) -> Result<Array1<i64>> {
    let start = input_ids
        .iter()
        .position(|&id| id == bos_token_id)
        .ok_or_else(|| PpoError::Validation("row has no BOS token to anchor the mask".into()))?;

    let marked = input_ids.len() - start;
    if marked < MIN_RESPONSE_LEN {
        return Err(PpoError::Validation(format!(
            "response too short: {} position(s) after BOS, need at least {}",
            marked, MIN_RESPONSE_LEN
        )));
    }

    let mut mask = Array1::zeros(input_ids.len());
    mask.slice_mut(s![start..]).fill(1);
    Ok(mask)
}

/// Score `inputs` in sub-batches of `mini_batch_size` rows.
///
/// `mini_batch_size` must evenly divide the batch size; a tail would
/// otherwise be dropped without notice.
pub fn batched_forward_pass<M: DualHeadModel + ?Sized>(
    model: &M,
    inputs: &ModelInputs,
    mini_batch_size: usize,
    bos_token_id: i64,
) -> Result<ScoredBatch> {
    let batch_size = inputs.batch_size();
    let seq_len = inputs.seq_len();

    if mini_batch_size == 0 || batch_size % mini_batch_size != 0 {
        return Err(PpoError::Config(format!(
            "mini batch size {} must evenly divide batch size {}",
            mini_batch_size, batch_size
        )));
    }
    if seq_len < MIN_RESPONSE_LEN {
        return Err(PpoError::Validation(format!(
            "response too short: sequences have {} token(s), need at least {}",
            seq_len, MIN_RESPONSE_LEN
        )));
    }

    let num_mini_batches = batch_size / mini_batch_size;
    let mut all_logprobs = Vec::with_capacity(num_mini_batches);
    let mut all_logits = Vec::with_capacity(num_mini_batches);
    let mut all_values = Vec::with_capacity(num_mini_batches);
    let mut all_masks = Vec::with_capacity(num_mini_batches);

    for i in 0..num_mini_batches {
        let sub = inputs.rows(i * mini_batch_size, (i + 1) * mini_batch_size);
        let output = model.forward(&sub)?;

        let (rows, steps, _) = output.logits.dim();
        if rows != mini_batch_size || steps != seq_len || output.values.dim() != (rows, steps) {
            return Err(PpoError::ShapeMismatch {
                expected: vec![mini_batch_size, seq_len],
                actual: vec![rows, steps],
            });
        }

        let logprobs = logprobs_from_logits(
            output.logits.slice(s![.., ..seq_len - 1, ..]),
            sub.input_ids.slice(s![.., 1..]),
        )?;

        let mut masks = Array2::zeros((mini_batch_size, seq_len));
        for (j, row) in sub.input_ids.outer_iter().enumerate() {
            masks.row_mut(j).assign(&response_mask(row, bos_token_id)?);
        }

        tracing::debug!(mini_batch = i, rows = mini_batch_size, "Scored mini batch");

        all_logprobs.push(logprobs);
        all_logits.push(output.logits);
        all_values.push(output.values);
        all_masks.push(masks);
    }

    let logprobs = concat_rows(&all_logprobs)?;
    let logits = concatenate(
        Axis(0),
        &all_logits.iter().map(|a| a.view()).collect::<Vec<_>>(),
    )?;
    let values = concat_rows(&all_values)?;
    let masks = concat_rows(&all_masks)?;

    Ok(ScoredBatch {
        logprobs,
        logits: logits.slice(s![.., ..seq_len - 1, ..]).to_owned(),
        values: values.slice(s![.., ..seq_len - 1]).to_owned(),
        masks: masks.slice(s![.., ..seq_len - 1]).to_owned(),
    })
}

fn concat_rows<A: Clone>(parts: &[Array2<A>]) -> Result<Array2<A>> {
    let views: Vec<_> = parts.iter().map(|a| a.view()).collect();
    Ok(concatenate(Axis(0), &views)?)
}
