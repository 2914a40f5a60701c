//! Reward scoring through the reward adapter and head.

use crate::adapter::with_head_restoring;
use crate::model::{DualHeadModel, HeadTarget};
use crate::sequence::prepare_model_inputs;
use crate::{PpoError, Result};
use ndarray::ArrayView2;

/// One reward per row: the reward head's value at the last position of the
/// left-padded query+response.
///
/// The default head is live when this returns, on success or error, even if
/// another head was live on entry.
pub fn compute_rewards<M: DualHeadModel + ?Sized>(
    model: &mut M,
    queries: &[Vec<i64>],
    responses: &[Vec<i64>],
    pad_token_id: i64,
) -> Result<Vec<f32>> {
    let inputs = prepare_model_inputs(queries, responses, pad_token_id)?;
    let values = with_head_restoring(model, HeadTarget::Reward, HeadTarget::Default, |scoring| {
        Ok(scoring.forward(&inputs)?.values)
    })?;
    last_position_values(values.view())
}

/// `values[:, -1]`
pub fn last_position_values(values: ArrayView2<'_, f32>) -> Result<Vec<f32>> {
    let last = values
        .ncols()
        .checked_sub(1)
        .ok_or_else(|| PpoError::Validation("cannot extract rewards from empty values".into()))?;
    Ok(values.column(last).to_vec())
}
