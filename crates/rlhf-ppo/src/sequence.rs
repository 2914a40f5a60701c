//! Query/response post-processing and model-input collation.

use crate::model::ModelInputs;
use crate::{PpoError, Result};
use ndarray::{Array2, ArrayView1};
use serde::{Deserialize, Serialize};

/// Minimum number of tokens kept for a response.
pub const MIN_RESPONSE_LEN: usize = 2;

/// Special token ids supplied by the tokenizer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpecialTokens {
    pub pad_token_id: i64,
    pub eos_token_id: i64,
    pub bos_token_id: i64,
}

impl Default for SpecialTokens {
    /// LLaMA tokenizer ids (pad reuses unk).
    fn default() -> Self {
        Self {
            pad_token_id: 0,
            bos_token_id: 1,
            eos_token_id: 2,
        }
    }
}

/// Strip left padding from a query row.
pub fn trim_query(row: ArrayView1<'_, i64>, pad_token_id: i64) -> Result<Vec<i64>> {
    let start = row.iter().position(|&id| id != pad_token_id).ok_or_else(|| {
        PpoError::Validation("query row contains only padding tokens".into())
    })?;
    Ok(row.iter().skip(start).copied().collect())
}

/// Strip right padding from a response row.
///
/// Responses shorter than `MIN_RESPONSE_LEN` after trimming become
/// `[eos, eos]`.
pub fn trim_response(row: ArrayView1<'_, i64>, tokens: &SpecialTokens) -> Vec<i64> {
    let len = row
        .iter()
        .rposition(|&id| id != tokens.pad_token_id)
        .map_or(0, |last| last + 1);

    if len < MIN_RESPONSE_LEN {
        vec![tokens.eos_token_id; MIN_RESPONSE_LEN]
    } else {
        row.iter().take(len).copied().collect()
    }
}

/// Trim every (query, response) row pair of a generation step.
pub fn trim_batch(
    queries: &Array2<i64>,
    responses: &Array2<i64>,
    tokens: &SpecialTokens,
) -> Result<(Vec<Vec<i64>>, Vec<Vec<i64>>)> {
    if queries.nrows() != responses.nrows() {
        return Err(PpoError::ShapeMismatch {
            expected: vec![queries.nrows()],
            actual: vec![responses.nrows()],
        });
    }

    let mut trimmed_queries = Vec::with_capacity(queries.nrows());
    let mut trimmed_responses = Vec::with_capacity(responses.nrows());
    for (query, response) in queries.outer_iter().zip(responses.outer_iter()) {
        trimmed_queries.push(trim_query(query, tokens.pad_token_id)?);
        trimmed_responses.push(trim_response(response, tokens));
    }

    Ok((trimmed_queries, trimmed_responses))
}

/// Concatenate each query with its response and left-pad the batch to the
/// longest row. The attention mask covers the concatenated tokens only.
pub fn prepare_model_inputs(
    queries: &[Vec<i64>],
    responses: &[Vec<i64>],
    pad_token_id: i64,
) -> Result<ModelInputs> {
    if queries.len() != responses.len() {
        return Err(PpoError::ShapeMismatch {
            expected: vec![queries.len()],
            actual: vec![responses.len()],
        });
    }
    if queries.is_empty() {
        return Err(PpoError::Validation("cannot collate an empty batch".into()));
    }

    let width = queries
        .iter()
        .zip(responses)
        .map(|(q, r)| q.len() + r.len())
        .max()
        .unwrap_or(0);

    let rows = queries.len();
    let mut input_ids = Array2::from_elem((rows, width), pad_token_id);
    let mut attention_mask = Array2::zeros((rows, width));

    for (i, (query, response)) in queries.iter().zip(responses).enumerate() {
        let offset = width - query.len() - response.len();
        for (j, &id) in query.iter().chain(response.iter()).enumerate() {
            input_ids[[i, offset + j]] = id;
            attention_mask[[i, offset + j]] = 1;
        }
    }

    ModelInputs::new(input_ids, attention_mask)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn tokens() -> SpecialTokens {
        SpecialTokens::default()
    }

    #[test]
    fn test_trim_query_removes_left_padding() {
        let row = array![0, 0, 1, 7, 8];
        assert_eq!(trim_query(row.view(), 0).unwrap(), vec![1, 7, 8]);
    }

    #[test]
    fn test_trim_query_all_padding_is_error() {
        let row = array![0, 0, 0];
        assert!(matches!(
            trim_query(row.view(), 0),
            Err(PpoError::Validation(_))
        ));
    }

    #[test]
    fn test_trim_response_removes_right_padding() {
        let row = array![9, 10, 2, 0, 0];
        assert_eq!(trim_response(row.view(), &tokens()), vec![9, 10, 2]);
    }

    #[test]
    fn test_trim_response_keeps_inner_padding() {
        let row = array![9, 0, 10, 0];
        assert_eq!(trim_response(row.view(), &tokens()), vec![9, 0, 10]);
    }

    #[test]
    fn test_sentinel_exactly_when_shorter_than_two() {
        let t = tokens();
        assert_eq!(trim_response(array![0, 0, 0].view(), &t), vec![2, 2]);
        assert_eq!(trim_response(array![7, 0, 0].view(), &t), vec![2, 2]);
        assert_eq!(trim_response(array![7, 8, 0].view(), &t), vec![7, 8]);

        let empty = Array2::<i64>::zeros((1, 0));
        assert_eq!(trim_response(empty.row(0), &t), vec![2, 2]);
    }

    #[test]
    fn test_trimmed_responses_have_min_length() {
        let queries = array![[0, 1, 5], [1, 6, 7], [0, 0, 1]];
        let responses = array![[8, 0, 0, 0], [9, 9, 9, 0], [0, 0, 0, 0]];
        let (q, r) = trim_batch(&queries, &responses, &tokens()).unwrap();

        assert_eq!(q, vec![vec![1, 5], vec![1, 6, 7], vec![1]]);
        assert!(r.iter().all(|resp| resp.len() >= MIN_RESPONSE_LEN));
        assert_eq!(r[0], vec![2, 2]);
        assert_eq!(r[1], vec![9, 9, 9]);
    }

    #[test]
    fn test_prepare_model_inputs_left_pads() {
        let queries = vec![vec![1, 5], vec![1, 6, 7]];
        let responses = vec![vec![8, 2], vec![9, 9, 2]];
        let inputs = prepare_model_inputs(&queries, &responses, 0).unwrap();

        assert_eq!(
            inputs.input_ids,
            array![[0, 0, 1, 5, 8, 2], [1, 6, 7, 9, 9, 2]]
        );
        assert_eq!(
            inputs.attention_mask,
            array![[0, 0, 1, 1, 1, 1], [1, 1, 1, 1, 1, 1]]
        );
    }

    #[test]
    fn test_prepare_model_inputs_length_mismatch() {
        let err = prepare_model_inputs(&[vec![1]], &[], 0).unwrap_err();
        assert!(matches!(err, PpoError::ShapeMismatch { .. }));
    }
}
