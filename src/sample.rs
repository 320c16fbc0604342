//! Next-token selection read directly from merged or partitioned logits.
//!
//! Shards are never concatenated: each keeps its vocabulary offset and the
//! selection runs over all of them as one distribution.

use crate::error::{QwenError, Result};
use crate::model::Logits;
use crate::tensor::Tensor;
use rand::{Rng, RngExt};

/// Decoding policy for one generation step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplingParams {
    /// 0 selects greedily
    pub temperature: f32,
    /// Nucleus mass; values outside `(0, 1)` disable truncation
    pub top_p: f32,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: 1.0,
            top_p: 0.9,
        }
    }
}

#[derive(Clone, Copy)]
struct Candidate {
    id: usize,
    weight: f32,
}

/// Last-position row of batch item 0 from every shard, with the vocabulary
/// offset of the shard's first id.
fn shard_rows(logits: &Logits) -> Result<Vec<(usize, Vec<f32>)>> {
    let parts: &[Tensor] = match logits {
        Logits::Merged(t) => std::slice::from_ref(t),
        Logits::Split(parts) => parts,
    };
    let mut offset = 0;
    let mut rows = Vec::with_capacity(parts.len());
    for part in parts {
        let (seq_len, width) = match part.shape() {
            [_, s, w] if *s > 0 => (*s, *w),
            other => {
                return Err(QwenError::Shape(format!(
                    "logits must be [B, S, V] with S > 0, got {:?}",
                    other
                )));
            }
        };
        let start = (seq_len - 1) * width;
        let row = part.data()[start..start + width].iter().map(|v| v.to_f32()).collect();
        rows.push((offset, row));
        offset += width;
    }
    Ok(rows)
}

/// Highest-scoring id: per-shard maximum, then the best shard by value.
pub fn greedy(logits: &Logits) -> Result<usize> {
    let mut best: Option<(usize, f32)> = None;
    for (offset, row) in shard_rows(logits)? {
        for (i, &v) in row.iter().enumerate() {
            if best.is_none_or(|(_, b)| v > b) {
                best = Some((offset + i, v));
            }
        }
    }
    best.map(|(id, _)| id)
        .ok_or_else(|| QwenError::Shape("empty logits".to_string()))
}

/// Draw the next token id from the last position of `logits`.
///
/// Weights are `exp((l - max) / temperature)` with `max` taken across all
/// shards, so a partitioned head samples the same distribution as the
/// merged one.
pub fn sample<R: Rng>(logits: &Logits, params: SamplingParams, rng: &mut R) -> Result<usize> {
    if params.temperature <= 0.0 {
        return greedy(logits);
    }
    let rows = shard_rows(logits)?;
    let max = rows
        .iter()
        .flat_map(|(_, row)| row.iter().copied())
        .fold(f32::NEG_INFINITY, f32::max);
    if !max.is_finite() {
        return greedy(logits);
    }

    let mut candidates: Vec<Candidate> = rows
        .iter()
        .flat_map(|(offset, row)| {
            row.iter().enumerate().map(move |(i, &l)| Candidate {
                id: offset + i,
                weight: ((l - max) / params.temperature).exp(),
            })
        })
        .collect();
    let mut total: f32 = candidates.iter().map(|c| c.weight).sum();

    // Nucleus truncation
    if params.top_p > 0.0 && params.top_p < 1.0 {
        candidates.sort_by(|a, b| b.weight.total_cmp(&a.weight));
        let cutoff = params.top_p * total;
        let mut kept = 0.0f32;
        let mut keep = candidates.len();
        for (i, c) in candidates.iter().enumerate() {
            kept += c.weight;
            if kept > cutoff {
                keep = i + 1;
                break;
            }
        }
        candidates.truncate(keep);
        total = kept;
    }

    let r = rng.random::<f32>() * total;
    let mut cdf = 0.0f32;
    for c in &candidates {
        cdf += c.weight;
        if r < cdf {
            return Ok(c.id);
        }
    }
    candidates
        .last()
        .map(|c| c.id)
        .ok_or_else(|| QwenError::Shape("empty logits".to_string()))
}
