//! Rotary position embeddings.
//!
//! The cosine/sine tables are built once per model for every absolute
//! position up to `max_position_embeddings` and are gathered by explicit
//! position ids at call time, so a decode step can ask for any position.

use crate::config::QwenConfig;
use crate::error::{QwenError, Result};
use crate::tensor::Tensor;
use half::f16;

/// Precomputed cos/sin lookup, `[max_positions, head_dim]` each.
#[derive(Debug, Clone)]
pub struct RotaryTable {
    inv_freq: Vec<f32>,
    cos: Vec<f32>,
    sin: Vec<f32>,
    head_dim: usize,
    max_positions: usize,
}

impl RotaryTable {
    /// Build the tables for `head_dim` with base frequency `theta`.
    pub fn new(head_dim: usize, max_positions: usize, theta: f64) -> Self {
        let half = head_dim / 2;
        let base = theta as f32;
        let inv_freq: Vec<f32> = (0..half)
            .map(|i| 1.0 / base.powf((2 * i) as f32 / head_dim as f32))
            .collect();

        let mut cos = Vec::with_capacity(max_positions * head_dim);
        let mut sin = Vec::with_capacity(max_positions * head_dim);
        for pos in 0..max_positions {
            let freqs: Vec<f32> = inv_freq.iter().map(|f| pos as f32 * f).collect();
            // second half repeats the first
            for _ in 0..2 {
                cos.extend(freqs.iter().map(|v| v.cos()));
                sin.extend(freqs.iter().map(|v| v.sin()));
            }
        }

        RotaryTable {
            inv_freq,
            cos,
            sin,
            head_dim,
            max_positions,
        }
    }

    pub fn from_config(config: &QwenConfig) -> Self {
        Self::new(
            config.head_dim(),
            config.max_position_embeddings,
            config.rope_theta,
        )
    }

    #[inline]
    pub fn head_dim(&self) -> usize {
        self.head_dim
    }

    #[inline]
    pub fn max_positions(&self) -> usize {
        self.max_positions
    }

    pub fn inv_freq(&self) -> &[f32] {
        &self.inv_freq
    }

    /// Cached cosine row for one absolute position.
    pub fn cos_row(&self, pos: usize) -> &[f32] {
        &self.cos[pos * self.head_dim..(pos + 1) * self.head_dim]
    }

    /// Cached sine row for one absolute position.
    pub fn sin_row(&self, pos: usize) -> &[f32] {
        &self.sin[pos * self.head_dim..(pos + 1) * self.head_dim]
    }

    /// Gather `[1, S, D]` cos and sin tensors for the given positions.
    ///
    /// Without position ids the first `seq_len` rows are returned; decode
    /// steps must always pass explicit ids.
    pub fn lookup(&self, position_ids: Option<&[usize]>, seq_len: usize) -> Result<(Tensor, Tensor)> {
        let positions: Vec<usize> = match position_ids {
            Some(ids) => ids.to_vec(),
            None => (0..seq_len).collect(),
        };
        if let Some(&bad) = positions.iter().find(|&&p| p >= self.max_positions) {
            return Err(QwenError::Shape(format!(
                "position {} exceeds rotary table of {} positions",
                bad, self.max_positions
            )));
        }

        let mut cos = Vec::with_capacity(positions.len() * self.head_dim);
        let mut sin = Vec::with_capacity(positions.len() * self.head_dim);
        for &p in &positions {
            cos.extend(self.cos_row(p).iter().map(|&v| f16::from_f32(v)));
            sin.extend(self.sin_row(p).iter().map(|&v| f16::from_f32(v)));
        }
        let shape = [1, positions.len(), self.head_dim];
        Ok((Tensor::new(shape, cos)?, Tensor::new(shape, sin)?))
    }
}

/// Write `cat(-x2, x1)` of one vector into `out`.
#[inline]
pub fn rotate_half(x: &[f16], out: &mut [f16]) {
    let half = x.len() / 2;
    for i in 0..half {
        out[i] = -x[half + i];
        out[half + i] = x[i];
    }
}

/// Rotate a `[B, H, S, D]` tensor in place: `x * cos + rotate_half(x) * sin`.
pub fn apply_rotary(x: &mut Tensor, cos: &Tensor, sin: &Tensor) -> Result<()> {
    let (seq_len, head_dim) = match x.shape() {
        [_, _, s, d] => (*s, *d),
        other => {
            return Err(QwenError::Shape(format!(
                "rotary input must be [B, H, S, D], got {:?}",
                other
            )));
        }
    };
    if cos.shape() != [1, seq_len, head_dim] || sin.shape() != cos.shape() {
        return Err(QwenError::Shape(format!(
            "rotary tables {:?} do not match sequence {} x {}",
            cos.shape(),
            seq_len,
            head_dim
        )));
    }

    let mut rotated = vec![f16::ZERO; head_dim];
    for (row_idx, row) in x.data_mut().chunks_mut(head_dim).enumerate() {
        let s = row_idx % seq_len;
        let c = &cos.data()[s * head_dim..(s + 1) * head_dim];
        let sn = &sin.data()[s * head_dim..(s + 1) * head_dim];
        rotate_half(row, &mut rotated);
        for d in 0..head_dim {
            let a = f16::from_f32(row[d].to_f32() * c[d].to_f32());
            let b = f16::from_f32(rotated[d].to_f32() * sn[d].to_f32());
            row[d] = f16::from_f32(a.to_f32() + b.to_f32());
        }
    }
    Ok(())
}
