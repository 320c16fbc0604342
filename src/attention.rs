//! Grouped-query self-attention, aligned with Qwen3Attention.forward.
//!
//! The block is stateless: callers pass the whole key/value-relevant
//! sequence on every call.

use crate::config::{NormKind, QwenConfig};
use crate::error::{QwenError, Result};
use crate::layers::{Conv1x1, Norm};
use crate::ops::softmax;
use crate::rope::{RotaryTable, apply_rotary};
use crate::tensor::Tensor;
use half::f16;
use rayon::prelude::*;

/// The live `S x S` window of an additive `[B|1, 1, R, C]` causal mask.
#[derive(Debug, Clone, Copy)]
pub struct MaskSlice<'a> {
    data: &'a [f16],
    batch: usize,
    rows: usize,
    cols: usize,
}

impl<'a> MaskSlice<'a> {
    /// View `mask[:, :, :seq_len, :seq_len]`, broadcasting a batch of one.
    pub fn new(mask: &'a Tensor, batch: usize, seq_len: usize) -> Result<Self> {
        let (mb, heads, rows, cols) = match mask.shape() {
            [b, h, r, c] => (*b, *h, *r, *c),
            other => {
                return Err(QwenError::Shape(format!(
                    "causal mask must be rank 4, got {:?}",
                    other
                )));
            }
        };
        if (mb != 1 && mb != batch) || heads != 1 || rows < seq_len || cols < seq_len {
            return Err(QwenError::Shape(format!(
                "causal mask {:?} cannot cover batch {} and sequence {}",
                mask.shape(),
                batch,
                seq_len
            )));
        }
        Ok(MaskSlice {
            data: mask.data(),
            batch: mb,
            rows,
            cols,
        })
    }

    /// Additive bias for query row `i`, key column `j` of batch item `b`.
    #[inline]
    pub fn bias(&self, b: usize, i: usize, j: usize) -> f16 {
        let b = if self.batch == 1 { 0 } else { b };
        self.data[(b * self.rows + i) * self.cols + j]
    }
}

/// Repeat each kv head `n_rep` times contiguously: `[B, Nkv, S, D]` to
/// `[B, Nkv * n_rep, S, D]`, so kv head `i` lands on query heads
/// `i * n_rep .. (i + 1) * n_rep`.
pub fn repeat_kv(x: &Tensor, n_rep: usize) -> Result<Tensor> {
    if n_rep == 1 {
        return Ok(x.clone());
    }
    let (b, n_kv, s, d) = match x.shape() {
        [b, n, s, d] => (*b, *n, *s, *d),
        other => {
            return Err(QwenError::Shape(format!(
                "repeat_kv expects [B, Nkv, S, D], got {:?}",
                other
            )));
        }
    };
    let block = s * d;
    let mut data = Vec::with_capacity(x.numel() * n_rep);
    for head in x.data().chunks(block) {
        for _ in 0..n_rep {
            data.extend_from_slice(head);
        }
    }
    Tensor::new([b, n_kv * n_rep, s, d], data)
}

/// `[B, S, N * D]` to `[B, N, S, D]`.
fn split_heads(x: &Tensor, n_heads: usize, head_dim: usize) -> Result<Tensor> {
    let (b, s) = (x.shape()[0], x.shape()[1]);
    let width = n_heads * head_dim;
    let mut data = Vec::with_capacity(x.numel());
    for bi in 0..b {
        for h in 0..n_heads {
            for si in 0..s {
                let off = (bi * s + si) * width + h * head_dim;
                data.extend_from_slice(&x.data()[off..off + head_dim]);
            }
        }
    }
    Tensor::new([b, n_heads, s, head_dim], data)
}

/// `[B, N, S, D]` to `[B, S, N * D]`.
fn merge_heads(x: &Tensor) -> Result<Tensor> {
    let (b, n, s, d) = (x.shape()[0], x.shape()[1], x.shape()[2], x.shape()[3]);
    let mut data = Vec::with_capacity(x.numel());
    for bi in 0..b {
        for si in 0..s {
            for h in 0..n {
                let off = ((bi * n + h) * s + si) * d;
                data.extend_from_slice(&x.data()[off..off + d]);
            }
        }
    }
    Tensor::new([b, s, n * d], data)
}

/// Softmax-normalized attention weights for one head, `seq_len x seq_len`.
///
/// `q` and `k` are `seq_len x head_dim`; `mask(i, j)` supplies the
/// additive bias, if any.
pub fn attention_probs<F>(q: &[f16], k: &[f16], seq_len: usize, head_dim: usize, scale: f32, mask: F) -> Vec<f32>
where
    F: Fn(usize, usize) -> Option<f16>,
{
    let mut probs = vec![0.0f32; seq_len * seq_len];
    for (i, row) in probs.chunks_mut(seq_len).enumerate() {
        let qi = &q[i * head_dim..(i + 1) * head_dim];
        for (j, score) in row.iter_mut().enumerate() {
            let kj = &k[j * head_dim..(j + 1) * head_dim];
            let dot: f32 = qi.iter().zip(kj).map(|(a, b)| a.to_f32() * b.to_f32()).sum();
            let mut s = f16::from_f32(f16::from_f32(dot).to_f32() * scale);
            if let Some(bias) = mask(i, j) {
                s = f16::from_f32(s.to_f32() + bias.to_f32());
            }
            *score = s.to_f32();
        }
        softmax(row);
        for p in row.iter_mut() {
            *p = f16::from_f32(*p).to_f32();
        }
    }
    probs
}

/// Self-attention weights and head geometry for one layer.
#[derive(Debug, Clone)]
pub struct Attention {
    pub q_proj: Conv1x1,
    pub k_proj: Conv1x1,
    pub v_proj: Conv1x1,
    pub o_proj: Conv1x1,
    pub q_norm: Norm,
    pub k_norm: Norm,
    num_heads: usize,
    num_kv_heads: usize,
    head_dim: usize,
    scale: f32,
}

impl Attention {
    pub fn new(config: &QwenConfig, kind: NormKind) -> Self {
        let head_dim = config.head_dim();
        Attention {
            q_proj: Conv1x1::new(config.hidden_size, config.q_dim()),
            k_proj: Conv1x1::new(config.hidden_size, config.kv_dim()),
            v_proj: Conv1x1::new(config.hidden_size, config.kv_dim()),
            o_proj: Conv1x1::new(config.q_dim(), config.hidden_size),
            q_norm: Norm::new(head_dim, config.rms_norm_eps, kind),
            k_norm: Norm::new(head_dim, config.rms_norm_eps, kind),
            num_heads: config.num_attention_heads,
            num_kv_heads: config.num_key_value_heads,
            head_dim,
            scale: 1.0 / (head_dim as f32).sqrt(),
        }
    }

    /// Attend over `x: [B, S, H]`, returning `[B, S, H]`.
    ///
    /// `current_pos` is accepted for hosts that track cache positions; the
    /// computation does not depend on it.
    pub fn forward(
        &self,
        x: &Tensor,
        causal_mask: Option<&Tensor>,
        rope: &RotaryTable,
        position_ids: Option<&[usize]>,
        _current_pos: Option<usize>,
    ) -> Result<Tensor> {
        let (bsz, seq_len) = match x.shape() {
            [b, s, _] => (*b, *s),
            other => {
                return Err(QwenError::Shape(format!(
                    "attention input must be [B, S, H], got {:?}",
                    other
                )));
            }
        };
        let head_dim = self.head_dim;
        let n_heads = self.num_heads;
        let n_rep = n_heads / self.num_kv_heads;

        // Projections
        let q = split_heads(&self.q_proj.forward(x)?, n_heads, head_dim)?;
        let k = split_heads(&self.k_proj.forward(x)?, self.num_kv_heads, head_dim)?;
        let v = split_heads(&self.v_proj.forward(x)?, self.num_kv_heads, head_dim)?;

        // Share kv heads across query groups
        let k = repeat_kv(&k, n_rep)?;
        let v = repeat_kv(&v, n_rep)?;

        // Per-head norm, then RoPE
        let mut q = self.q_norm.forward(&q)?;
        let mut k = self.k_norm.forward(&k)?;
        let (cos, sin) = rope.lookup(position_ids, seq_len)?;
        apply_rotary(&mut q, &cos, &sin)?;
        apply_rotary(&mut k, &cos, &sin)?;

        let mask = causal_mask
            .map(|m| MaskSlice::new(m, bsz, seq_len))
            .transpose()?;

        // One task per (batch, head)
        let block = seq_len * head_dim;
        let head_outputs: Vec<Vec<f16>> = (0..bsz * n_heads)
            .into_par_iter()
            .map(|bh| {
                let b = bh / n_heads;
                let qh = &q.data()[bh * block..(bh + 1) * block];
                let kh = &k.data()[bh * block..(bh + 1) * block];
                let vh = &v.data()[bh * block..(bh + 1) * block];

                let probs = attention_probs(qh, kh, seq_len, head_dim, self.scale, |i, j| {
                    mask.as_ref().map(|m| m.bias(b, i, j))
                });

                // Weighted sum of values
                let mut out = vec![f16::ZERO; block];
                for i in 0..seq_len {
                    let p = &probs[i * seq_len..(i + 1) * seq_len];
                    for d in 0..head_dim {
                        let mut acc = 0.0f32;
                        for (t, &a) in p.iter().enumerate() {
                            acc += a * vh[t * head_dim + d].to_f32();
                        }
                        out[i * head_dim + d] = f16::from_f32(acc);
                    }
                }
                out
            })
            .collect();

        let mut attn: Tensor = Tensor::zeros([bsz, n_heads, seq_len, head_dim]);
        for (bh, out) in head_outputs.into_iter().enumerate() {
            attn.data_mut()[bh * block..(bh + 1) * block].copy_from_slice(&out);
        }

        tracing::trace!(bsz, seq_len, n_heads, n_rep, "attention");
        self.o_proj.forward(&merge_heads(&attn)?)
    }

    pub(crate) fn collect_params<'a>(&'a mut self, prefix: &str, out: &mut Vec<(String, &'a mut Tensor)>) {
        out.push((format!("{prefix}q_proj.weight"), &mut self.q_proj.weight));
        out.push((format!("{prefix}k_proj.weight"), &mut self.k_proj.weight));
        out.push((format!("{prefix}v_proj.weight"), &mut self.v_proj.weight));
        out.push((format!("{prefix}o_proj.weight"), &mut self.o_proj.weight));
        out.push((format!("{prefix}q_norm.weight"), &mut self.q_norm.weight));
        out.push((format!("{prefix}k_norm.weight"), &mut self.k_norm.weight));
    }
}

/// Additive `[1, 1, S, S]` causal mask: 0 on and below the diagonal, -inf above.
pub fn causal_mask(seq_len: usize) -> Tensor {
    let mut mask: Tensor = Tensor::zeros([1, 1, seq_len, seq_len]);
    for (i, row) in mask.data_mut().chunks_mut(seq_len).enumerate() {
        for v in row.iter_mut().skip(i + 1) {
            *v = f16::NEG_INFINITY;
        }
    }
    mask
}
