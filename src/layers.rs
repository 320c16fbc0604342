//! Weight-bearing building blocks: unit-kernel projections, norms, MLP and
//! the decoder layer.

use crate::attention::Attention;
use crate::config::{NormKind, QwenConfig};
use crate::error::{QwenError, Result};
use crate::ops::{accum, matmul, norm, swiglu};
use crate::rope::RotaryTable;
use crate::tensor::Tensor;
use half::f16;
use rayon::prelude::*;

/// Output channels handed to one rayon task.
const ROW_BLOCK: usize = 64;

/// A bias-free 1x1 convolution, i.e. a dense projection whose weight is
/// stored as `[out_features, in_features, 1, 1]`.
#[derive(Debug, Clone)]
pub struct Conv1x1 {
    pub weight: Tensor,
}

impl Conv1x1 {
    pub fn new(in_features: usize, out_features: usize) -> Self {
        Conv1x1 {
            weight: Tensor::zeros([out_features, in_features, 1, 1]),
        }
    }

    #[inline]
    pub fn out_features(&self) -> usize {
        self.weight.shape()[0]
    }

    #[inline]
    pub fn in_features(&self) -> usize {
        self.weight.shape()[1]
    }

    /// Project the last axis of `x` from `in_features` to `out_features`.
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let in_f = self.in_features();
        let out_f = self.out_features();
        if x.shape().last() != Some(&in_f) {
            return Err(QwenError::Shape(format!(
                "projection expects last dim {}, got {:?}",
                in_f,
                x.shape()
            )));
        }

        let rows = x.numel() / in_f;
        let w = self.weight.data();
        let mut out = vec![f16::ZERO; rows * out_f];
        for (o, xi) in out.chunks_mut(out_f).zip(x.data().chunks(in_f)) {
            o.par_chunks_mut(ROW_BLOCK)
                .enumerate()
                .for_each(|(blk, ob)| {
                    let start = blk * ROW_BLOCK * in_f;
                    matmul(ob, xi, &w[start..start + ob.len() * in_f]);
                });
        }

        let mut shape = x.shape().to_vec();
        if let Some(last) = shape.last_mut() {
            *last = out_f;
        }
        Tensor::new(shape, out)
    }
}

/// Learned-scale normalization over the last axis.
#[derive(Debug, Clone)]
pub struct Norm {
    pub weight: Tensor,
    eps: f32,
    kind: NormKind,
}

impl Norm {
    pub fn new(dim: usize, eps: f64, kind: NormKind) -> Self {
        Norm {
            weight: Tensor::full([dim], f16::ONE),
            eps: eps as f32,
            kind,
        }
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let dim = self.weight.numel();
        if x.shape().last() != Some(&dim) {
            return Err(QwenError::Shape(format!(
                "norm expects last dim {}, got {:?}",
                dim,
                x.shape()
            )));
        }
        let mut out: Tensor = Tensor::zeros(x.shape().to_vec());
        for (d, s) in out.data_mut().chunks_mut(dim).zip(x.data().chunks(dim)) {
            norm(self.kind, d, s, self.weight.data(), self.eps);
        }
        Ok(out)
    }
}

/// Gated feed-forward block, aligned with Qwen3MLP.forward.
#[derive(Debug, Clone)]
pub struct Mlp {
    pub gate_proj: Conv1x1,
    pub up_proj: Conv1x1,
    pub down_proj: Conv1x1,
}

impl Mlp {
    pub fn new(config: &QwenConfig) -> Self {
        Mlp {
            gate_proj: Conv1x1::new(config.hidden_size, config.intermediate_size),
            up_proj: Conv1x1::new(config.hidden_size, config.intermediate_size),
            down_proj: Conv1x1::new(config.intermediate_size, config.hidden_size),
        }
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let mut gate = self.gate_proj.forward(x)?;
        let up = self.up_proj.forward(x)?;
        swiglu(gate.data_mut(), up.data());
        self.down_proj.forward(&gate)
    }

    fn collect_params<'a>(&'a mut self, prefix: &str, out: &mut Vec<(String, &'a mut Tensor)>) {
        out.push((format!("{prefix}gate_proj.weight"), &mut self.gate_proj.weight));
        out.push((format!("{prefix}up_proj.weight"), &mut self.up_proj.weight));
        out.push((format!("{prefix}down_proj.weight"), &mut self.down_proj.weight));
    }
}

/// One pre-norm decoder layer, aligned with Qwen3DecoderLayer.forward.
#[derive(Debug, Clone)]
pub struct DecoderLayer {
    pub self_attn: Attention,
    pub mlp: Mlp,
    pub input_layernorm: Norm,
    pub post_attention_layernorm: Norm,
}

impl DecoderLayer {
    pub fn new(config: &QwenConfig, kind: NormKind) -> Self {
        DecoderLayer {
            self_attn: Attention::new(config, kind),
            mlp: Mlp::new(config),
            input_layernorm: Norm::new(config.hidden_size, config.rms_norm_eps, kind),
            post_attention_layernorm: Norm::new(config.hidden_size, config.rms_norm_eps, kind),
        }
    }

    pub fn forward(
        &self,
        x: &Tensor,
        causal_mask: Option<&Tensor>,
        rope: &RotaryTable,
        position_ids: Option<&[usize]>,
        current_pos: Option<usize>,
    ) -> Result<Tensor> {
        // Attention block
        let h = self.input_layernorm.forward(x)?;
        let h = self
            .self_attn
            .forward(&h, causal_mask, rope, position_ids, current_pos)?;
        let mut x = x.clone();
        accum(x.data_mut(), h.data());

        // Feed-forward block
        let h = self.post_attention_layernorm.forward(&x)?;
        let h = self.mlp.forward(&h)?;
        accum(x.data_mut(), h.data());
        Ok(x)
    }

    /// Push `(name, parameter)` pairs using checkpoint naming.
    pub fn collect_params<'a>(&'a mut self, prefix: &str, out: &mut Vec<(String, &'a mut Tensor)>) {
        self.self_attn
            .collect_params(&format!("{prefix}self_attn."), out);
        self.mlp.collect_params(&format!("{prefix}mlp."), out);
        out.push((
            format!("{prefix}input_layernorm.weight"),
            &mut self.input_layernorm.weight,
        ));
        out.push((
            format!("{prefix}post_attention_layernorm.weight"),
            &mut self.post_attention_layernorm.weight,
        ));
    }
}
