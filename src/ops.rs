//! Core operations for Qwen inference.
//!
//! Buffers hold `f16`; every kernel accumulates in `f32` and rounds once
//! when it writes its output.

use crate::config::NormKind;
use half::f16;

/// Mean-centered layer normalization with a learned scale and no bias.
///
/// The input is centered and rounded to working precision first, then
/// normalized as `F.layer_norm` would.
#[inline]
pub fn centered_norm(dest: &mut [f16], src: &[f16], weight: &[f16], eps: f32) {
    let n = src.len() as f32;
    let mean = src.iter().map(|v| v.to_f32()).sum::<f32>() / n;
    let centered: Vec<f32> = src
        .iter()
        .map(|v| f16::from_f32(v.to_f32() - mean).to_f32())
        .collect();
    let mean2 = centered.iter().sum::<f32>() / n;
    let var = centered.iter().map(|c| (c - mean2) * (c - mean2)).sum::<f32>() / n;
    let inv = 1.0 / (var + eps).sqrt();
    for ((d, c), w) in dest.iter_mut().zip(&centered).zip(weight) {
        *d = f16::from_f32((c - mean2) * inv * w.to_f32());
    }
}

/// RMS normalization, aligned with Qwen3RMSNorm.forward.
#[inline]
pub fn rms_norm(dest: &mut [f16], src: &[f16], weight: &[f16], eps: f32) {
    let n = src.len();
    let ss: f32 = src.iter().map(|v| v.to_f32() * v.to_f32()).sum();
    let inv = 1.0 / (ss / n as f32 + eps).sqrt();
    for i in 0..dest.len() {
        dest[i] = f16::from_f32(weight[i].to_f32() * (inv * src[i].to_f32()));
    }
}

/// Normalize one vector with the selected formula.
#[inline]
pub fn norm(kind: NormKind, dest: &mut [f16], src: &[f16], weight: &[f16], eps: f32) {
    match kind {
        NormKind::MeanCentered => centered_norm(dest, src, weight, eps),
        NormKind::Rms => rms_norm(dest, src, weight, eps),
    }
}

/// Matrix-vector multiplication: xout = x @ w.T (w is row-major flattened).
#[inline]
pub fn matmul(xout: &mut [f16], x: &[f16], w: &[f16]) {
    let in_dim = x.len();
    for (i, out) in xout.iter_mut().enumerate() {
        let off = i * in_dim;
        let mut val = 0.0f32;
        for j in 0..in_dim {
            val += w[off + j].to_f32() * x[j].to_f32();
        }
        *out = f16::from_f32(val);
    }
}

/// Element-wise accumulation: a += b.
#[inline]
pub fn accum(a: &mut [f16], b: &[f16]) {
    for (ai, bi) in a.iter_mut().zip(b.iter()) {
        *ai = f16::from_f32(ai.to_f32() + bi.to_f32());
    }
}

/// Softmax in-place.
#[inline]
pub fn softmax(x: &mut [f32]) {
    if x.is_empty() {
        return;
    }
    let max_val = x.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let mut sum = 0.0f32;
    for xi in x.iter_mut() {
        *xi = (*xi - max_val).exp();
        sum += *xi;
    }
    for xi in x.iter_mut() {
        *xi /= sum;
    }
}

/// SiLU: x * sigmoid(x).
#[inline]
pub fn silu(x: f32) -> f32 {
    x / (1.0 + (-x).exp())
}

/// SwiGLU activation: silu(gate) * up, written into `gate`.
///
/// The activation is rounded before the product, as two separate ops would.
#[inline]
pub fn swiglu(gate: &mut [f16], up: &[f16]) {
    for (g, u) in gate.iter_mut().zip(up.iter()) {
        let act = f16::from_f32(silu(g.to_f32()));
        *g = f16::from_f32(act.to_f32() * u.to_f32());
    }
}
