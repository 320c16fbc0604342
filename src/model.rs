//! Qwen decoder stack and causal-LM head.

use crate::config::{ModelOptions, NormKind, QwenConfig};
use crate::error::{QwenError, Result};
use crate::head::VocabHead;
use crate::layers::{DecoderLayer, Norm};
use crate::rope::RotaryTable;
use crate::tensor::Tensor;
use crate::weights::{
    LM_HEAD_WEIGHT, LoadReport, ROTARY_BUFFER, convert_state_dict, read_checkpoint_dir,
    to_conv_weight,
};
use std::collections::HashMap;
use std::path::Path;

/// Embedding table, decoder layers and final norm, aligned with Qwen3Model.
#[derive(Debug, Clone)]
pub struct QwenModel {
    config: QwenConfig,
    /// Token embeddings `[vocab_size, hidden_size]`
    pub embed_tokens: Tensor,
    pub layers: Vec<DecoderLayer>,
    /// Final norm
    pub norm: Norm,
    rope: RotaryTable,
}

impl QwenModel {
    /// Build a zero-initialized stack; weights arrive through [`load_state_dict`](Self::load_state_dict).
    pub fn new(config: &QwenConfig, kind: NormKind) -> Result<Self> {
        config.validate()?;
        let layers = (0..config.num_hidden_layers)
            .map(|_| DecoderLayer::new(config, kind))
            .collect();
        Ok(QwenModel {
            config: config.clone(),
            embed_tokens: Tensor::zeros([config.vocab_size, config.hidden_size]),
            layers,
            norm: Norm::new(config.hidden_size, config.rms_norm_eps, kind),
            rope: RotaryTable::from_config(config),
        })
    }

    pub fn config(&self) -> &QwenConfig {
        &self.config
    }

    pub fn rope(&self) -> &RotaryTable {
        &self.rope
    }

    /// Look up `[B, S]` token ids, producing `[B, S, H]`.
    pub fn embed(&self, input_ids: &Tensor<i64>) -> Result<Tensor> {
        let (bsz, seq_len) = match input_ids.shape() {
            [b, s] => (*b, *s),
            other => {
                return Err(QwenError::Shape(format!(
                    "input_ids must be 2D, got {:?}",
                    other
                )));
            }
        };
        let dim = self.config.hidden_size;
        let vocab = self.config.vocab_size;
        let mut data = Vec::with_capacity(bsz * seq_len * dim);
        for &id in input_ids.data() {
            if id < 0 || id as usize >= vocab {
                return Err(QwenError::Shape(format!(
                    "token id {} outside vocabulary of {}",
                    id, vocab
                )));
            }
            let off = id as usize * dim;
            data.extend_from_slice(&self.embed_tokens.data()[off..off + dim]);
        }
        Tensor::new([bsz, seq_len, dim], data)
    }

    /// Run the stack, aligned with Qwen3Model.forward.
    ///
    /// In prefill mode the final norm is skipped: the call only warms
    /// host-held state and its output is not meant for logits.
    pub fn forward(
        &self,
        input_ids: &Tensor<i64>,
        causal_mask: Option<&Tensor>,
        position_ids: Option<&[usize]>,
        current_pos: Option<usize>,
        in_prefill: bool,
    ) -> Result<Tensor> {
        let mut hidden = self.embed(input_ids)?;
        for layer in &self.layers {
            hidden = layer.forward(&hidden, causal_mask, &self.rope, position_ids, current_pos)?;
        }
        if in_prefill {
            return Ok(hidden);
        }
        self.norm.forward(&hidden)
    }

    /// Every parameter with its checkpoint name (without the `model.` prefix).
    pub fn named_parameters_mut(&mut self) -> Vec<(String, &mut Tensor)> {
        let mut params = vec![("embed_tokens.weight".to_string(), &mut self.embed_tokens)];
        for (i, layer) in self.layers.iter_mut().enumerate() {
            layer.collect_params(&format!("layers.{i}."), &mut params);
        }
        params.push(("norm.weight".to_string(), &mut self.norm.weight));
        params
    }

    /// Names of non-parameter buffers a checkpoint may or may not carry.
    pub fn buffer_names(&self) -> Vec<String> {
        (0..self.layers.len())
            .map(|i| format!("layers.{i}.self_attn.{ROTARY_BUFFER}"))
            .collect()
    }

    /// Assign tensors to parameters by name.
    ///
    /// Unmatched names are reported rather than rejected; a shape mismatch
    /// on a matched name is an error.
    pub fn load_state_dict(&mut self, mut state: HashMap<String, Tensor>) -> Result<LoadReport> {
        let mut missing = Vec::new();
        for (name, param) in self.named_parameters_mut() {
            match state.remove(&name) {
                Some(tensor) => {
                    if tensor.shape() != param.shape() {
                        return Err(QwenError::Shape(format!(
                            "{} expects {:?}, checkpoint has {:?}",
                            name,
                            param.shape(),
                            tensor.shape()
                        )));
                    }
                    *param = tensor;
                }
                None => missing.push(name),
            }
        }
        // rotary tables are rebuilt from the config
        for name in self.buffer_names() {
            if state.remove(&name).is_none() {
                missing.push(name);
            }
        }
        let mut unexpected: Vec<String> = state.into_keys().collect();
        unexpected.sort();
        Ok(LoadReport {
            missing,
            unexpected,
            lm_head_loaded: false,
        })
    }
}

/// Logits returned by [`QwenForCausalLM::forward`].
#[derive(Debug, Clone, PartialEq)]
pub enum Logits {
    /// One `[B, S', V]` tensor.
    Merged(Tensor),
    /// One `[B, S', V_i]` tensor per head shard, in shard order.
    Split(Vec<Tensor>),
}

impl Logits {
    /// Collapse into a single tensor, concatenating shards if needed.
    pub fn into_merged(self) -> Result<Tensor> {
        match self {
            Logits::Merged(t) => Ok(t),
            Logits::Split(parts) => {
                let axis = parts.first().map_or(0, |p| p.rank().saturating_sub(1));
                Tensor::cat(&parts, axis)
            }
        }
    }
}

/// Select one sequence position of `[B, S, H]` hidden states, giving `[B, 1, H]`.
pub fn select_position(hidden: &Tensor, current_pos: usize) -> Result<Tensor> {
    hidden.index_select(1, &[current_pos])
}

/// Read a current-position marker given as a one-element integer tensor
/// (`[]`, `[1]` or `[1, 1]`).
pub fn position_scalar(current_pos: &Tensor<i64>) -> Result<usize> {
    match current_pos.data() {
        [p] => usize::try_from(*p)
            .map_err(|_| QwenError::Shape(format!("negative current position {}", p))),
        _ => Err(QwenError::Shape(format!(
            "current position must hold one element, got {:?}",
            current_pos.shape()
        ))),
    }
}

/// Convert rank-1 `[S]` or rank-2 `[1, S]` position ids to absolute positions.
fn position_list(position_ids: &Tensor<i64>) -> Result<Vec<usize>> {
    match position_ids.shape() {
        [_] | [1, _] => {}
        other => {
            return Err(QwenError::Shape(format!(
                "position_ids must be [S] or [1, S], got {:?}",
                other
            )));
        }
    }
    position_ids
        .data()
        .iter()
        .map(|&p| {
            usize::try_from(p)
                .map_err(|_| QwenError::Shape(format!("negative position id {}", p)))
        })
        .collect()
}

/// Decoder stack plus partitioned vocabulary head, aligned with Qwen3ForCausalLM.
#[derive(Debug, Clone)]
pub struct QwenForCausalLM {
    options: ModelOptions,
    pub model: QwenModel,
    pub lm_head: VocabHead,
}

impl QwenForCausalLM {
    pub fn new(config: &QwenConfig, options: ModelOptions) -> Result<Self> {
        options.validate(config)?;
        let model = QwenModel::new(config, options.norm)?;
        let lm_head = VocabHead::new(config.hidden_size, config.vocab_size, options.vocab_splits);
        tracing::debug!(
            layers = config.num_hidden_layers,
            vocab_splits = options.vocab_splits,
            "created model"
        );
        Ok(QwenForCausalLM {
            options,
            model,
            lm_head,
        })
    }

    pub fn config(&self) -> &QwenConfig {
        self.model.config()
    }

    pub fn options(&self) -> &ModelOptions {
        &self.options
    }

    /// Full forward pass.
    ///
    /// With `current_pos` set (and not prefilling) only that position is
    /// projected, giving `[B, 1, V]`; otherwise every position is, giving
    /// `[B, S, V]`. `update_mask` is accepted for host compatibility and
    /// ignored.
    pub fn forward(
        &self,
        input_ids: &Tensor<i64>,
        _update_mask: Option<&Tensor>,
        position_ids: &Tensor<i64>,
        causal_mask: Option<&Tensor>,
        current_pos: Option<usize>,
        in_prefill: bool,
    ) -> Result<Logits> {
        if input_ids.rank() != 2 {
            return Err(QwenError::Shape(format!(
                "input_ids must be 2D, got {:?}",
                input_ids.shape()
            )));
        }
        if !in_prefill && !matches!(position_ids.rank(), 1 | 2) {
            return Err(QwenError::Shape(format!(
                "position_ids must be 1D or 2D, got {:?}",
                position_ids.shape()
            )));
        }
        if in_prefill && position_ids.shape().last() != input_ids.shape().last() {
            return Err(QwenError::Shape(format!(
                "position_ids length must match input_ids in prefill: {:?} vs {:?}",
                position_ids.shape(),
                input_ids.shape()
            )));
        }
        let positions = position_list(position_ids)?;

        let mut hidden = self.model.forward(
            input_ids,
            causal_mask,
            Some(&positions),
            current_pos,
            in_prefill,
        )?;

        if let (false, Some(pos)) = (in_prefill, current_pos) {
            hidden = select_position(&hidden, pos)?;
        }

        tracing::trace!(shape = ?hidden.shape(), "projecting to vocabulary");
        if self.options.split_logits && self.lm_head.n_splits() > 1 {
            return Ok(Logits::Split(self.lm_head.forward_parts(&hidden)?));
        }
        Ok(Logits::Merged(self.lm_head.forward(&hidden)?))
    }

    /// Run the stack over a prompt in prefill mode and discard the result.
    ///
    /// Only rows `..S` of the mask are taken here; attention narrows the
    /// columns to the same window.
    pub fn prefill_kv_cache(
        &self,
        input_ids: &Tensor<i64>,
        position_ids: &Tensor<i64>,
        start_pos: usize,
        causal_mask: Option<&Tensor>,
    ) -> Result<()> {
        let seq_len = match input_ids.shape() {
            [_, s] => *s,
            other => {
                return Err(QwenError::Shape(format!(
                    "input_ids must be 2D, got {:?}",
                    other
                )));
            }
        };
        if position_ids.shape().last() != Some(&seq_len) {
            return Err(QwenError::Shape(format!(
                "position_ids length must match input_ids in prefill: {:?} vs {:?}",
                position_ids.shape(),
                input_ids.shape()
            )));
        }
        let positions = position_list(position_ids)?;
        let causal_slice = causal_mask.map(|m| m.narrow(2, 0, seq_len)).transpose()?;
        self.model.forward(
            input_ids,
            causal_slice.as_ref(),
            Some(&positions),
            Some(start_pos),
            true,
        )?;
        Ok(())
    }

    /// Load a checkpoint tensor map into the stack and the vocabulary head.
    ///
    /// Projection weights are reshaped to `[out, in, 1, 1]`, `lm_head.weight`
    /// is split across the head shards. The report lists what did not match.
    pub fn load_state(&mut self, mut checkpoint: HashMap<String, Tensor>) -> Result<LoadReport> {
        let lm_head = checkpoint.remove(LM_HEAD_WEIGHT);
        let state = convert_state_dict(checkpoint)?;

        let mut report = self.model.load_state_dict(state)?;
        report.missing.retain(|m| !m.contains(ROTARY_BUFFER));
        if !report.missing.is_empty() {
            tracing::warn!(missing = ?report.missing, "missing keys");
        }
        if !report.unexpected.is_empty() {
            tracing::warn!(unexpected = ?report.unexpected, "unexpected keys");
        }

        match lm_head {
            Some(weight) => {
                self.lm_head.load(&to_conv_weight(&weight)?)?;
                report.lm_head_loaded = true;
            }
            None => tracing::warn!("{LM_HEAD_WEIGHT} not found in model weights"),
        }
        Ok(report)
    }

    /// Load every `*.safetensors` shard under `dir`.
    ///
    /// Returns `Ok(false)` when keys are missing or unexpected, or the head
    /// weight is absent.
    pub fn load_pretrained_weights<P: AsRef<Path>>(&mut self, dir: P) -> Result<bool> {
        let checkpoint = read_checkpoint_dir(dir)?;
        let report = self.load_state(checkpoint)?;
        Ok(report.is_complete())
    }
}
