//! Qwen model configuration.

use crate::error::{QwenError, Result};
use serde::Deserialize;
use std::path::Path;

/// Transformer hyperparameters, aligned with Qwen3Config in Hugging Face Transformers.
///
/// Missing keys take the defaults of [`QwenConfig::default`]; unknown keys are ignored.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct QwenConfig {
    /// Transformer embedding dimension
    pub hidden_size: usize,
    /// FFN intermediate dimension
    pub intermediate_size: usize,
    /// Number of decoder layers
    pub num_hidden_layers: usize,
    /// Number of query attention heads
    pub num_attention_heads: usize,
    /// Number of key/value heads for GQA
    pub num_key_value_heads: usize,
    /// Per-head dimension; `hidden_size / num_attention_heads` when absent
    pub head_dim: Option<usize>,
    /// Vocabulary size
    pub vocab_size: usize,
    pub rms_norm_eps: f64,
    pub rope_theta: f64,
    /// Rows precomputed in the rotary table
    pub max_position_embeddings: usize,
    /// Sequence length the host builds masks for
    pub context_length: usize,
    pub state_length: usize,
    pub hidden_act: String,
    pub bos_token_id: u32,
    pub eos_token_id: u32,
    pub tie_word_embeddings: bool,
    pub model_type: String,
}

impl Default for QwenConfig {
    fn default() -> Self {
        Self {
            hidden_size: 4096,
            intermediate_size: 14336,
            num_hidden_layers: 32,
            num_attention_heads: 32,
            num_key_value_heads: 8,
            head_dim: None,
            vocab_size: 128257,
            rms_norm_eps: 1e-5,
            rope_theta: 500000.0,
            max_position_embeddings: 8192,
            context_length: 512,
            state_length: 512,
            hidden_act: "silu".to_string(),
            bos_token_id: 128000,
            eos_token_id: 128001,
            tie_word_embeddings: false,
            model_type: "qwen3".to_string(),
        }
    }
}

impl QwenConfig {
    /// Parse a config from JSON text.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a config from a `config.json` file.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }

    /// Returns the head size.
    #[inline]
    pub fn head_dim(&self) -> usize {
        self.head_dim
            .unwrap_or(self.hidden_size / self.num_attention_heads.max(1))
    }

    /// Returns the number of query heads sharing one key/value head.
    #[inline]
    pub fn n_rep(&self) -> usize {
        self.num_attention_heads / self.num_key_value_heads
    }

    /// Returns the query projection width (num_attention_heads * head_dim).
    #[inline]
    pub fn q_dim(&self) -> usize {
        self.num_attention_heads * self.head_dim()
    }

    /// Returns the key/value projection width (num_key_value_heads * head_dim).
    #[inline]
    pub fn kv_dim(&self) -> usize {
        self.num_key_value_heads * self.head_dim()
    }

    /// Check the invariants the forward pass relies on.
    pub fn validate(&self) -> Result<()> {
        let sizes = [
            ("hidden_size", self.hidden_size),
            ("intermediate_size", self.intermediate_size),
            ("num_attention_heads", self.num_attention_heads),
            ("num_key_value_heads", self.num_key_value_heads),
            ("vocab_size", self.vocab_size),
            ("max_position_embeddings", self.max_position_embeddings),
        ];
        if let Some((name, _)) = sizes.iter().find(|(_, v)| *v == 0) {
            return Err(QwenError::InvalidConfig(format!("{name} must be non-zero")));
        }
        if self.num_attention_heads % self.num_key_value_heads != 0 {
            return Err(QwenError::InvalidConfig(format!(
                "num_attention_heads ({}) must be divisible by num_key_value_heads ({})",
                self.num_attention_heads, self.num_key_value_heads
            )));
        }
        let head_dim = self.head_dim();
        if head_dim == 0 || head_dim % 2 != 0 {
            return Err(QwenError::InvalidConfig(format!(
                "head_dim must be a positive even number, got {head_dim}"
            )));
        }
        Ok(())
    }
}

/// Normalization formula used at every norm site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NormKind {
    /// Subtract the mean, then layer-normalize with a learned scale and no bias.
    #[default]
    MeanCentered,
    /// Plain RMSNorm: `x * rsqrt(mean(x^2) + eps) * w`.
    Rms,
}

/// Construction-time architecture options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelOptions {
    /// Number of vocabulary-head partitions (1 = unsplit head).
    pub vocab_splits: usize,
    /// Return one logits tensor per partition instead of the concatenation.
    pub split_logits: bool,
    pub norm: NormKind,
}

impl Default for ModelOptions {
    fn default() -> Self {
        Self {
            vocab_splits: 16,
            split_logits: false,
            norm: NormKind::MeanCentered,
        }
    }
}

impl ModelOptions {
    pub fn validate(&self, config: &QwenConfig) -> Result<()> {
        if self.vocab_splits == 0 || self.vocab_splits > config.vocab_size {
            return Err(QwenError::InvalidConfig(format!(
                "vocab_splits must be in 1..={}, got {}",
                config.vocab_size, self.vocab_splits
            )));
        }
        Ok(())
    }
}
