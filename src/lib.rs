//! Qwen-3 inference library in Rust
//!
//! A decoder for Qwen-3 checkpoints laid out for accelerator export:
//! every dense projection is a 1x1 convolution, positions are explicit,
//! and the vocabulary head is split into ordered shards. Aligned with
//! Qwen3ForCausalLM in Hugging Face Transformers.

pub mod attention;
pub mod config;
pub mod error;
pub mod head;
pub mod layers;
pub mod model;
pub mod ops;
pub mod rope;
pub mod sample;
pub mod tensor;
pub mod weights;

pub use attention::{Attention, MaskSlice, causal_mask, repeat_kv};
pub use config::{ModelOptions, NormKind, QwenConfig};
pub use error::{QwenError, Result};
pub use head::{VocabHead, split_sizes};
pub use layers::{Conv1x1, DecoderLayer, Mlp, Norm};
pub use model::{Logits, QwenForCausalLM, QwenModel, position_scalar, select_position};
pub use rope::RotaryTable;
pub use sample::{SamplingParams, greedy, sample};
pub use tensor::Tensor;
pub use weights::{LoadReport, convert_state_dict, read_checkpoint_dir};
