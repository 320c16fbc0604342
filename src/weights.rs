//! Checkpoint reading and conversion to the unit-kernel layout.

use crate::error::{QwenError, Result};
use crate::tensor::Tensor;
use byteorder::{LittleEndian, ReadBytesExt};
use half::{bf16, f16};
use safetensors::{Dtype, SafeTensors};
use std::collections::HashMap;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

/// Unprefixed name of the vocabulary head weight.
pub const LM_HEAD_WEIGHT: &str = "lm_head.weight";
/// Rotary buffer some checkpoints carry; rebuilt from the config instead.
pub const ROTARY_BUFFER: &str = "rotary_emb.inv_freq";

const MODEL_PREFIX: &str = "model.";

/// Name suffixes of the dense projections stored as `[out, in, 1, 1]`.
const CONV_PROJECTIONS: [&str; 7] = [
    "mlp.gate_proj.weight",
    "mlp.up_proj.weight",
    "mlp.down_proj.weight",
    "self_attn.q_proj.weight",
    "self_attn.k_proj.weight",
    "self_attn.v_proj.weight",
    "self_attn.o_proj.weight",
];

/// Outcome of assigning a checkpoint to a model.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    /// Model parameters the checkpoint did not provide
    pub missing: Vec<String>,
    /// Checkpoint names no parameter matched
    pub unexpected: Vec<String>,
    pub lm_head_loaded: bool,
}

impl LoadReport {
    pub fn is_complete(&self) -> bool {
        self.missing.is_empty() && self.unexpected.is_empty() && self.lm_head_loaded
    }
}

#[derive(Clone, Copy)]
enum Element {
    F16,
    Bf16,
    F32,
}

impl Element {
    fn from_dtype(dtype: Dtype) -> Option<Self> {
        match dtype {
            Dtype::F16 => Some(Element::F16),
            Dtype::BF16 => Some(Element::Bf16),
            Dtype::F32 => Some(Element::F32),
            _ => None,
        }
    }
}

/// Read `count` little-endian elements, converting to `f16`.
fn read_f16_vec<R: Read>(reader: &mut R, count: usize, element: Element) -> Result<Vec<f16>> {
    let mut buf = vec![f16::ZERO; count];
    for v in buf.iter_mut() {
        *v = match element {
            Element::F16 => f16::from_bits(reader.read_u16::<LittleEndian>()?),
            Element::Bf16 => f16::from_f32(bf16::from_bits(reader.read_u16::<LittleEndian>()?).to_f32()),
            Element::F32 => f16::from_f32(reader.read_f32::<LittleEndian>()?),
        };
    }
    Ok(buf)
}

/// Decode every tensor of one safetensors buffer.
pub fn read_safetensors(bytes: &[u8]) -> Result<HashMap<String, Tensor>> {
    let file = SafeTensors::deserialize(bytes)
        .map_err(|e| QwenError::InvalidModel(format!("bad safetensors file: {e}")))?;
    let mut tensors = HashMap::new();
    for (name, view) in file.tensors() {
        let element = Element::from_dtype(view.dtype()).ok_or_else(|| {
            QwenError::InvalidModel(format!("{} has unsupported dtype {:?}", name, view.dtype()))
        })?;
        let shape = view.shape().to_vec();
        let count = shape.iter().product();
        let mut data = view.data();
        let values = read_f16_vec(&mut data, count, element)?;
        tracing::trace!(%name, ?shape, "decoded tensor");
        tensors.insert(name, Tensor::new(shape, values)?);
    }
    Ok(tensors)
}

/// Read all `*.safetensors` files under `dir` into one map.
///
/// Files are read in name order; a name repeated in a later file replaces
/// the earlier tensor.
pub fn read_checkpoint_dir<P: AsRef<Path>>(dir: P) -> Result<HashMap<String, Tensor>> {
    let dir = dir.as_ref();
    if !dir.is_dir() {
        return Err(QwenError::ModelDirNotFound(dir.to_path_buf()));
    }

    let mut files: Vec<PathBuf> = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().is_some_and(|ext| ext == "safetensors") {
            files.push(path);
        }
    }
    files.sort();

    let mut state = HashMap::new();
    for path in &files {
        let bytes = fs::read(path)?;
        let tensors = read_safetensors(&bytes)?;
        tracing::debug!(file = %path.display(), tensors = tensors.len(), "read checkpoint shard");
        state.extend(tensors);
    }
    if files.is_empty() {
        tracing::warn!(dir = %dir.display(), "no safetensors files found");
    }
    Ok(state)
}

/// View a `[out, in]` projection weight as `[out, in, 1, 1]`.
pub fn to_conv_weight(weight: &Tensor) -> Result<Tensor> {
    match *weight.shape() {
        [out, inp] => weight.clone().reshape([out, inp, 1, 1]),
        [_, _, 1, 1] => Ok(weight.clone()),
        ref other => Err(QwenError::Shape(format!(
            "cannot view {:?} as a 1x1 convolution weight",
            other
        ))),
    }
}

/// Rename and reshape checkpoint tensors for [`QwenModel`](crate::model::QwenModel).
///
/// Strips one leading `model.`, drops the vocabulary head, and reshapes the
/// attention and MLP projections. Every other tensor passes through unchanged.
pub fn convert_state_dict(state: HashMap<String, Tensor>) -> Result<HashMap<String, Tensor>> {
    let mut converted = HashMap::with_capacity(state.len());
    for (name, tensor) in state {
        let key = name.strip_prefix(MODEL_PREFIX).unwrap_or(&name).to_string();
        if key.contains(LM_HEAD_WEIGHT) {
            continue;
        }
        let tensor = if CONV_PROJECTIONS.iter().any(|suffix| key.ends_with(suffix)) {
            to_conv_weight(&tensor)?
        } else {
            tensor
        };
        converted.insert(key, tensor);
    }
    Ok(converted)
}
