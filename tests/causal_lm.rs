use byteorder::{LittleEndian, WriteBytesExt};
use half::f16;
use qwen_ane::{
    Logits, ModelOptions, NormKind, QwenConfig, QwenError, QwenForCausalLM, Tensor, causal_mask,
    greedy,
};
use rand::rngs::StdRng;
use rand::{RngExt, SeedableRng};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

fn tiny_config() -> QwenConfig {
    QwenConfig {
        hidden_size: 8,
        intermediate_size: 16,
        num_hidden_layers: 2,
        num_attention_heads: 2,
        num_key_value_heads: 1,
        head_dim: None,
        vocab_size: 17,
        max_position_embeddings: 32,
        context_length: 16,
        state_length: 16,
        ..QwenConfig::default()
    }
}

fn options(vocab_splits: usize) -> ModelOptions {
    ModelOptions {
        vocab_splits,
        ..ModelOptions::default()
    }
}

fn random_tensor(rng: &mut StdRng, shape: Vec<usize>, center: f32) -> Tensor {
    let n: usize = shape.iter().product();
    let values: Vec<f32> = (0..n).map(|_| center + rng.random::<f32>() - 0.5).collect();
    Tensor::from_f32(shape, &values).unwrap()
}

/// A checkpoint in Hugging Face layout: `model.` prefix, 2D projections,
/// unsplit `lm_head.weight`.
fn random_checkpoint(config: &QwenConfig, seed: u64) -> HashMap<String, Tensor> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut template = QwenForCausalLM::new(config, options(1)).unwrap();
    let mut state = HashMap::new();
    for (name, param) in template.model.named_parameters_mut() {
        let shape = param.shape()[..param.rank().min(2)].to_vec();
        let center = if name.ends_with("norm.weight") { 1.0 } else { 0.0 };
        state.insert(format!("model.{name}"), random_tensor(&mut rng, shape, center));
    }
    state.insert(
        "lm_head.weight".to_string(),
        random_tensor(&mut rng, vec![config.vocab_size, config.hidden_size], 0.0),
    );
    state
}

fn loaded(config: &QwenConfig, opts: ModelOptions, checkpoint: &HashMap<String, Tensor>) -> QwenForCausalLM {
    let mut lm = QwenForCausalLM::new(config, opts).unwrap();
    let report = lm.load_state(checkpoint.clone()).unwrap();
    assert!(report.is_complete(), "{report:?}");
    lm
}

fn sequence(tokens: &[i64]) -> (Tensor<i64>, Tensor<i64>) {
    let input = Tensor::new([1, tokens.len()], tokens.to_vec()).unwrap();
    let positions = Tensor::new([tokens.len()], (0..tokens.len() as i64).collect()).unwrap();
    (input, positions)
}

fn f16_bytes(t: &Tensor) -> Vec<u8> {
    let mut out = Vec::new();
    for v in t.data() {
        out.write_u16::<LittleEndian>(v.to_bits()).unwrap();
    }
    out
}

fn f32_bytes(t: &Tensor) -> Vec<u8> {
    let mut out = Vec::new();
    for v in t.data() {
        out.write_f32::<LittleEndian>(v.to_f32()).unwrap();
    }
    out
}

/// Write tensors as a safetensors file; names listed in `as_f32` are stored as F32.
fn write_safetensors(path: &Path, tensors: &[(&String, &Tensor)], as_f32: &[&str]) {
    let mut header = serde_json::Map::new();
    let mut data = Vec::new();
    for (name, tensor) in tensors {
        let wide = as_f32.contains(&name.as_str());
        let (dtype, bytes) = if wide {
            ("F32", f32_bytes(tensor))
        } else {
            ("F16", f16_bytes(tensor))
        };
        let start = data.len();
        data.extend_from_slice(&bytes);
        header.insert(
            name.to_string(),
            serde_json::json!({
                "dtype": dtype,
                "shape": tensor.shape(),
                "data_offsets": [start, data.len()],
            }),
        );
    }
    let header = serde_json::to_vec(&header).unwrap();
    let mut file = Vec::new();
    file.write_u64::<LittleEndian>(header.len() as u64).unwrap();
    file.extend_from_slice(&header);
    file.extend_from_slice(&data);
    fs::write(path, file).unwrap();
}

fn sorted(checkpoint: &HashMap<String, Tensor>) -> Vec<(&String, &Tensor)> {
    let mut entries: Vec<_> = checkpoint.iter().collect();
    entries.sort_by(|a, b| a.0.cmp(b.0));
    entries
}

#[test]
fn test_split_head_logits_match_unsplit_model() {
    let config = tiny_config();
    let checkpoint = random_checkpoint(&config, 11);
    let (input, positions) = sequence(&[3, 9, 14]);
    let mask = causal_mask(config.context_length);

    let whole = loaded(&config, options(1), &checkpoint);
    let expected = whole
        .forward(&input, None, &positions, Some(&mask), None, false)
        .unwrap()
        .into_merged()
        .unwrap();
    assert_eq!(expected.shape(), &[1, 3, 17]);
    assert!(expected.data().iter().all(|v| v.is_finite()));

    let split = loaded(&config, options(2), &checkpoint);
    let merged = split
        .forward(&input, None, &positions, Some(&mask), None, false)
        .unwrap();
    assert_eq!(merged, Logits::Merged(expected.clone()));

    let parts_opts = ModelOptions {
        split_logits: true,
        ..options(2)
    };
    let parts_lm = loaded(&config, parts_opts, &checkpoint);
    let Logits::Split(parts) = parts_lm
        .forward(&input, None, &positions, Some(&mask), None, false)
        .unwrap()
    else {
        panic!("expected split logits");
    };
    assert_eq!(parts.len(), 2);
    assert_eq!(parts[0].shape(), &[1, 3, 9]);
    assert_eq!(parts[1].shape(), &[1, 3, 8]);
    assert_eq!(Tensor::cat(&parts, 2).unwrap(), expected);
}

#[test]
fn test_decode_step_extracts_current_position() {
    let config = tiny_config();
    let lm = loaded(&config, options(2), &random_checkpoint(&config, 5));
    let (input, positions) = sequence(&[1, 2, 3, 4, 5]);
    let mask = causal_mask(config.context_length);

    let full = lm
        .forward(&input, None, &positions, Some(&mask), None, false)
        .unwrap()
        .into_merged()
        .unwrap();
    let step = lm
        .forward(&input, None, &positions, Some(&mask), Some(3), false)
        .unwrap()
        .into_merged()
        .unwrap();
    assert_eq!(step.shape(), &[1, 1, 17]);
    assert_eq!(step, full.narrow(1, 3, 1).unwrap());
}

#[test]
fn test_causal_prefix_is_stable() {
    // later tokens must not change logits of earlier positions
    let config = tiny_config();
    let lm = loaded(&config, options(4), &random_checkpoint(&config, 23));
    let mask = causal_mask(config.context_length);

    let (short_in, short_pos) = sequence(&[7, 8]);
    let (long_in, long_pos) = sequence(&[7, 8, 12, 0]);
    let short = lm
        .forward(&short_in, None, &short_pos, Some(&mask), None, false)
        .unwrap()
        .into_merged()
        .unwrap();
    let long = lm
        .forward(&long_in, None, &long_pos, Some(&mask), None, false)
        .unwrap()
        .into_merged()
        .unwrap();
    assert_eq!(long.narrow(1, 0, 2).unwrap(), short);
}

#[test]
fn test_load_is_idempotent() {
    let config = tiny_config();
    let checkpoint = random_checkpoint(&config, 3);
    let (input, positions) = sequence(&[0, 16]);

    let first = loaded(&config, options(3), &checkpoint);
    let second = loaded(&config, options(3), &checkpoint);
    assert_eq!(
        first
            .forward(&input, None, &positions, None, Some(1), false)
            .unwrap(),
        second
            .forward(&input, None, &positions, None, Some(1), false)
            .unwrap()
    );

    // reloading an already loaded model changes nothing
    let mut reloaded = loaded(&config, options(3), &checkpoint);
    assert!(reloaded.load_state(checkpoint.clone()).unwrap().is_complete());
    assert_eq!(
        reloaded
            .forward(&input, None, &positions, None, Some(1), false)
            .unwrap(),
        first
            .forward(&input, None, &positions, None, Some(1), false)
            .unwrap()
    );
}

#[test]
fn test_rms_norm_variant_end_to_end() {
    let config = tiny_config();
    let checkpoint = random_checkpoint(&config, 17);
    let rms = ModelOptions {
        norm: NormKind::Rms,
        ..options(2)
    };
    let lm = loaded(&config, rms, &checkpoint);
    let (input, positions) = sequence(&[5, 10, 15]);
    let mask = causal_mask(config.context_length);

    let logits = lm
        .forward(&input, None, &positions, Some(&mask), None, false)
        .unwrap()
        .into_merged()
        .unwrap();
    assert_eq!(logits.shape(), &[1, 3, 17]);
    assert!(logits.data().iter().all(|v| v.is_finite()));

    // the variant really changes the normalization
    let centered = loaded(&config, options(2), &checkpoint)
        .forward(&input, None, &positions, Some(&mask), None, false)
        .unwrap()
        .into_merged()
        .unwrap();
    assert_ne!(logits, centered);
}

#[test]
fn test_greedy_over_split_logits_matches_merged() {
    let config = tiny_config();
    let checkpoint = random_checkpoint(&config, 29);
    let (input, positions) = sequence(&[1, 3, 5, 7]);
    let mask = causal_mask(config.context_length);
    let split_opts = ModelOptions {
        split_logits: true,
        ..options(4)
    };

    let parts = loaded(&config, split_opts, &checkpoint)
        .forward(&input, None, &positions, Some(&mask), Some(3), false)
        .unwrap();
    assert!(matches!(parts, Logits::Split(_)));
    let merged = loaded(&config, options(1), &checkpoint)
        .forward(&input, None, &positions, Some(&mask), Some(3), false)
        .unwrap();
    let id = greedy(&parts).unwrap();
    assert!(id < config.vocab_size);
    assert_eq!(id, greedy(&merged).unwrap());
}

#[test]
fn test_prefill_runs_without_logits() {
    let config = tiny_config();
    let lm = loaded(&config, options(2), &random_checkpoint(&config, 9));
    let (input, positions) = sequence(&[4, 5, 6]);
    let mask = causal_mask(config.context_length);
    lm.prefill_kv_cache(&input, &positions, 0, Some(&mask)).unwrap();

    let short = Tensor::new([2], vec![0i64, 1]).unwrap();
    assert!(matches!(
        lm.prefill_kv_cache(&input, &short, 0, Some(&mask)),
        Err(QwenError::Shape(_))
    ));
}

#[test]
fn test_load_report_lists_mismatches() {
    let config = tiny_config();
    let mut checkpoint = random_checkpoint(&config, 1);
    checkpoint.remove("model.layers.1.mlp.up_proj.weight");
    checkpoint.insert("model.layers.0.self_attn.rotary_emb.inv_freq".to_string(), Tensor::zeros([2]));
    checkpoint.insert("model.visual.proj.weight".to_string(), Tensor::zeros([2, 2]));

    let mut lm = QwenForCausalLM::new(&config, options(2)).unwrap();
    let report = lm.load_state(checkpoint).unwrap();
    assert_eq!(report.missing, vec!["layers.1.mlp.up_proj.weight"]);
    assert_eq!(report.unexpected, vec!["visual.proj.weight"]);
    assert!(report.lm_head_loaded);
    assert!(!report.is_complete());
}

#[test]
fn test_load_rejects_wrong_shape() {
    let config = tiny_config();
    let mut checkpoint = random_checkpoint(&config, 1);
    checkpoint.insert("model.norm.weight".to_string(), Tensor::zeros([4]));
    let mut lm = QwenForCausalLM::new(&config, options(2)).unwrap();
    assert!(matches!(lm.load_state(checkpoint), Err(QwenError::Shape(_))));
}

#[test]
fn test_pretrained_directory_round_trip() {
    let config = tiny_config();
    let checkpoint = random_checkpoint(&config, 42);
    let entries = sorted(&checkpoint);
    let (first, second) = entries.split_at(entries.len() / 2);

    let dir = tempfile::tempdir().unwrap();
    // one shard stored at full precision
    let wide = ["lm_head.weight", "model.embed_tokens.weight"];
    write_safetensors(&dir.path().join("model-00001-of-00002.safetensors"), first, &wide);
    write_safetensors(&dir.path().join("model-00002-of-00002.safetensors"), second, &wide);
    fs::write(dir.path().join("config.json"), "{}").unwrap();

    let mut from_disk = QwenForCausalLM::new(&config, options(2)).unwrap();
    assert!(from_disk.load_pretrained_weights(dir.path()).unwrap());

    let in_memory = loaded(&config, options(2), &checkpoint);
    let (input, positions) = sequence(&[2, 4, 6, 8]);
    let mask = causal_mask(config.context_length);
    assert_eq!(
        from_disk
            .forward(&input, None, &positions, Some(&mask), None, false)
            .unwrap(),
        in_memory
            .forward(&input, None, &positions, Some(&mask), None, false)
            .unwrap()
    );
}

#[test]
fn test_later_shard_overrides_earlier() {
    let config = tiny_config();
    let checkpoint = random_checkpoint(&config, 8);
    let dir = tempfile::tempdir().unwrap();
    write_safetensors(&dir.path().join("a.safetensors"), &sorted(&checkpoint), &[]);

    let name = "model.norm.weight".to_string();
    let replacement = Tensor::full([8], f16::from_f32(0.5));
    write_safetensors(&dir.path().join("b.safetensors"), &[(&name, &replacement)], &[]);

    let mut lm = QwenForCausalLM::new(&config, options(2)).unwrap();
    assert!(lm.load_pretrained_weights(dir.path()).unwrap());
    assert_eq!(lm.model.norm.weight, replacement);
}

#[test]
fn test_missing_head_fails_load() {
    let config = tiny_config();
    let mut checkpoint = random_checkpoint(&config, 2);
    checkpoint.remove("lm_head.weight");
    let dir = tempfile::tempdir().unwrap();
    write_safetensors(&dir.path().join("model.safetensors"), &sorted(&checkpoint), &[]);

    let mut lm = QwenForCausalLM::new(&config, options(2)).unwrap();
    assert!(!lm.load_pretrained_weights(dir.path()).unwrap());
}

#[test]
fn test_missing_directory_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let absent = dir.path().join("nope");
    let mut lm = QwenForCausalLM::new(&tiny_config(), options(2)).unwrap();
    assert!(matches!(
        lm.load_pretrained_weights(&absent),
        Err(QwenError::ModelDirNotFound(p)) if p == absent
    ));
}

#[test]
fn test_unsupported_dtype_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let header = br#"{"x":{"dtype":"I32","shape":[1],"data_offsets":[0,4]}}"#;
    let mut file = Vec::new();
    file.write_u64::<LittleEndian>(header.len() as u64).unwrap();
    file.extend_from_slice(header);
    file.extend_from_slice(&[0, 0, 0, 0]);
    fs::write(dir.path().join("bad.safetensors"), file).unwrap();

    let mut lm = QwenForCausalLM::new(&tiny_config(), options(2)).unwrap();
    assert!(matches!(
        lm.load_pretrained_weights(dir.path()),
        Err(QwenError::InvalidModel(_))
    ));
}
