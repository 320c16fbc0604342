use qwen_ane::{
    ModelOptions, QwenConfig, QwenForCausalLM, SamplingParams, Tensor, causal_mask, sample,
};
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::env;
use std::io::{self, Write};
use std::path::Path;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        eprintln!("Usage: {} <model_dir> [token_ids] [options]", args[0]);
        eprintln!("  token_ids         Comma-separated prompt ids (default: bos)");
        eprintln!("Options:");
        eprintln!("  --temp <float>    Temperature (default: 1.0, 0 = greedy)");
        eprintln!("  --topp <float>    Top-p sampling (default: 0.9)");
        eprintln!("  --steps <int>     Max tokens to generate (default: 64)");
        eprintln!("  --seed <int>      Random seed (default: 0)");
        eprintln!("  --splits <int>    Vocabulary head partitions (default: 16)");
        std::process::exit(1);
    }

    let model_dir = Path::new(&args[1]);
    let prompt = args
        .get(2)
        .filter(|s| !s.starts_with("--"))
        .map(|s| s.as_str())
        .unwrap_or("");

    // Parse optional arguments
    let mut temp = 1.0;
    let mut topp = 0.9;
    let mut steps = 64usize;
    let mut seed = 0u64;
    let mut splits = ModelOptions::default().vocab_splits;

    let mut i = 2;
    while i < args.len() {
        match args[i].as_str() {
            "--temp" => {
                temp = args.get(i + 1).and_then(|s| s.parse().ok()).unwrap_or(1.0);
                i += 2;
            }
            "--topp" => {
                topp = args.get(i + 1).and_then(|s| s.parse().ok()).unwrap_or(0.9);
                i += 2;
            }
            "--steps" => {
                steps = args.get(i + 1).and_then(|s| s.parse().ok()).unwrap_or(64);
                i += 2;
            }
            "--seed" => {
                seed = args.get(i + 1).and_then(|s| s.parse().ok()).unwrap_or(0);
                i += 2;
            }
            "--splits" => {
                splits = args.get(i + 1).and_then(|s| s.parse().ok()).unwrap_or(splits);
                i += 2;
            }
            _ => i += 1,
        }
    }

    // Load config and weights
    let config = QwenConfig::from_json_file(model_dir.join("config.json"))?;
    eprintln!(
        "Config: hidden={}, layers={}, heads={}/{}, vocab={}",
        config.hidden_size,
        config.num_hidden_layers,
        config.num_attention_heads,
        config.num_key_value_heads,
        config.vocab_size
    );
    // shards go straight to the sampler
    let options = ModelOptions {
        vocab_splits: splits,
        split_logits: true,
        ..ModelOptions::default()
    };
    let params = SamplingParams {
        temperature: temp,
        top_p: topp,
    };
    let mut lm = QwenForCausalLM::new(&config, options)?;
    if !lm.load_pretrained_weights(model_dir)? {
        tracing::warn!("checkpoint did not cover the model exactly");
    }

    let mut tokens: Vec<i64> = prompt
        .split(',')
        .filter(|s| !s.trim().is_empty())
        .map(|s| s.trim().parse())
        .collect::<Result<_, _>>()?;
    if tokens.is_empty() {
        tokens.push(i64::from(config.bos_token_id));
    }
    eprintln!("Prompt tokens: {:?}", tokens);

    let limit = config.context_length.min(config.max_position_embeddings);
    if tokens.len() > limit {
        return Err(format!("prompt of {} tokens exceeds context of {}", tokens.len(), limit).into());
    }
    let mask = causal_mask(limit);
    let mut rng = StdRng::seed_from_u64(seed);

    // Prefill
    let (input, positions) = sequence(&tokens)?;
    lm.prefill_kv_cache(&input, &positions, 0, Some(&mask))?;

    // Generate
    for _ in 0..steps {
        if tokens.len() >= limit {
            break;
        }
        let current = tokens.len() - 1;
        let (input, positions) = sequence(&tokens)?;
        let logits = lm.forward(&input, None, &positions, Some(&mask), Some(current), false)?;
        let next = sample(&logits, params, &mut rng)?;
        print!("{} ", next);
        io::stdout().flush()?;

        // Check for EOS
        if next as u64 == u64::from(config.eos_token_id) {
            break;
        }
        tokens.push(next as i64);
    }

    println!();
    Ok(())
}

/// `[1, S]` ids with positions `0..S`.
fn sequence(tokens: &[i64]) -> qwen_ane::Result<(Tensor<i64>, Tensor<i64>)> {
    let input = Tensor::new([1, tokens.len()], tokens.to_vec())?;
    let positions = Tensor::new([tokens.len()], (0..tokens.len() as i64).collect())?;
    Ok((input, positions))
}
