// Shared fixtures: a tiny Llama base model and a LoRA adapter directory
// written to a temp dir in the on-disk layouts the crate reads.

#![allow(dead_code)]

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use safetensors::tensor::{Dtype, TensorView};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

pub const HIDDEN: usize = 8;
pub const KV_DIM: usize = 4;
pub const INTERMEDIATE: usize = 12;
pub const VOCAB: usize = 16;
pub const LAYERS: usize = 2;
pub const RANK: usize = 2;

/// Parameters of the base model written by [`write_base_model`].
pub const BASE_PARAMETERS: usize = 1256;
/// LoRA factors written by [`write_adapter`].
pub const ADAPTER_PARAMETERS: usize = 112;

pub struct Fixture {
    pub root: TempDir,
    pub model_dir: PathBuf,
    pub base_dir: PathBuf,
}

pub fn tokenizer_fixture() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/tokenizer.json")
}

fn write_f32_safetensors(path: &Path, tensors: &[(String, Vec<usize>, Vec<f32>)]) {
    let raw: Vec<(String, Vec<usize>, Vec<u8>)> = tensors
        .iter()
        .map(|(name, shape, values)| {
            let bytes = values.iter().flat_map(|v| v.to_le_bytes()).collect();
            (name.clone(), shape.clone(), bytes)
        })
        .collect();
    let views: HashMap<String, TensorView> = raw
        .iter()
        .map(|(name, shape, bytes)| {
            (
                name.clone(),
                TensorView::new(Dtype::F32, shape.clone(), bytes).unwrap(),
            )
        })
        .collect();
    fs::write(path, safetensors::serialize(&views, &None).unwrap()).unwrap();
}

fn noise(rng: &mut StdRng, name: String, shape: Vec<usize>) -> (String, Vec<usize>, Vec<f32>) {
    let len = shape.iter().product();
    let values = (0..len).map(|_| rng.gen_range(-0.5..0.5)).collect();
    (name, shape, values)
}

pub fn write_base_model(dir: &Path, seed: u64) {
    fs::create_dir_all(dir).unwrap();
    let config = serde_json::json!({
        "architectures": ["LlamaForCausalLM"],
        "model_type": "llama",
        "vocab_size": VOCAB,
        "hidden_size": HIDDEN,
        "intermediate_size": INTERMEDIATE,
        "num_hidden_layers": LAYERS,
        "num_attention_heads": 2,
        "num_key_value_heads": 1,
        "max_position_embeddings": 64,
        "rms_norm_eps": 1e-5,
        "rope_theta": 10000.0,
        "bos_token_id": 1,
        "eos_token_id": 2,
        "tie_word_embeddings": false,
        "torch_dtype": "float32"
    });
    fs::write(dir.join("config.json"), config.to_string()).unwrap();

    let mut rng = StdRng::seed_from_u64(seed);
    let mut tensors = vec![
        noise(&mut rng, "model.embed_tokens.weight".into(), vec![VOCAB, HIDDEN]),
        noise(&mut rng, "model.norm.weight".into(), vec![HIDDEN]),
        noise(&mut rng, "lm_head.weight".into(), vec![VOCAB, HIDDEN]),
    ];
    for l in 0..LAYERS {
        let key = |suffix: &str| format!("model.layers.{}.{}", l, suffix);
        tensors.extend([
            noise(&mut rng, key("input_layernorm.weight"), vec![HIDDEN]),
            noise(&mut rng, key("post_attention_layernorm.weight"), vec![HIDDEN]),
            noise(&mut rng, key("self_attn.q_proj.weight"), vec![HIDDEN, HIDDEN]),
            noise(&mut rng, key("self_attn.k_proj.weight"), vec![KV_DIM, HIDDEN]),
            noise(&mut rng, key("self_attn.v_proj.weight"), vec![KV_DIM, HIDDEN]),
            noise(&mut rng, key("self_attn.o_proj.weight"), vec![HIDDEN, HIDDEN]),
            noise(&mut rng, key("mlp.gate_proj.weight"), vec![INTERMEDIATE, HIDDEN]),
            noise(&mut rng, key("mlp.up_proj.weight"), vec![INTERMEDIATE, HIDDEN]),
            noise(&mut rng, key("mlp.down_proj.weight"), vec![HIDDEN, INTERMEDIATE]),
        ]);
    }
    write_f32_safetensors(&dir.join("model.safetensors"), &tensors);
}

/// Adapter on `q_proj` and `v_proj` of every layer. With `drop_lora_b` the
/// first layer's `q_proj.lora_B` is left out.
pub fn write_adapter(dir: &Path, seed: u64, drop_lora_b: bool) {
    fs::create_dir_all(dir).unwrap();
    let config = serde_json::json!({
        "base_model_name_or_path": "TinyLlama/TinyLlama-1.1B-Chat-v1.0",
        "peft_type": "LORA",
        "task_type": "CAUSAL_LM",
        "r": RANK,
        "lora_alpha": 4,
        "lora_dropout": 0.05,
        "target_modules": ["q_proj", "v_proj"],
        "bias": "none",
        "inference_mode": true
    });
    fs::write(dir.join("adapter_config.json"), config.to_string()).unwrap();

    let mut rng = StdRng::seed_from_u64(seed);
    let mut tensors = Vec::new();
    for l in 0..LAYERS {
        for (module, out) in [("q_proj", HIDDEN), ("v_proj", KV_DIM)] {
            let prefix = format!("base_model.model.model.layers.{}.self_attn.{}", l, module);
            tensors.push(noise(&mut rng, format!("{}.lora_A.weight", prefix), vec![RANK, HIDDEN]));
            if drop_lora_b && l == 0 && module == "q_proj" {
                continue;
            }
            tensors.push(noise(&mut rng, format!("{}.lora_B.weight", prefix), vec![out, RANK]));
        }
    }
    write_f32_safetensors(&dir.join("adapter_model.safetensors"), &tensors);

    fs::copy(tokenizer_fixture(), dir.join("tokenizer.json")).unwrap();
    fs::write(
        dir.join("tokenizer_config.json"),
        r#"{"bos_token": "<s>", "eos_token": "</s>", "unk_token": "[UNK]"}"#,
    )
    .unwrap();
}

pub fn tiny_fixture() -> Fixture {
    fixture(false)
}

pub fn fixture(drop_lora_b: bool) -> Fixture {
    let root = tempfile::tempdir().unwrap();
    let model_dir = root.path().join("models").join("recipe-model");
    let base_dir = root.path().join("base");
    write_base_model(&base_dir, 5);
    write_adapter(&model_dir, 9, drop_lora_b);
    Fixture {
        root,
        model_dir,
        base_dir,
    }
}
