// src/llama.rs
// Llama-family decoder on `ndarray`, f32 on the CPU.
//
// Weight names follow the Hugging Face layout (`model.layers.{i}.self_attn.q_proj.weight`,
// ...). Incremental decoding goes through `KvCache`.

use ndarray::{concatenate, s, Array1, Array2, ArrayView1, Axis};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::Path;

use crate::error::{Error, Result};
use crate::weights::WeightStore;

fn default_rms_norm_eps() -> f32 {
    1e-6
}

fn default_rope_theta() -> f32 {
    10_000.0
}

fn default_max_position_embeddings() -> usize {
    2048
}

/// `eos_token_id` is a single id in most configs and a list in some.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum TokenIds {
    One(u32),
    Many(Vec<u32>),
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct LlamaConfig {
    pub vocab_size: usize,
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    /// Defaults to `num_attention_heads` (no grouped-query attention).
    #[serde(default)]
    pub num_key_value_heads: Option<usize>,
    #[serde(default = "default_rms_norm_eps")]
    pub rms_norm_eps: f32,
    #[serde(default = "default_rope_theta")]
    pub rope_theta: f32,
    #[serde(default = "default_max_position_embeddings")]
    pub max_position_embeddings: usize,
    #[serde(default)]
    pub bos_token_id: Option<u32>,
    #[serde(default)]
    pub eos_token_id: Option<TokenIds>,
    #[serde(default)]
    pub tie_word_embeddings: bool,
    #[serde(default)]
    pub model_type: Option<String>,
}

impl LlamaConfig {
    pub fn load(config_path: &Path) -> Result<Self> {
        let mut file = File::open(config_path).map_err(|e| Error::io(config_path, e))?;
        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .map_err(|e| Error::io(config_path, e))?;
        let config: LlamaConfig =
            serde_json::from_str(&contents).map_err(|e| Error::json(config_path, e))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(model_type) = &self.model_type {
            if !matches!(model_type.as_str(), "llama" | "mistral") {
                return Err(Error::invalid(
                    "model_type",
                    format!("`{}` is not a Llama-family architecture", model_type),
                ));
            }
        }
        if self.num_attention_heads == 0 || self.hidden_size % self.num_attention_heads != 0 {
            return Err(Error::invalid(
                "hidden_size",
                format!(
                    "{} is not divisible by {} attention heads",
                    self.hidden_size, self.num_attention_heads
                ),
            ));
        }
        if self.head_dim() % 2 != 0 {
            return Err(Error::invalid("head_dim", "rotary embeddings need an even head size"));
        }
        let kv = self.kv_heads();
        if kv == 0 || self.num_attention_heads % kv != 0 {
            return Err(Error::invalid(
                "num_key_value_heads",
                format!(
                    "{} attention heads cannot be grouped over {} key/value heads",
                    self.num_attention_heads, kv
                ),
            ));
        }
        Ok(())
    }

    pub fn head_dim(&self) -> usize {
        self.hidden_size / self.num_attention_heads
    }

    pub fn kv_heads(&self) -> usize {
        self.num_key_value_heads.unwrap_or(self.num_attention_heads)
    }

    pub fn eos_token_ids(&self) -> Vec<u32> {
        match &self.eos_token_id {
            Some(TokenIds::One(id)) => vec![*id],
            Some(TokenIds::Many(ids)) => ids.clone(),
            None => Vec::new(),
        }
    }
}

fn layer_key(layer: usize, suffix: &str) -> String {
    format!("model.layers.{}.{}", layer, suffix)
}

/// `x · wᵀ` for a weight stored as `[out_features, in_features]`.
fn linear(x: &Array2<f32>, weight: &Array2<f32>) -> Array2<f32> {
    x.dot(&weight.t())
}

fn rms_norm(x: &Array2<f32>, weight: &Array1<f32>, eps: f32) -> Array2<f32> {
    let mut out = x.clone();
    for mut row in out.rows_mut() {
        let scale = rms_scale(row.view(), eps);
        row.zip_mut_with(weight, |v, w| *v = *v * scale * w);
    }
    out
}

fn rms_scale(row: ArrayView1<f32>, eps: f32) -> f32 {
    let mean_sq = row.iter().map(|v| v * v).sum::<f32>() / row.len() as f32;
    1.0 / (mean_sq + eps).sqrt()
}

fn silu(x: f32) -> f32 {
    x / (1.0 + (-x).exp())
}

fn softmax_in_place(values: &mut [f32]) {
    let max = values.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let mut sum = 0.0;
    for v in values.iter_mut() {
        *v = (*v - max).exp();
        sum += *v;
    }
    for v in values.iter_mut() {
        *v /= sum;
    }
}

/// Rotary position embedding, rotate-half convention.
#[derive(Debug, Clone)]
struct RotaryEmbedding {
    inv_freq: Vec<f32>,
    head_dim: usize,
}

impl RotaryEmbedding {
    fn new(head_dim: usize, theta: f32) -> Self {
        let inv_freq = (0..head_dim / 2)
            .map(|i| 1.0 / theta.powf((2 * i) as f32 / head_dim as f32))
            .collect();
        Self { inv_freq, head_dim }
    }

    /// Rotates every head of every row; row `i` sits at position `start + i`.
    fn apply(&self, x: &mut Array2<f32>, start: usize, num_heads: usize) {
        let half = self.head_dim / 2;
        for (i, mut row) in x.rows_mut().into_iter().enumerate() {
            let pos = (start + i) as f32;
            for h in 0..num_heads {
                let base = h * self.head_dim;
                for (j, freq) in self.inv_freq.iter().enumerate() {
                    let (sin, cos) = (pos * freq).sin_cos();
                    let x1 = row[base + j];
                    let x2 = row[base + j + half];
                    row[base + j] = x1 * cos - x2 * sin;
                    row[base + j + half] = x2 * cos + x1 * sin;
                }
            }
        }
    }
}

#[derive(Debug, Clone)]
struct LayerCache {
    keys: Array2<f32>,
    values: Array2<f32>,
}

/// Keys and values of every position seen so far, per layer.
#[derive(Debug, Clone)]
pub struct KvCache {
    layers: Vec<LayerCache>,
}

impl KvCache {
    pub fn seq_len(&self) -> usize {
        self.layers.first().map_or(0, |l| l.keys.nrows())
    }
}

#[derive(Debug)]
struct Attention {
    q_proj: Array2<f32>,
    k_proj: Array2<f32>,
    v_proj: Array2<f32>,
    o_proj: Array2<f32>,
}

#[derive(Debug)]
struct Mlp {
    gate_proj: Array2<f32>,
    up_proj: Array2<f32>,
    down_proj: Array2<f32>,
}

impl Mlp {
    fn forward(&self, x: &Array2<f32>) -> Array2<f32> {
        let mut gate = linear(x, &self.gate_proj);
        let up = linear(x, &self.up_proj);
        gate.zip_mut_with(&up, |g, u| *g = silu(*g) * u);
        linear(&gate, &self.down_proj)
    }
}

#[derive(Debug)]
struct DecoderLayer {
    input_layernorm: Array1<f32>,
    self_attn: Attention,
    post_attention_layernorm: Array1<f32>,
    mlp: Mlp,
}

#[derive(Debug)]
pub struct LlamaModel {
    config: LlamaConfig,
    embed_tokens: Array2<f32>,
    layers: Vec<DecoderLayer>,
    norm: Array1<f32>,
    /// `None` when tied to `embed_tokens`.
    lm_head: Option<Array2<f32>>,
    rope: RotaryEmbedding,
}

impl LlamaModel {
    /// Builds the model, taking its tensors out of `weights`.
    pub fn from_weights(config: LlamaConfig, weights: &mut WeightStore) -> Result<Self> {
        config.validate()?;
        let hidden = config.hidden_size;
        let inter = config.intermediate_size;
        let kv_dim = config.kv_heads() * config.head_dim();

        let embed_tokens = weights.take_matrix("model.embed_tokens.weight", config.vocab_size, hidden)?;

        let mut layers = Vec::with_capacity(config.num_hidden_layers);
        for i in 0..config.num_hidden_layers {
            let mut matrix = |suffix: &str, rows: usize, cols: usize| {
                weights.take_matrix(&layer_key(i, suffix), rows, cols)
            };
            let self_attn = Attention {
                q_proj: matrix("self_attn.q_proj.weight", hidden, hidden)?,
                k_proj: matrix("self_attn.k_proj.weight", kv_dim, hidden)?,
                v_proj: matrix("self_attn.v_proj.weight", kv_dim, hidden)?,
                o_proj: matrix("self_attn.o_proj.weight", hidden, hidden)?,
            };
            let mlp = Mlp {
                gate_proj: matrix("mlp.gate_proj.weight", inter, hidden)?,
                up_proj: matrix("mlp.up_proj.weight", inter, hidden)?,
                down_proj: matrix("mlp.down_proj.weight", hidden, inter)?,
            };
            layers.push(DecoderLayer {
                input_layernorm: weights.take_vector(&layer_key(i, "input_layernorm.weight"), hidden)?,
                self_attn,
                post_attention_layernorm: weights
                    .take_vector(&layer_key(i, "post_attention_layernorm.weight"), hidden)?,
                mlp,
            });
        }

        let norm = weights.take_vector("model.norm.weight", hidden)?;
        let lm_head = if config.tie_word_embeddings {
            None
        } else {
            Some(weights.take_matrix("lm_head.weight", config.vocab_size, hidden)?)
        };
        let rope = RotaryEmbedding::new(config.head_dim(), config.rope_theta);

        Ok(Self {
            config,
            embed_tokens,
            layers,
            norm,
            lm_head,
            rope,
        })
    }

    pub fn config(&self) -> &LlamaConfig {
        &self.config
    }

    pub fn parameter_count(&self) -> usize {
        let layers: usize = self
            .layers
            .iter()
            .map(|l| {
                l.input_layernorm.len()
                    + l.post_attention_layernorm.len()
                    + l.self_attn.q_proj.len()
                    + l.self_attn.k_proj.len()
                    + l.self_attn.v_proj.len()
                    + l.self_attn.o_proj.len()
                    + l.mlp.gate_proj.len()
                    + l.mlp.up_proj.len()
                    + l.mlp.down_proj.len()
            })
            .sum();
        self.embed_tokens.len()
            + layers
            + self.norm.len()
            + self.lm_head.as_ref().map_or(0, Array2::len)
    }

    pub fn new_cache(&self) -> KvCache {
        let kv_dim = self.config.kv_heads() * self.config.head_dim();
        KvCache {
            layers: (0..self.layers.len())
                .map(|_| LayerCache {
                    keys: Array2::zeros((0, kv_dim)),
                    values: Array2::zeros((0, kv_dim)),
                })
                .collect(),
        }
    }

    /// Runs `tokens` after the positions already in `cache` and returns the
    /// logits of the last token.
    pub fn forward(&self, tokens: &[u32], cache: &mut KvCache) -> Result<Vec<f32>> {
        if tokens.is_empty() {
            return Err(Error::Generation("forward pass needs at least one token".to_string()));
        }
        if cache.layers.len() != self.layers.len() {
            return Err(Error::Generation(format!(
                "cache has {} layers, model has {}",
                cache.layers.len(),
                self.layers.len()
            )));
        }
        let start = cache.seq_len();
        if start + tokens.len() > self.config.max_position_embeddings {
            return Err(Error::Generation(format!(
                "sequence length {} exceeds max_position_embeddings {}",
                start + tokens.len(),
                self.config.max_position_embeddings
            )));
        }

        let mut x = Array2::zeros((tokens.len(), self.config.hidden_size));
        for (i, &token) in tokens.iter().enumerate() {
            let token = token as usize;
            if token >= self.config.vocab_size {
                return Err(Error::Generation(format!(
                    "token id {} is out of vocab size {}",
                    token, self.config.vocab_size
                )));
            }
            x.row_mut(i).assign(&self.embed_tokens.row(token));
        }

        let eps = self.config.rms_norm_eps;
        for (layer, layer_cache) in self.layers.iter().zip(cache.layers.iter_mut()) {
            let h = rms_norm(&x, &layer.input_layernorm, eps);
            x = x + self.attention(&layer.self_attn, &h, start, layer_cache)?;
            let h = rms_norm(&x, &layer.post_attention_layernorm, eps);
            x = x + layer.mlp.forward(&h);
        }

        let last = x.row(tokens.len() - 1);
        let scale = rms_scale(last, eps);
        let normed: Array1<f32> = last
            .iter()
            .zip(self.norm.iter())
            .map(|(v, w)| v * scale * w)
            .collect();
        let head = self.lm_head.as_ref().unwrap_or(&self.embed_tokens);
        Ok(head.dot(&normed).to_vec())
    }

    fn attention(
        &self,
        attn: &Attention,
        h: &Array2<f32>,
        start: usize,
        cache: &mut LayerCache,
    ) -> Result<Array2<f32>> {
        let heads = self.config.num_attention_heads;
        let kv_heads = self.config.kv_heads();
        let head_dim = self.config.head_dim();
        let group = heads / kv_heads;
        let n = h.nrows();

        let mut q = linear(h, &attn.q_proj);
        let mut k = linear(h, &attn.k_proj);
        let v = linear(h, &attn.v_proj);
        self.rope.apply(&mut q, start, heads);
        self.rope.apply(&mut k, start, kv_heads);

        let cache_err = |e: ndarray::ShapeError| Error::Generation(format!("kv cache: {}", e));
        cache.keys = concatenate(Axis(0), &[cache.keys.view(), k.view()]).map_err(cache_err)?;
        cache.values = concatenate(Axis(0), &[cache.values.view(), v.view()]).map_err(cache_err)?;
        let total = cache.keys.nrows();

        let scale = 1.0 / (head_dim as f32).sqrt();
        let mut out = Array2::zeros((n, heads * head_dim));
        for head in 0..heads {
            let cols = head * head_dim..(head + 1) * head_dim;
            let kv = head / group;
            let kv_cols = kv * head_dim..(kv + 1) * head_dim;

            let qh = q.slice(s![.., cols.clone()]);
            let kh = cache.keys.slice(s![.., kv_cols.clone()]);
            let vh = cache.values.slice(s![.., kv_cols]);

            let mut scores = qh.dot(&kh.t());
            for (i, mut row) in scores.rows_mut().into_iter().enumerate() {
                let visible = start + i + 1;
                for (j, score) in row.iter_mut().enumerate() {
                    *score = if j < visible { *score * scale } else { f32::NEG_INFINITY };
                }
                if let Some(slice) = row.as_slice_mut() {
                    softmax_in_place(slice);
                } else {
                    let mut tmp = row.to_vec();
                    softmax_in_place(&mut tmp);
                    row.assign(&Array1::from(tmp));
                }
            }
            debug_assert_eq!(scores.ncols(), total);

            out.slice_mut(s![.., cols]).assign(&scores.dot(&vh));
        }
        Ok(linear(&out, &attn.o_proj))
    }
}
