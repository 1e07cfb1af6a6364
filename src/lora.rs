// src/lora.rs
// LoRA adapters saved in the PEFT layout: `adapter_config.json` plus
// `adapter_model.safetensors`.
//
// The adapter is merged into the base weights once, before the model is
// built: `W += scale · B·A` with `scale = lora_alpha / r`
// (`lora_alpha / √r` for rsLoRA).

use log::{debug, warn};
use ndarray::{Array2, ArrayD, Ix2};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use crate::artifacts::{ADAPTER_CONFIG, ADAPTER_WEIGHTS};
use crate::error::{Error, Result};
use crate::weights::WeightStore;

const PEFT_PREFIX: &str = "base_model.model.";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum TargetModules {
    Names(Vec<String>),
    /// PEFT also accepts a single regex; it is not interpreted here.
    Pattern(String),
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct AdapterConfig {
    #[serde(default)]
    pub base_model_name_or_path: Option<String>,
    #[serde(default)]
    pub peft_type: Option<String>,
    #[serde(default)]
    pub task_type: Option<String>,
    pub r: usize,
    pub lora_alpha: f32,
    #[serde(default)]
    pub lora_dropout: f32,
    #[serde(default)]
    pub target_modules: Option<TargetModules>,
    #[serde(default)]
    pub use_rslora: bool,
    #[serde(default)]
    pub fan_in_fan_out: bool,
    #[serde(default)]
    pub modules_to_save: Option<Vec<String>>,
}

impl AdapterConfig {
    pub fn load(config_path: &Path) -> Result<Self> {
        let mut file = File::open(config_path).map_err(|e| Error::io(config_path, e))?;
        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .map_err(|e| Error::io(config_path, e))?;
        let config: AdapterConfig =
            serde_json::from_str(&contents).map_err(|e| Error::json(config_path, e))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(peft_type) = &self.peft_type {
            if !peft_type.eq_ignore_ascii_case("lora") {
                return Err(Error::Adapter(format!(
                    "peft_type `{}` is not supported, only LORA adapters can be merged",
                    peft_type
                )));
            }
        }
        if self.r == 0 {
            return Err(Error::Adapter("rank `r` must be positive".to_string()));
        }
        Ok(())
    }

    pub fn scale(&self) -> f32 {
        if self.use_rslora {
            self.lora_alpha / (self.r as f32).sqrt()
        } else {
            self.lora_alpha / self.r as f32
        }
    }

    fn targets(&self, module: &str) -> bool {
        match &self.target_modules {
            Some(TargetModules::Names(names)) => {
                let leaf = module.rsplit('.').next().unwrap_or(module);
                names.iter().any(|n| n == leaf || n == module)
            }
            _ => true,
        }
    }
}

#[derive(Debug)]
struct LoraPair {
    /// `[r, in_features]`
    a: Array2<f32>,
    /// `[out_features, r]`
    b: Array2<f32>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MergeSummary {
    pub merged: usize,
    pub replaced: usize,
}

#[derive(Debug)]
pub struct LoraAdapter {
    config: AdapterConfig,
    /// Keyed by base module name, e.g. `model.layers.0.self_attn.q_proj`.
    pairs: BTreeMap<String, LoraPair>,
    /// Full tensors from `modules_to_save`, keyed by base tensor name.
    replacements: BTreeMap<String, ArrayD<f32>>,
}

enum AdapterKey {
    A(String),
    B(String),
    Full(String),
}

/// Maps a PEFT tensor name onto the base model's naming.
fn classify_key(key: &str) -> Result<AdapterKey> {
    let key = key.strip_prefix(PEFT_PREFIX).unwrap_or(key);

    if key.contains(".lora_embedding_") || key.contains(".lora_magnitude_vector") {
        return Err(Error::Adapter(format!(
            "tensor `{}` needs an adapter variant that cannot be merged here",
            key
        )));
    }
    for (marker, is_a) in [(".lora_A", true), (".lora_B", false)] {
        if let Some(idx) = key.find(marker) {
            let module = key[..idx].to_string();
            return Ok(if is_a { AdapterKey::A(module) } else { AdapterKey::B(module) });
        }
    }
    // `lm_head.modules_to_save.default.weight` -> `lm_head.weight`
    if let Some(idx) = key.find(".modules_to_save.") {
        let rest = &key[idx + ".modules_to_save.".len()..];
        let leaf = rest.rsplit('.').next().unwrap_or(rest);
        return Ok(AdapterKey::Full(format!("{}.{}", &key[..idx], leaf)));
    }
    Ok(AdapterKey::Full(key.to_string()))
}

impl LoraAdapter {
    /// Reads `adapter_config.json` and `adapter_model.safetensors` from `dir`.
    pub fn load(dir: &Path) -> Result<Self> {
        let config = AdapterConfig::load(&dir.join(ADAPTER_CONFIG))?;
        let mut store = WeightStore::new();
        store.extend_from_file(&dir.join(ADAPTER_WEIGHTS))?;
        Self::from_parts(config, store)
    }

    pub fn from_parts(config: AdapterConfig, store: WeightStore) -> Result<Self> {
        config.validate()?;
        let mut halves: BTreeMap<String, (Option<Array2<f32>>, Option<Array2<f32>>)> = BTreeMap::new();
        let mut replacements = BTreeMap::new();

        for (key, tensor) in store.into_tensors() {
            let as_matrix = |t: ArrayD<f32>| {
                let shape = t.shape().to_vec();
                t.into_dimensionality::<Ix2>().map_err(|_| {
                    Error::Adapter(format!("tensor `{}` must be 2-D, got shape {:?}", key, shape))
                })
            };
            match classify_key(&key)? {
                AdapterKey::A(module) => halves.entry(module).or_default().0 = Some(as_matrix(tensor)?),
                AdapterKey::B(module) => halves.entry(module).or_default().1 = Some(as_matrix(tensor)?),
                AdapterKey::Full(name) => {
                    replacements.insert(name, tensor);
                }
            }
        }

        let mut pairs = BTreeMap::new();
        for (module, halves) in halves {
            let (a, b) = match halves {
                (Some(a), Some(b)) => (a, b),
                (Some(_), None) => {
                    return Err(Error::Adapter(format!("`{}` has lora_A but no lora_B", module)))
                }
                (None, _) => {
                    return Err(Error::Adapter(format!("`{}` has lora_B but no lora_A", module)))
                }
            };
            if a.nrows() != config.r || b.ncols() != config.r {
                return Err(Error::Adapter(format!(
                    "`{}` has rank {}x{}, adapter config says r={}",
                    module,
                    a.nrows(),
                    b.ncols(),
                    config.r
                )));
            }
            if !config.targets(&module) {
                warn!("`{}` is not listed in target_modules", module);
            }
            pairs.insert(module, LoraPair { a, b });
        }

        Ok(Self {
            config,
            pairs,
            replacements,
        })
    }

    pub fn config(&self) -> &AdapterConfig {
        &self.config
    }

    pub fn modules(&self) -> impl Iterator<Item = &str> {
        self.pairs.keys().map(String::as_str)
    }

    /// Parameters the fine-tune trained: the LoRA factors plus any
    /// `modules_to_save` tensors.
    pub fn parameter_count(&self) -> usize {
        let pairs: usize = self.pairs.values().map(|p| p.a.len() + p.b.len()).sum();
        let full: usize = self.replacements.values().map(ArrayD::len).sum();
        pairs + full
    }

    /// Folds the adapter into `base`.
    pub fn merge_into(&self, base: &mut WeightStore) -> Result<MergeSummary> {
        let scale = self.config.scale();
        let mut summary = MergeSummary::default();

        for (module, pair) in &self.pairs {
            let name = format!("{}.weight", module);
            let weight = base
                .get_mut(&name)
                .ok_or_else(|| Error::TensorNotFound(name.clone()))?;
            let mut delta = pair.b.dot(&pair.a);
            delta *= scale;
            let delta = if self.config.fan_in_fan_out { delta.reversed_axes() } else { delta };

            let actual = weight.shape().to_vec();
            let mut weight = weight
                .view_mut()
                .into_dimensionality::<Ix2>()
                .map_err(|_| Error::ShapeMismatch {
                    name: name.clone(),
                    expected: delta.shape().to_vec(),
                    actual: actual.clone(),
                })?;
            if weight.shape() != delta.shape() {
                return Err(Error::ShapeMismatch {
                    name,
                    expected: delta.shape().to_vec(),
                    actual,
                });
            }
            weight += &delta;
            summary.merged += 1;
        }

        for (name, tensor) in &self.replacements {
            let weight = base
                .get_mut(name)
                .ok_or_else(|| Error::TensorNotFound(name.clone()))?;
            if weight.shape() != tensor.shape() {
                return Err(Error::ShapeMismatch {
                    name: name.clone(),
                    expected: weight.shape().to_vec(),
                    actual: tensor.shape().to_vec(),
                });
            }
            weight.assign(tensor);
            summary.replaced += 1;
        }

        debug!(
            "merged {} LoRA modules, replaced {} tensors (scale {})",
            summary.merged, summary.replaced, scale
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn config(r: usize, alpha: f32) -> AdapterConfig {
        AdapterConfig {
            base_model_name_or_path: Some("TinyLlama/TinyLlama-1.1B-Chat-v1.0".to_string()),
            peft_type: Some("LORA".to_string()),
            task_type: Some("CAUSAL_LM".to_string()),
            r,
            lora_alpha: alpha,
            lora_dropout: 0.05,
            target_modules: Some(TargetModules::Names(vec![
                "q_proj".to_string(),
                "v_proj".to_string(),
            ])),
            use_rslora: false,
            fan_in_fan_out: false,
            modules_to_save: None,
        }
    }

    #[test]
    fn parses_peft_adapter_config() {
        let json = r#"{
            "base_model_name_or_path": "TinyLlama/TinyLlama-1.1B-Chat-v1.0",
            "peft_type": "LORA", "task_type": "CAUSAL_LM",
            "r": 16, "lora_alpha": 32, "lora_dropout": 0.05,
            "target_modules": ["q_proj", "k_proj", "v_proj", "o_proj"],
            "bias": "none", "inference_mode": true
        }"#;
        let config: AdapterConfig = serde_json::from_str(json).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.scale(), 2.0);
        assert!(config.targets("model.layers.3.self_attn.o_proj"));
        assert!(!config.targets("model.layers.3.mlp.up_proj"));

        let rslora = AdapterConfig { use_rslora: true, ..config };
        assert_eq!(rslora.scale(), 8.0);
    }

    #[test]
    fn rejects_other_peft_types() {
        let mut cfg = config(4, 8.0);
        cfg.peft_type = Some("IA3".to_string());
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn classifies_peft_key_names() {
        let module = |k: &str| match classify_key(k).unwrap() {
            AdapterKey::A(m) => format!("A:{}", m),
            AdapterKey::B(m) => format!("B:{}", m),
            AdapterKey::Full(m) => format!("F:{}", m),
        };
        assert_eq!(
            module("base_model.model.model.layers.0.self_attn.q_proj.lora_A.weight"),
            "A:model.layers.0.self_attn.q_proj"
        );
        assert_eq!(
            module("base_model.model.model.layers.0.self_attn.q_proj.lora_B.default.weight"),
            "B:model.layers.0.self_attn.q_proj"
        );
        assert_eq!(
            module("base_model.model.lm_head.modules_to_save.default.weight"),
            "F:lm_head.weight"
        );
        assert!(classify_key("base_model.model.model.embed_tokens.lora_embedding_A").is_err());
    }

    #[test]
    fn merge_adds_scaled_low_rank_delta() {
        let mut base = WeightStore::new();
        base.insert("layer.q_proj.weight", ArrayD::zeros(vec![2, 3]));

        let mut adapter = WeightStore::new();
        // A: [r=1, in=3], B: [out=2, r=1]
        adapter.insert(
            "base_model.model.layer.q_proj.lora_A.weight",
            array![[1.0f32, 2.0, 3.0]].into_dyn(),
        );
        adapter.insert(
            "base_model.model.layer.q_proj.lora_B.weight",
            array![[1.0f32], [-1.0]].into_dyn(),
        );
        let lora = LoraAdapter::from_parts(config(1, 2.0), adapter).unwrap();
        assert_eq!(lora.parameter_count(), 5);
        assert_eq!(lora.modules().collect::<Vec<_>>(), vec!["layer.q_proj"]);

        let summary = lora.merge_into(&mut base).unwrap();
        assert_eq!(summary, MergeSummary { merged: 1, replaced: 0 });
        let merged = base.get("layer.q_proj.weight").unwrap();
        assert_eq!(
            merged,
            &array![[2.0f32, 4.0, 6.0], [-2.0, -4.0, -6.0]].into_dyn()
        );
    }

    #[test]
    fn unpaired_factor_is_an_error() {
        let mut adapter = WeightStore::new();
        adapter.insert(
            "base_model.model.layer.v_proj.lora_A.weight",
            ArrayD::zeros(vec![2, 4]),
        );
        let err = LoraAdapter::from_parts(config(2, 4.0), adapter).unwrap_err();
        assert!(err.to_string().contains("no lora_B"));
    }

    #[test]
    fn rank_mismatch_is_an_error() {
        let mut adapter = WeightStore::new();
        adapter.insert("base_model.model.x.q_proj.lora_A.weight", ArrayD::zeros(vec![3, 4]));
        adapter.insert("base_model.model.x.q_proj.lora_B.weight", ArrayD::zeros(vec![4, 3]));
        assert!(LoraAdapter::from_parts(config(8, 16.0), adapter).is_err());
    }

    #[test]
    fn merge_checks_base_weights() {
        let mut adapter = WeightStore::new();
        adapter.insert("base_model.model.x.q_proj.lora_A.weight", ArrayD::zeros(vec![1, 4]));
        adapter.insert("base_model.model.x.q_proj.lora_B.weight", ArrayD::zeros(vec![4, 1]));
        let lora = LoraAdapter::from_parts(config(1, 1.0), adapter).unwrap();

        let mut empty = WeightStore::new();
        assert!(matches!(lora.merge_into(&mut empty), Err(Error::TensorNotFound(_))));

        let mut wrong = WeightStore::new();
        wrong.insert("x.q_proj.weight", ArrayD::zeros(vec![4, 5]));
        assert!(matches!(lora.merge_into(&mut wrong), Err(Error::ShapeMismatch { .. })));
    }

    #[test]
    fn modules_to_save_replace_base_tensors() {
        let mut adapter = WeightStore::new();
        adapter.insert(
            "base_model.model.lm_head.modules_to_save.default.weight",
            ArrayD::from_elem(vec![2, 2], 7.0),
        );
        let lora = LoraAdapter::from_parts(config(4, 8.0), adapter).unwrap();

        let mut base = WeightStore::new();
        base.insert("lm_head.weight", ArrayD::zeros(vec![2, 2]));
        let summary = lora.merge_into(&mut base).unwrap();
        assert_eq!(summary.replaced, 1);
        assert!(base.get("lm_head.weight").unwrap().iter().all(|v| *v == 7.0));
    }
}
