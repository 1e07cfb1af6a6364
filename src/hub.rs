// src/hub.rs

use hf_hub::api::sync::{ApiBuilder, ApiRepo};
use log::{debug, info};
use serde::Deserialize;
use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use crate::config::Settings;
use crate::error::{Error, Result};

pub const MODEL_CONFIG: &str = "config.json";
pub const MODEL_WEIGHTS: &str = "model.safetensors";
pub const MODEL_WEIGHTS_INDEX: &str = "model.safetensors.index.json";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BaseModelSource {
    Local(PathBuf),
    Hub(String),
}

impl BaseModelSource {
    /// An existing directory (as given, or under `project_dir`) wins over a
    /// hub id of the same spelling.
    pub fn from_settings(settings: &Settings) -> Self {
        let name = settings.models.base_model.trim();
        let candidate = settings.resolve(Path::new(name));
        if candidate.is_dir() {
            BaseModelSource::Local(candidate)
        } else {
            BaseModelSource::Hub(name.to_string())
        }
    }
}

impl std::fmt::Display for BaseModelSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BaseModelSource::Local(dir) => write!(f, "{}", dir.display()),
            BaseModelSource::Hub(repo) => write!(f, "hub:{}", repo),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BaseModelFiles {
    pub config: PathBuf,
    pub weights: Vec<PathBuf>,
}

#[derive(Deserialize)]
struct WeightIndex {
    weight_map: HashMap<String, String>,
}

/// Shard file names listed by a `model.safetensors.index.json`, sorted.
pub fn shard_names(index_path: &Path) -> Result<Vec<String>> {
    let contents = fs::read_to_string(index_path).map_err(|e| Error::io(index_path, e))?;
    let index: WeightIndex =
        serde_json::from_str(&contents).map_err(|e| Error::json(index_path, e))?;
    let shards: BTreeSet<String> = index.weight_map.into_values().collect();
    Ok(shards.into_iter().collect())
}

pub fn resolve_base_model(settings: &Settings) -> Result<BaseModelFiles> {
    match BaseModelSource::from_settings(settings) {
        BaseModelSource::Local(dir) => {
            info!("Using local base model at {}", dir.display());
            resolve_local(&dir)
        }
        BaseModelSource::Hub(repo) => {
            info!("Fetching base model {} from the hub", repo);
            resolve_hub(settings, &repo)
        }
    }
}

pub fn resolve_local(dir: &Path) -> Result<BaseModelFiles> {
    let config = dir.join(MODEL_CONFIG);
    if !config.is_file() {
        return Err(Error::io(
            &config,
            std::io::Error::new(std::io::ErrorKind::NotFound, "base model config not found"),
        ));
    }

    let single = dir.join(MODEL_WEIGHTS);
    let weights = if single.is_file() {
        vec![single]
    } else {
        let index = dir.join(MODEL_WEIGHTS_INDEX);
        if !index.is_file() {
            return Err(Error::io(
                dir,
                std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("neither {} nor {} found", MODEL_WEIGHTS, MODEL_WEIGHTS_INDEX),
                ),
            ));
        }
        shard_names(&index)?
            .into_iter()
            .map(|shard| dir.join(shard))
            .collect()
    };
    Ok(BaseModelFiles { config, weights })
}

fn resolve_hub(settings: &Settings, repo_id: &str) -> Result<BaseModelFiles> {
    let hub_error = |message: String| Error::Hub {
        repo: repo_id.to_string(),
        message,
    };

    let mut builder = ApiBuilder::new().with_progress(!settings.hub.disable_progress_bars);
    if let Some(cache_dir) = &settings.hub.cache_dir {
        builder = builder.with_cache_dir(settings.resolve(cache_dir));
    }
    let api = builder.build().map_err(|e| hub_error(e.to_string()))?;
    let repo = api.model(repo_id.to_string());

    let fetch = |repo: &ApiRepo, file: &str| {
        debug!("fetching {} from {}", file, repo_id);
        repo.get(file)
            .map_err(|e| hub_error(format!("{}: {}", file, e)))
    };

    let config = fetch(&repo, MODEL_CONFIG)?;
    let weights = match fetch(&repo, MODEL_WEIGHTS) {
        Ok(path) => vec![path],
        Err(single_err) => {
            debug!("{}, trying sharded weights", single_err);
            let index = fetch(&repo, MODEL_WEIGHTS_INDEX)?;
            shard_names(&index)?
                .iter()
                .map(|shard| fetch(&repo, shard.as_str()))
                .collect::<Result<Vec<_>>>()?
        }
    };
    Ok(BaseModelFiles { config, weights })
}
