// src/config.rs
// Settings shared by the model check and the components that serve the
// fine-tuned model.
//
// Defaults carry the project constants. A JSON file may override any subset
// of fields, and a handful of `RECIPE_BOT_*` environment variables take
// precedence over both.

use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use crate::device::Device;
use crate::error::{Error, Result};

pub const DEFAULT_BASE_MODEL: &str = "TinyLlama/TinyLlama-1.1B-Chat-v1.0";
pub const DEFAULT_NAME_MATCHER_MODEL: &str = "sentence-transformers/paraphrase-MiniLM-L3-v2";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct Settings {
    /// Root against which relative paths resolve.
    pub project_dir: PathBuf,
    pub paths: PathSettings,
    pub models: ModelSettings,
    pub device: String,
    pub generation: GenerationSettings,
    pub name_matcher: NameMatcherSettings,
    pub hub: HubSettings,
    pub api: ApiSettings,
    pub cors: CorsSettings,
    pub log: LogSettings,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct PathSettings {
    /// Directory holding the fine-tuned adapter and its tokenizer.
    pub model_dir: PathBuf,
    pub data_dir: PathBuf,
    pub names_data: PathBuf,
    pub recipes_data: PathBuf,
    pub recipes_training_data: PathBuf,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct ModelSettings {
    /// Hub repository id, or a local directory with `config.json` and
    /// safetensors weights.
    pub base_model: String,
    pub name_matcher_model: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct GenerationSettings {
    pub max_new_tokens: usize,
    pub min_new_tokens: usize,
    pub temperature: f32,
    pub top_p: f32,
    /// `None` or `Some(0)` disables top-k filtering.
    pub top_k: Option<usize>,
    /// 1.0 means no penalty.
    pub repetition_penalty: f32,
    pub do_sample: bool,
    pub seed: Option<u64>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct NameMatcherSettings {
    pub device: String,
    /// Minimum similarity score for a name match.
    pub threshold: f32,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct HubSettings {
    pub download_timeout_secs: u64,
    pub disable_symlinks_warning: bool,
    pub disable_progress_bars: bool,
    /// Hub cache location. `None` keeps the hub default (`HF_HOME`).
    pub cache_dir: Option<PathBuf>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct ApiSettings {
    pub host: String,
    pub port: u16,
    pub reload: bool,
    pub log_level: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct CorsSettings {
    pub origins: Vec<String>,
    pub allow_credentials: bool,
    pub methods: Vec<String>,
    pub headers: Vec<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// `timestamp level target: message`
    #[default]
    Full,
    Compact,
    Json,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct LogSettings {
    pub level: String,
    pub format: LogFormat,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            project_dir: PathBuf::from("."),
            paths: PathSettings::default(),
            models: ModelSettings::default(),
            device: "cpu".to_string(),
            generation: GenerationSettings::default(),
            name_matcher: NameMatcherSettings::default(),
            hub: HubSettings::default(),
            api: ApiSettings::default(),
            cors: CorsSettings::default(),
            log: LogSettings::default(),
        }
    }
}

impl Default for PathSettings {
    fn default() -> Self {
        let data_dir = PathBuf::from("data");
        Self {
            model_dir: Path::new("models").join("recipe-bot-finetuned-v1"),
            names_data: data_dir.join("names.json"),
            recipes_data: data_dir.join("recipes.json"),
            recipes_training_data: data_dir.join("recipes_training_final.json"),
            data_dir,
        }
    }
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            base_model: DEFAULT_BASE_MODEL.to_string(),
            name_matcher_model: DEFAULT_NAME_MATCHER_MODEL.to_string(),
        }
    }
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            max_new_tokens: 150,
            min_new_tokens: 50,
            temperature: 0.7,
            top_p: 0.9,
            top_k: Some(50),
            repetition_penalty: 1.2,
            do_sample: true,
            seed: None,
        }
    }
}

impl GenerationSettings {
    /// Knobs used by the model check's sample generations.
    pub fn smoke_test() -> Self {
        Self {
            max_new_tokens: 250,
            min_new_tokens: 0,
            ..Self::default()
        }
    }

    /// Argmax decoding, no penalties.
    pub fn greedy() -> Self {
        Self {
            min_new_tokens: 0,
            temperature: 1.0,
            top_p: 1.0,
            top_k: None,
            repetition_penalty: 1.0,
            do_sample: false,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.do_sample && !(self.temperature > 0.0) {
            return Err(Error::invalid(
                "generation.temperature",
                format!("must be > 0 when sampling, got {}", self.temperature),
            ));
        }
        if !(self.top_p > 0.0 && self.top_p <= 1.0) {
            return Err(Error::invalid(
                "generation.top_p",
                format!("must be within (0, 1], got {}", self.top_p),
            ));
        }
        if !(self.repetition_penalty > 0.0) {
            return Err(Error::invalid(
                "generation.repetition_penalty",
                format!("must be > 0, got {}", self.repetition_penalty),
            ));
        }
        if self.min_new_tokens > self.max_new_tokens {
            return Err(Error::invalid(
                "generation.min_new_tokens",
                format!(
                    "{} exceeds max_new_tokens {}",
                    self.min_new_tokens, self.max_new_tokens
                ),
            ));
        }
        Ok(())
    }
}

impl Default for NameMatcherSettings {
    fn default() -> Self {
        Self {
            device: "cpu".to_string(),
            threshold: 0.6,
        }
    }
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            download_timeout_secs: 600,
            disable_symlinks_warning: true,
            disable_progress_bars: true,
            cache_dir: None,
        }
    }
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            reload: false,
            log_level: "info".to_string(),
        }
    }
}

impl ApiSettings {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for CorsSettings {
    fn default() -> Self {
        let any = vec!["*".to_string()];
        Self {
            origins: any.clone(),
            allow_credentials: true,
            methods: any.clone(),
            headers: any,
        }
    }
}

impl CorsSettings {
    pub fn allows_any_origin(&self) -> bool {
        self.origins.iter().any(|o| o == "*")
    }
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "INFO".to_string(),
            format: LogFormat::Full,
        }
    }
}

impl Settings {
    /// Loads settings from a JSON file. Fields absent from the file keep
    /// their defaults.
    pub fn load(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            return Err(Error::io(
                config_path,
                std::io::Error::new(std::io::ErrorKind::NotFound, "config file not found"),
            ));
        }

        let mut file = File::open(config_path).map_err(|e| Error::io(config_path, e))?;
        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .map_err(|e| Error::io(config_path, e))?;

        serde_json::from_str(&contents).map_err(|e| Error::json(config_path, e))
    }

    /// Applies `RECIPE_BOT_*` overrides from the process environment.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        self.apply_overrides_with(|key| std::env::var(key).ok())
    }

    /// Applies overrides using `lookup` in place of the process environment.
    pub fn apply_overrides_with<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup("RECIPE_BOT_PROJECT_DIR") {
            self.project_dir = PathBuf::from(dir);
        }
        if let Some(dir) = lookup("RECIPE_BOT_MODEL_DIR") {
            self.paths.model_dir = PathBuf::from(dir);
        }
        if let Some(model) = lookup("RECIPE_BOT_BASE_MODEL") {
            self.models.base_model = model;
        }
        if let Some(device) = lookup("RECIPE_BOT_DEVICE") {
            self.device = device;
        }
        if let Some(host) = lookup("RECIPE_BOT_API_HOST") {
            self.api.host = host;
        }
        if let Some(port) = lookup("RECIPE_BOT_API_PORT") {
            self.api.port = port.trim().parse().map_err(|_| {
                Error::invalid("RECIPE_BOT_API_PORT", format!("`{}` is not a port number", port))
            })?;
        }
        if let Some(level) = lookup("RECIPE_BOT_LOG_LEVEL") {
            self.log.level = level;
        }
        if let Some(cache) = lookup("RECIPE_BOT_HUB_CACHE") {
            self.hub.cache_dir = Some(PathBuf::from(cache));
        }
        Ok(())
    }

    /// Resolves `path` against `project_dir` unless it is already absolute.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.project_dir.join(path)
        }
    }

    pub fn model_dir(&self) -> PathBuf {
        self.resolve(&self.paths.model_dir)
    }

    pub fn data_dir(&self) -> PathBuf {
        self.resolve(&self.paths.data_dir)
    }

    pub fn validate(&self) -> Result<()> {
        self.device.parse::<Device>()?;
        self.name_matcher.device.parse::<Device>()?;
        self.generation.validate()?;
        crate::logging::filter_directive(&self.log.level)?;
        if !(0.0..=1.0).contains(&self.name_matcher.threshold) {
            return Err(Error::invalid(
                "name_matcher.threshold",
                format!("must be within [0, 1], got {}", self.name_matcher.threshold),
            ));
        }
        if self.api.port == 0 {
            return Err(Error::invalid("api.port", "must be non-zero"));
        }
        if self.models.base_model.trim().is_empty() {
            return Err(Error::invalid("models.base_model", "must not be empty"));
        }
        Ok(())
    }

    /// Exports the hub knobs as the environment variables hub clients read.
    pub fn export_hub_env(&self) {
        for (key, value) in self.hub_env() {
            std::env::set_var(key, value);
        }
    }

    pub fn hub_env(&self) -> Vec<(&'static str, String)> {
        let flag = |b: bool| if b { "1" } else { "0" }.to_string();
        vec![
            (
                "HF_HUB_DOWNLOAD_TIMEOUT",
                self.hub.download_timeout_secs.to_string(),
            ),
            (
                "HF_HUB_DISABLE_SYMLINKS_WARNING",
                flag(self.hub.disable_symlinks_warning),
            ),
            (
                "HF_HUB_DISABLE_PROGRESS_BARS",
                flag(self.hub.disable_progress_bars),
            ),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn defaults_match_project_constants() {
        let settings = Settings::default();
        assert_eq!(settings.models.base_model, "TinyLlama/TinyLlama-1.1B-Chat-v1.0");
        assert_eq!(
            settings.models.name_matcher_model,
            "sentence-transformers/paraphrase-MiniLM-L3-v2"
        );
        assert_eq!(settings.device, "cpu");
        assert_eq!(settings.generation.max_new_tokens, 150);
        assert_eq!(settings.generation.min_new_tokens, 50);
        assert_eq!(settings.generation.top_k, Some(50));
        assert_eq!(settings.generation.temperature, 0.7);
        assert_eq!(settings.generation.top_p, 0.9);
        assert_eq!(settings.generation.repetition_penalty, 1.2);
        assert_eq!(settings.name_matcher.threshold, 0.6);
        assert_eq!(settings.api.bind_addr(), "0.0.0.0:8000");
        assert!(!settings.api.reload);
        assert!(settings.cors.allows_any_origin());
        assert!(settings.cors.allow_credentials);
        assert_eq!(settings.log.level, "INFO");
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn paths_resolve_under_project_dir() {
        let settings = Settings {
            project_dir: PathBuf::from("/srv/recipe-bot"),
            ..Settings::default()
        };
        assert_eq!(
            settings.model_dir(),
            PathBuf::from("/srv/recipe-bot/models/recipe-bot-finetuned-v1")
        );
        assert_eq!(settings.data_dir(), PathBuf::from("/srv/recipe-bot/data"));
        assert_eq!(
            settings.resolve(&settings.paths.recipes_training_data),
            PathBuf::from("/srv/recipe-bot/data/recipes_training_final.json")
        );
        assert_eq!(settings.resolve(Path::new("/abs/x")), PathBuf::from("/abs/x"));
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"api": {{"port": 9001}}, "generation": {{"temperature": 0.3}}, "log": {{"format": "json"}}}}"#
        )
        .unwrap();

        let settings = Settings::load(file.path()).unwrap();
        assert_eq!(settings.api.port, 9001);
        assert_eq!(settings.api.host, "0.0.0.0");
        assert_eq!(settings.generation.temperature, 0.3);
        assert_eq!(settings.generation.top_p, 0.9);
        assert_eq!(settings.log.format, LogFormat::Json);
    }

    #[test]
    fn load_reports_missing_and_malformed_files() {
        let missing = Settings::load(Path::new("does/not/exist.json"));
        assert!(matches!(missing, Err(Error::Io { .. })));

        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{{ not json").unwrap();
        assert!(matches!(Settings::load(file.path()), Err(Error::Json { .. })));
    }

    #[test]
    fn env_overrides_apply() {
        let vars: HashMap<&str, &str> = [
            ("RECIPE_BOT_MODEL_DIR", "/models/adapter"),
            ("RECIPE_BOT_API_PORT", "8100"),
            ("RECIPE_BOT_HUB_CACHE", "/cache/hf"),
        ]
        .into_iter()
        .collect();

        let mut settings = Settings::default();
        settings
            .apply_overrides_with(|k| vars.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(settings.model_dir(), PathBuf::from("/models/adapter"));
        assert_eq!(settings.api.port, 8100);
        assert_eq!(settings.hub.cache_dir, Some(PathBuf::from("/cache/hf")));
        assert_eq!(settings.models.base_model, DEFAULT_BASE_MODEL);
    }

    #[test]
    fn env_override_rejects_bad_port() {
        let mut settings = Settings::default();
        let err = settings
            .apply_overrides_with(|k| (k == "RECIPE_BOT_API_PORT").then(|| "eighty".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("RECIPE_BOT_API_PORT"));
    }

    #[test]
    fn validate_rejects_out_of_range_knobs() {
        let mut settings = Settings::default();
        settings.generation.top_p = 1.5;
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.name_matcher.threshold = -0.1;
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.generation.min_new_tokens = 500;
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.device = "tpu".to_string();
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.log.level = "verbose".to_string();
        match settings.validate() {
            Err(Error::InvalidSetting { field, .. }) => assert_eq!(field, "log.level"),
            other => panic!("expected an invalid log level, got {:?}", other),
        }
    }

    #[test]
    fn hub_env_reflects_settings() {
        let env: HashMap<_, _> = Settings::default().hub_env().into_iter().collect();
        assert_eq!(env["HF_HUB_DOWNLOAD_TIMEOUT"], "600");
        assert_eq!(env["HF_HUB_DISABLE_SYMLINKS_WARNING"], "1");
        assert_eq!(env["HF_HUB_DISABLE_PROGRESS_BARS"], "1");
    }
}
