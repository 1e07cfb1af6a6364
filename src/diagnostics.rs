// src/diagnostics.rs
// The four-step model check: environment, adapter files, model load and a
// short generation smoke test.

use log::{debug, info, warn};
use std::fmt;
use std::path::Path;

use crate::artifacts::{self, ArtifactReport, TOKENIZER};
use crate::config::{GenerationSettings, Settings};
use crate::device::Device;
use crate::environment::{self, EnvironmentReport};
use crate::error::{Error, Result};
use crate::generation::{self, RecipeSample, PREVIEW_CHARS};
use crate::hub::{self, BaseModelFiles};
use crate::llama::{LlamaConfig, LlamaModel};
use crate::lora::LoraAdapter;
use crate::tokenizer::TokenizerWrapper;
use crate::weights::WeightStore;

const RULE_WIDTH: usize = 70;
pub const DTYPE: &str = "f32";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Environment,
    ModelFiles,
    ModelLoad,
    Inference,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Step::Environment => "Environment check",
            Step::ModelFiles => "Model files check",
            Step::ModelLoad => "Model loading",
            Step::Inference => "Test inference",
        };
        f.write_str(name)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("{step} failed")]
pub struct StepFailure {
    pub step: Step,
    #[source]
    pub source: Error,
}

fn at(step: Step) -> impl FnOnce(Error) -> StepFailure {
    move |source| StepFailure { step, source }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModelStats {
    pub total_parameters: usize,
    pub trainable_parameters: usize,
    pub merged_modules: usize,
    pub replaced_tensors: usize,
    pub device: Device,
    pub dtype: &'static str,
}

impl ModelStats {
    pub fn log(&self) {
        info!("Model Statistics:");
        info!("Total parameters: {}", group_thousands(self.total_parameters));
        info!("Trainable (LoRA): {}", group_thousands(self.trainable_parameters));
        info!("Device: {}", self.device);
        info!("Dtype: {}", self.dtype);
    }
}

/// `1234567` -> `1,234,567`
pub fn group_thousands(n: usize) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}

pub struct LoadedModel {
    pub model: LlamaModel,
    pub tokenizer: TokenizerWrapper,
    pub eos_token_ids: Vec<u32>,
    pub stats: ModelStats,
}

/// Step 2. Missing directory or files become errors.
pub fn check_files(model_dir: &Path) -> Result<ArtifactReport> {
    let report = artifacts::check_model_files(model_dir);
    artifacts::log_report(&report);
    if !report.dir_exists {
        return Err(Error::ModelDirMissing(report.dir));
    }
    if !report.all_present() {
        let missing = report.missing().into_iter().map(str::to_string).collect();
        return Err(Error::MissingArtifacts(missing));
    }
    Ok(report)
}

/// Step 3: tokenizer and adapter from the model directory, base model from
/// wherever the settings point, merged into one f32 model.
pub fn load_model(settings: &Settings) -> Result<LoadedModel> {
    let device: Device = settings.device.parse()?;
    let model_dir = settings.model_dir();
    info!("Loading from: {}", model_dir.display());

    let adapter = LoraAdapter::load(&model_dir)?;
    if let Some(trained_on) = &adapter.config().base_model_name_or_path {
        if trained_on != &settings.models.base_model {
            warn!(
                "adapter was trained on `{}` but the base model is `{}`",
                trained_on, settings.models.base_model
            );
        }
    }

    let base = hub::resolve_base_model(settings)?;
    load_model_from(&model_dir, &base, adapter, device)
}

pub fn load_model_from(
    model_dir: &Path,
    base: &BaseModelFiles,
    adapter: LoraAdapter,
    device: Device,
) -> Result<LoadedModel> {
    info!("Loading tokenizer...");
    let tokenizer = TokenizerWrapper::new(&model_dir.join(TOKENIZER))?;

    info!("Loading base model...");
    let config = LlamaConfig::load(&base.config)?;
    let mut weights = WeightStore::load(&base.weights)?;
    if tokenizer.get_vocab_size() > config.vocab_size {
        warn!(
            "tokenizer knows {} tokens, the model only {}",
            tokenizer.get_vocab_size(),
            config.vocab_size
        );
    }

    info!("Loading LoRA adapter...");
    let summary = adapter.merge_into(&mut weights)?;
    let eos_token_ids = eos_ids(&config, &tokenizer)?;
    let model = LlamaModel::from_weights(config, &mut weights)?;
    if !weights.is_empty() {
        debug!("{} base tensors left unused", weights.len());
    }

    let trainable = adapter.parameter_count();
    let stats = ModelStats {
        total_parameters: model.parameter_count() + trainable,
        trainable_parameters: trainable,
        merged_modules: summary.merged,
        replaced_tensors: summary.replaced,
        device,
        dtype: DTYPE,
    };
    info!("Model loaded successfully!");
    stats.log();

    Ok(LoadedModel {
        model,
        tokenizer,
        eos_token_ids,
        stats,
    })
}

/// EOS ids from the model config, else the tokenizer's `</s>`.
fn eos_ids(config: &LlamaConfig, tokenizer: &TokenizerWrapper) -> Result<Vec<u32>> {
    let ids = config.eos_token_ids();
    if !ids.is_empty() {
        return Ok(ids);
    }
    tokenizer
        .token_to_id("</s>")
        .map(|id| vec![id])
        .ok_or_else(|| Error::Generation("no EOS token in model config or tokenizer".to_string()))
}

/// Step 4: one generation per ingredient list. An empty answer fails.
pub fn run_smoke_test(
    loaded: &LoadedModel,
    ingredients: &[String],
    settings: &GenerationSettings,
) -> Result<Vec<RecipeSample>> {
    let rule = "-".repeat(RULE_WIDTH);
    let mut samples = Vec::with_capacity(ingredients.len());

    for case in ingredients {
        info!("Testing: {}", case);
        info!("{}", rule);
        info!("   Generating recipe...");
        let sample = generation::suggest_recipe(
            &loaded.model,
            &loaded.tokenizer,
            case,
            settings,
            loaded.eos_token_ids.clone(),
        )?;
        info!("    Generation time: {:.2}s", sample.elapsed.as_secs_f64());
        info!("    Generated Recipe:");
        info!("   {}", generation::preview(&sample.response, PREVIEW_CHARS));
        info!("{}", rule);

        if sample.response.trim().is_empty() {
            return Err(Error::Generation(format!(
                "empty response for `{}` after {} new tokens",
                case, sample.new_tokens
            )));
        }
        samples.push(sample);
    }
    Ok(samples)
}

#[derive(Debug, Clone)]
pub struct CheckOptions {
    pub skip_inference: bool,
    pub ingredients: Vec<String>,
    pub generation: GenerationSettings,
}

impl Default for CheckOptions {
    fn default() -> Self {
        Self {
            skip_inference: false,
            ingredients: generation::SAMPLE_INGREDIENTS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            generation: GenerationSettings::smoke_test(),
        }
    }
}

#[derive(Debug)]
pub struct CheckReport {
    pub environment: EnvironmentReport,
    pub files: ArtifactReport,
    pub stats: ModelStats,
    pub samples: Vec<RecipeSample>,
}

/// Runs the steps in order and stops at the first failure.
pub fn run_model_check(
    settings: &Settings,
    options: &CheckOptions,
) -> std::result::Result<CheckReport, StepFailure> {
    info!("Step 1: {}", Step::Environment);
    let environment = environment::check_environment(settings).map_err(at(Step::Environment))?;

    info!("Step 2: {}", Step::ModelFiles);
    let files = check_files(&settings.model_dir()).map_err(at(Step::ModelFiles))?;

    info!("Step 3: {}", Step::ModelLoad);
    let loaded = load_model(settings).map_err(at(Step::ModelLoad))?;

    let samples = if options.skip_inference {
        info!("Step 4: {} (skipped)", Step::Inference);
        Vec::new()
    } else {
        info!("Step 4: {}", Step::Inference);
        run_smoke_test(&loaded, &options.ingredients, &options.generation)
            .map_err(at(Step::Inference))?
    };

    Ok(CheckReport {
        environment,
        files,
        stats: loaded.stats,
        samples,
    })
}
