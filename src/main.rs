// src/main.rs
use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use log::info;
use std::path::PathBuf;

use recipe_bot::artifacts;
use recipe_bot::diagnostics::{self, CheckOptions, Step};
use recipe_bot::environment;
use recipe_bot::{logging, Error, Settings};

/// Checks that the fine-tuned recipe model is installed and able to generate.
#[derive(Parser, Debug)]
#[clap(name = "model_check", author, version, about, long_about = None)]
struct Cli {
    /// JSON settings file; fields it leaves out keep their defaults.
    #[clap(long, value_parser, global = true)]
    config: Option<PathBuf>,

    #[clap(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run every step (default)
    Check(CheckArgs),
    /// Environment check only
    Env,
    /// Adapter files check only
    Files {
        #[clap(long, value_parser)]
        model_dir: Option<PathBuf>,
    },
    /// Print the resolved settings as JSON
    Config,
}

#[derive(Args, Debug, Default)]
struct CheckArgs {
    #[clap(long, value_parser)]
    model_dir: Option<PathBuf>,
    /// Hub id or local directory of the base model
    #[clap(long, value_parser)]
    base_model: Option<String>,
    #[clap(long)]
    skip_inference: bool,
    #[clap(long, value_parser)]
    max_new_tokens: Option<usize>,
    /// EOS is held back until this many tokens are generated
    #[clap(long, value_parser)]
    min_new_tokens: Option<usize>,
    #[clap(long, value_parser)]
    seed: Option<u64>,
    /// Sample ingredient list; repeat for several
    #[clap(long = "ingredients", value_parser)]
    ingredients: Vec<String>,
}

fn load_settings(config: Option<&PathBuf>) -> Result<Settings> {
    let mut settings = match config {
        Some(path) => Settings::load(path)
            .with_context(|| format!("loading settings from {}", path.display()))?,
        None => Settings::default(),
    };
    settings.apply_env_overrides()?;
    Ok(settings)
}

fn log_remediation(settings: &Settings, step: Step, err: &Error) {
    match (step, err) {
        (Step::ModelFiles, Error::ModelDirMissing(dir)) => {
            info!("Solution:");
            for (i, line) in artifacts::remediation_steps(dir).iter().enumerate() {
                info!("   {}. {}", i + 1, line);
            }
        }
        (Step::ModelFiles, _) => info!("Please download and extract the model first."),
        (Step::Environment, Error::UnsupportedDevice(_)) => {
            info!("Set `device` to `cpu` (or RECIPE_BOT_DEVICE=cpu) and try again.")
        }
        (Step::ModelLoad, Error::Hub { .. }) => info!(
            "Check network access to the hub, or point models.base_model at a local copy of {}.",
            settings.models.base_model
        ),
        _ => {}
    }
}

fn run_check(settings: &mut Settings, args: CheckArgs) -> Result<()> {
    if let Some(dir) = args.model_dir {
        settings.paths.model_dir = dir;
    }
    if let Some(model) = args.base_model {
        settings.models.base_model = model;
    }
    settings.validate()?;
    settings.export_hub_env();

    let mut options = CheckOptions {
        skip_inference: args.skip_inference,
        ..CheckOptions::default()
    };
    if let Some(max) = args.max_new_tokens {
        options.generation.max_new_tokens = max;
    }
    if let Some(min) = args.min_new_tokens {
        options.generation.min_new_tokens = min;
    }
    options.generation.seed = args.seed.or(settings.generation.seed);
    if !args.ingredients.is_empty() {
        options.ingredients = args.ingredients;
    }

    match diagnostics::run_model_check(settings, &options) {
        Ok(report) => {
            info!(
                "Your model is ready to use! ({} samples, {} trainable parameters)",
                report.samples.len(),
                diagnostics::group_thousands(report.stats.trainable_parameters)
            );
            info!("Next steps:");
            info!("   1. Start the recipe API on {}", settings.api.bind_addr());
            info!("   2. Open the frontend and ask for a recipe");
            Ok(())
        }
        Err(failure) => {
            log_remediation(settings, failure.step, &failure.source);
            Err(failure.into())
        }
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    let mut settings = load_settings(cli.config.as_ref())?;
    logging::init(&settings.log)?;

    match cli.command.unwrap_or(Command::Check(CheckArgs::default())) {
        Command::Check(args) => run_check(&mut settings, args),
        Command::Env => {
            settings.validate()?;
            settings.export_hub_env();
            environment::check_environment(&settings)?;
            info!("Environment check passed");
            Ok(())
        }
        Command::Files { model_dir } => {
            if let Some(dir) = model_dir {
                settings.paths.model_dir = dir;
            }
            let model_dir = settings.model_dir();
            match diagnostics::check_files(&model_dir) {
                Ok(_) => {
                    info!("All required files present");
                    Ok(())
                }
                Err(err) => {
                    log_remediation(&settings, Step::ModelFiles, &err);
                    Err(err.into())
                }
            }
        }
        Command::Config => {
            println!("{}", serde_json::to_string_pretty(&settings)?);
            Ok(())
        }
    }
}

fn main() {
    if let Err(e) = run() {
        eprintln!("Application error: {}", e);
        for cause in e.chain().skip(1) {
            eprintln!("Caused by: {}", cause);
        }
        std::process::exit(1);
    }
}
