// src/environment.rs
// Step 1 of the model check: is this host able to run the model at all?

use log::{info, warn};
use std::path::PathBuf;

use crate::config::Settings;
use crate::device::{Accelerators, Device};
use crate::error::{Error, Result};
use crate::system_resources::SystemResources;

/// Below this much free RAM a 1B-parameter model in f32 is likely to swap.
pub const MIN_RECOMMENDED_RAM_GB: f32 = 8.0;

pub const BACKEND: &str = "ndarray (CPU, f32)";

#[derive(Debug)]
pub struct EnvironmentReport {
    pub crate_version: &'static str,
    pub backend: &'static str,
    pub device: Device,
    pub accelerators: Accelerators,
    pub resources: SystemResources,
    pub hub_cache_dir: Option<PathBuf>,
    pub warnings: Vec<String>,
}

pub fn check_environment(settings: &Settings) -> Result<EnvironmentReport> {
    let device: Device = settings.device.parse()?;
    let accelerators = Accelerators::detect();
    let resources = SystemResources::new();

    info!("recipe_bot version: {}", env!("CARGO_PKG_VERSION"));
    info!("Inference backend: {}", BACKEND);
    info!("CUDA available: {}", accelerators.cuda);
    if accelerators.any() {
        info!("  Accelerator detected but not needed for CPU inference");
    } else {
        info!("CPU-only setup");
    }
    info!(
        "CPU: {} ({} logical cores), OS: {}",
        if resources.cpu_brand.is_empty() { "unknown" } else { &resources.cpu_brand },
        resources.cpu_core_count,
        resources.os.as_deref().unwrap_or("unknown")
    );
    info!(
        "RAM: {:.1} GiB available of {:.1} GiB, swap {:.1} GiB",
        resources.ram_available_gb, resources.ram_total_gb, resources.swap_total_gb
    );

    if !device.is_supported() {
        return Err(Error::UnsupportedDevice(device.to_string()));
    }
    info!("Device: {}", device);

    let hub_cache_dir = match &settings.hub.cache_dir {
        Some(dir) => {
            let dir = settings.resolve(dir);
            std::fs::create_dir_all(&dir).map_err(|e| Error::io(&dir, e))?;
            info!("Hub cache: {}", dir.display());
            Some(dir)
        }
        None => None,
    };

    let mut warnings = Vec::new();
    if resources.ram_total_gb > 0.0 && resources.ram_available_gb < MIN_RECOMMENDED_RAM_GB {
        let msg = format!(
            "only {:.1} GiB RAM available, {:.0} GiB recommended for the base model in f32",
            resources.ram_available_gb, MIN_RECOMMENDED_RAM_GB
        );
        warn!("{}", msg);
        warnings.push(msg);
    }

    Ok(EnvironmentReport {
        crate_version: env!("CARGO_PKG_VERSION"),
        backend: BACKEND,
        device,
        accelerators,
        resources,
        hub_cache_dir,
        warnings,
    })
}
