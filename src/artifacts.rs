// src/artifacts.rs
// Step 2 of the model check: are the fine-tuned adapter files in place?

use log::info;
use std::path::{Path, PathBuf};

pub const ADAPTER_CONFIG: &str = "adapter_config.json";
pub const ADAPTER_WEIGHTS: &str = "adapter_model.safetensors";
pub const TOKENIZER_CONFIG: &str = "tokenizer_config.json";
pub const TOKENIZER: &str = "tokenizer.json";

pub const REQUIRED_FILES: [&str; 4] = [ADAPTER_CONFIG, ADAPTER_WEIGHTS, TOKENIZER_CONFIG, TOKENIZER];

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactStatus {
    pub name: &'static str,
    /// `None` when the file is missing.
    pub size_bytes: Option<u64>,
}

impl ArtifactStatus {
    pub fn is_present(&self) -> bool {
        self.size_bytes.is_some()
    }

    pub fn size_mb(&self) -> Option<f64> {
        self.size_bytes.map(|b| b as f64 / BYTES_PER_MB)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactReport {
    pub dir: PathBuf,
    pub dir_exists: bool,
    pub files: Vec<ArtifactStatus>,
}

impl ArtifactReport {
    pub fn all_present(&self) -> bool {
        self.dir_exists && self.files.iter().all(ArtifactStatus::is_present)
    }

    pub fn missing(&self) -> Vec<&'static str> {
        self.files
            .iter()
            .filter(|f| !f.is_present())
            .map(|f| f.name)
            .collect()
    }
}

/// Inspects `model_dir` for the required adapter files. Never fails; the
/// report says what is missing.
pub fn check_model_files(model_dir: &Path) -> ArtifactReport {
    if !model_dir.is_dir() {
        return ArtifactReport {
            dir: model_dir.to_path_buf(),
            dir_exists: false,
            files: REQUIRED_FILES
                .iter()
                .map(|&name| ArtifactStatus { name, size_bytes: None })
                .collect(),
        };
    }

    let files = REQUIRED_FILES
        .iter()
        .map(|&name| {
            let size_bytes = std::fs::metadata(model_dir.join(name))
                .ok()
                .filter(|m| m.is_file())
                .map(|m| m.len());
            ArtifactStatus { name, size_bytes }
        })
        .collect();

    ArtifactReport {
        dir: model_dir.to_path_buf(),
        dir_exists: true,
        files,
    }
}

/// Logs the report the way an operator reads it: one line per file.
pub fn log_report(report: &ArtifactReport) {
    if !report.dir_exists {
        info!("Model directory not found: {}", report.dir.display());
        return;
    }
    let shown = report.dir.canonicalize().unwrap_or_else(|_| report.dir.clone());
    info!("Model directory found: {}", shown.display());
    info!("Checking required files:");
    for file in &report.files {
        match file.size_mb() {
            Some(mb) => info!("   {} ({:.2} MB)", file.name, mb),
            None => info!("   {} - MISSING!", file.name),
        }
    }
}

/// Steps an operator can take when the adapter directory is absent.
pub fn remediation_steps(model_dir: &Path) -> Vec<String> {
    let folder = model_dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| model_dir.display().to_string());
    let parent = model_dir
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| ".".to_string());
    vec![
        "Download the trained adapter from the training run".to_string(),
        format!("Extract it into the {} directory", parent),
        format!("Ensure the folder name is '{}'", folder),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn missing_directory_reports_everything_missing() {
        let tmp = tempfile::tempdir().unwrap();
        let report = check_model_files(&tmp.path().join("nope"));
        assert!(!report.dir_exists);
        assert!(!report.all_present());
        assert_eq!(report.missing(), REQUIRED_FILES.to_vec());
    }

    #[test]
    fn partial_directory_lists_missing_files() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join(ADAPTER_CONFIG), b"{}").unwrap();
        fs::write(tmp.path().join(TOKENIZER), vec![0u8; 2048]).unwrap();

        let report = check_model_files(tmp.path());
        assert!(report.dir_exists);
        assert!(!report.all_present());
        assert_eq!(report.missing(), vec![ADAPTER_WEIGHTS, TOKENIZER_CONFIG]);
        let tokenizer = report.files.iter().find(|f| f.name == TOKENIZER).unwrap();
        assert_eq!(tokenizer.size_bytes, Some(2048));
        assert!((tokenizer.size_mb().unwrap() - 2048.0 / BYTES_PER_MB).abs() < 1e-12);
    }

    #[test]
    fn directory_named_like_a_file_does_not_count() {
        let tmp = tempfile::tempdir().unwrap();
        for name in REQUIRED_FILES {
            fs::write(tmp.path().join(name), b"x").unwrap();
        }
        fs::remove_file(tmp.path().join(TOKENIZER)).unwrap();
        fs::create_dir(tmp.path().join(TOKENIZER)).unwrap();

        let report = check_model_files(tmp.path());
        assert_eq!(report.missing(), vec![TOKENIZER]);
    }

    #[test]
    fn complete_directory_passes() {
        let tmp = tempfile::tempdir().unwrap();
        for name in REQUIRED_FILES {
            fs::write(tmp.path().join(name), b"{}").unwrap();
        }
        let report = check_model_files(tmp.path());
        assert!(report.all_present());
        assert!(report.missing().is_empty());
    }

    #[test]
    fn remediation_names_the_folder() {
        let steps = remediation_steps(Path::new("models/recipe-bot-finetuned-v1"));
        assert_eq!(steps.len(), 3);
        assert!(steps[1].contains("models"));
        assert!(steps[2].contains("recipe-bot-finetuned-v1"));
    }
}
