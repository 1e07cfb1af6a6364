use std::path::PathBuf;

/// Errors raised while loading settings, checking artifacts or running the
/// model.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse JSON from {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid setting `{field}`: {reason}")]
    InvalidSetting { field: String, reason: String },

    #[error("model directory not found: {0}")]
    ModelDirMissing(PathBuf),

    #[error("missing model files: {}", .0.join(", "))]
    MissingArtifacts(Vec<String>),

    #[error("device `{0}` is not available, only the CPU backend is compiled in")]
    UnsupportedDevice(String),

    #[error("hub error for `{repo}`: {message}")]
    Hub { repo: String, message: String },

    #[error("tokenizer error: {0}")]
    Tokenizer(String),

    #[error("safetensors error in {path}: {message}")]
    SafeTensors { path: PathBuf, message: String },

    #[error("unsupported dtype {dtype:?} for tensor `{name}`")]
    UnsupportedDtype { name: String, dtype: String },

    #[error("tensor `{0}` not found")]
    TensorNotFound(String),

    #[error("shape mismatch for `{name}`: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        name: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("adapter error: {0}")]
    Adapter(String),

    #[error("generation error: {0}")]
    Generation(String),
}

impl Error {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn json(path: impl Into<PathBuf>, source: serde_json::Error) -> Self {
        Error::Json {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn invalid(field: &str, reason: impl Into<String>) -> Self {
        Error::InvalidSetting {
            field: field.to_string(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
