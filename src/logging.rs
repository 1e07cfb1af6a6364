// src/logging.rs

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::{LogFormat, LogSettings};
use crate::error::{Error, Result};

/// Maps a configured level name onto an `EnvFilter` directive. Accepts the
/// `WARNING`/`CRITICAL` spellings used by the rest of the project's tooling,
/// and `target=level` directives as they are. A bare word that is not a level
/// would parse as a target name and silence every log line, so it is refused.
pub fn filter_directive(level: &str) -> Result<String> {
    let level = level.trim();
    if level.contains('=') {
        return Ok(level.to_string());
    }
    match level.to_ascii_lowercase().as_str() {
        "warning" => Ok("warn".to_string()),
        "critical" | "fatal" => Ok("error".to_string()),
        known @ ("trace" | "debug" | "info" | "warn" | "error" | "off") => Ok(known.to_string()),
        _ => Err(Error::invalid(
            "log.level",
            format!(
                "unknown level `{}`, expected trace, debug, info, warning, error, critical or off",
                level
            ),
        )),
    }
}

/// Installs the global subscriber on stderr. `RUST_LOG` takes precedence
/// over `settings.level`; `log` records reach it through the tracing-log
/// bridge.
pub fn init(settings: &LogSettings) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(filter_directive(&settings.level)?)
            .map_err(|e| Error::invalid("log.level", e.to_string()))?,
    };

    let registry = tracing_subscriber::registry().with(filter);
    let installed = match settings.format {
        LogFormat::Full => registry
            .with(fmt::layer().with_writer(std::io::stderr))
            .try_init(),
        LogFormat::Compact => registry
            .with(fmt::layer().compact().with_target(false).with_writer(std::io::stderr))
            .try_init(),
        LogFormat::Json => registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init(),
    };
    installed.map_err(|e| Error::invalid("log", e.to_string()))
}
