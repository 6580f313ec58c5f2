//! Tracing subscriber setup.

use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

const DEFAULT_FILTER: &str = "harbor=info";

#[derive(Debug, Clone, Default)]
pub struct LoggingConfig {
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
    /// Also write a daily-rotated log file here.
    pub log_dir: Option<PathBuf>,
    /// Lower the default filter to `harbor=debug`.
    pub verbose: bool,
}

impl LoggingConfig {
    /// Reads `HARBOR_LOG_FORMAT` and `HARBOR_LOG_DIR`.
    pub fn from_env(verbose: bool) -> Self {
        Self {
            json: std::env::var("HARBOR_LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json")),
            log_dir: std::env::var_os("HARBOR_LOG_DIR").map(PathBuf::from),
            verbose,
        }
    }

    fn default_filter(&self) -> &'static str {
        if self.verbose { "harbor=debug" } else { DEFAULT_FILTER }
    }
}

/// Install the global subscriber. The returned guard flushes the file
/// writer on drop and must live as long as the process logs.
pub fn init(config: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.default_filter()));

    let (file_layer, guard) = match &config.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, "harbor.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().json().with_ansi(false).with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let (json_layer, text_layer) = if config.json {
        (Some(fmt::layer().json().with_writer(std::io::stderr)), None)
    } else {
        (None, Some(fmt::layer().with_target(false).with_writer(std::io::stderr)))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(json_layer)
        .with(text_layer)
        .with(file_layer)
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(guard)
}
