//! Logging configuration with file rotation
//!
//! Sets up a `tracing` subscriber with:
//! - an `EnvFilter` (`RUST_LOG` wins over the configured level)
//! - a stderr layer, plain or JSON
//! - an optional daily-rotated log file

use crate::config::LoggingConfig;
use crate::error::{QueryError, Result};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::Level;
use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter, Layer, Registry};

/// Logging configuration
#[derive(Debug, Clone, PartialEq)]
pub struct LogConfig {
    /// Default level when `RUST_LOG` is unset
    pub level: Level,

    /// Log to a daily-rotated file
    pub file_path: Option<PathBuf>,

    /// Log to stderr
    pub stderr: bool,

    /// JSON lines instead of plain text
    pub json: bool,

    /// Include thread IDs
    pub thread_ids: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            file_path: None,
            stderr: true,
            json: false,
            thread_ids: false,
        }
    }
}

impl From<&LoggingConfig> for LogConfig {
    fn from(settings: &LoggingConfig) -> Self {
        Self {
            level: Level::from_str(&settings.level).unwrap_or(Level::INFO),
            file_path: settings.file.clone(),
            stderr: settings.stderr,
            json: settings.json_format,
            ..Default::default()
        }
    }
}

impl LogConfig {
    /// Create config from environment
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    /// Apply `RQE_LOG_FILE`, `RQE_LOG_STDERR` and `RQE_LOG_JSON`
    ///
    /// `RUST_LOG` is left to the [`EnvFilter`] built by [`init_logging`];
    /// `level` stays the default directive it falls back to.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(log_file) = std::env::var("RQE_LOG_FILE") {
            if !log_file.trim().is_empty() {
                self.file_path = Some(PathBuf::from(log_file));
            }
        }

        if let Ok(log_stderr) = std::env::var("RQE_LOG_STDERR") {
            self.stderr = log_stderr.to_lowercase() != "false";
        }

        if let Ok(json) = std::env::var("RQE_LOG_JSON") {
            self.json = matches!(json.to_lowercase().as_str(), "1" | "true" | "yes");
        }

        self
    }
}

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

fn output_layer<W>(writer: W, json: bool, ansi: bool, thread_ids: bool) -> BoxedLayer
where
    W: for<'w> fmt::MakeWriter<'w> + Send + Sync + 'static,
{
    if json {
        fmt::layer()
            .json()
            .with_writer(writer)
            .with_thread_ids(thread_ids)
            .boxed()
    } else {
        fmt::layer()
            .with_writer(writer)
            .with_ansi(ansi)
            .with_target(true)
            .with_thread_ids(thread_ids)
            .boxed()
    }
}

/// Initialize the global subscriber
pub fn init_logging(config: LogConfig) -> Result<()> {
    let env_filter = EnvFilter::builder()
        .with_default_directive(config.level.into())
        .from_env_lossy();

    let mut layers: Vec<BoxedLayer> = Vec::new();

    if config.stderr {
        layers.push(output_layer(
            std::io::stderr,
            config.json,
            true,
            config.thread_ids,
        ));
    }

    if let Some(file_path) = &config.file_path {
        let directory = file_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(directory)?;

        let file_name = file_path
            .file_name()
            .unwrap_or_else(|| std::ffi::OsStr::new("rqe.log"));
        let file_appender = tracing_appender::rolling::daily(directory, file_name);
        layers.push(output_layer(
            file_appender,
            config.json,
            false,
            config.thread_ids,
        ));
    }

    let subscriber = tracing_subscriber::registry().with(layers).with(env_filter);
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| QueryError::config(format!("logging already initialized: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_from_env() {
        temp_env::with_vars(
            [
                ("RUST_LOG", Some("my_trace_crate=warn")),
                ("RQE_LOG_FILE", Some("/tmp/rqe/engine.log")),
                ("RQE_LOG_STDERR", Some("false")),
                ("RQE_LOG_JSON", Some("true")),
            ],
            || {
                let config = LogConfig::from_env();
                // Directives are interpreted by the filter, not matched by name
                assert_eq!(config.level, LogConfig::default().level);
                assert_eq!(config.file_path, Some(PathBuf::from("/tmp/rqe/engine.log")));
                assert!(!config.stderr);
                assert!(config.json);
            },
        );
    }

    #[test]
    #[serial]
    fn test_settings_without_env() {
        temp_env::with_vars_unset(
            ["RUST_LOG", "RQE_LOG_FILE", "RQE_LOG_STDERR", "RQE_LOG_JSON"],
            || {
                let settings = LoggingConfig {
                    level: "warn".into(),
                    ..Default::default()
                };
                let config = LogConfig::from(&settings).with_env_overrides();
                assert_eq!(config.level, Level::WARN);
                assert!(config.stderr);
                assert!(config.file_path.is_none());
            },
        );
    }
}
