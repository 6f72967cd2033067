//! Logging setup for naming-server processes.
//!
//! Builds a `tracing-subscriber` registry with an `EnvFilter`, an optional
//! console layer and an optional rolling-file layer from a [`LogConfig`].

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing_appender::rolling;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Re-export tracing macros for convenience.
pub use tracing::{debug, error, info, instrument, trace, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level filter (trace, debug, info, warn, error). `RUST_LOG` wins
    /// when set.
    #[serde(default = "default_level")]
    pub level: String,

    /// Directory for log files. If None, no file logging.
    #[serde(default)]
    pub log_dir: Option<PathBuf>,

    /// Prefix for log file names.
    #[serde(default = "default_prefix")]
    pub file_prefix: String,

    #[serde(default)]
    pub rotation: Rotation,

    /// Whether to output JSON format.
    #[serde(default)]
    pub json_format: bool,

    /// Whether to also output to console (stdout).
    #[serde(default = "default_true")]
    pub console_output: bool,
}

/// How often the log file rolls over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Rotation {
    #[default]
    Hourly,
    Daily,
    Never,
}

impl From<Rotation> for rolling::Rotation {
    fn from(r: Rotation) -> Self {
        match r {
            Rotation::Hourly => rolling::Rotation::HOURLY,
            Rotation::Daily => rolling::Rotation::DAILY,
            Rotation::Never => rolling::Rotation::NEVER,
        }
    }
}

fn default_level() -> String {
    "info".into()
}

fn default_prefix() -> String {
    "naming-server".into()
}

fn default_true() -> bool {
    true
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            level: default_level(),
            log_dir: None,
            file_prefix: default_prefix(),
            rotation: Rotation::default(),
            json_format: false,
            console_output: true,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("failed to create log file appender in {dir:?}: {source}")]
    Appender {
        dir: PathBuf,
        #[source]
        source: rolling::InitError,
    },
    #[error("a global subscriber is already installed")]
    AlreadyInitialized(#[from] tracing_subscriber::util::TryInitError),
}

type BoxedLayer<S> = Box<dyn tracing_subscriber::Layer<S> + Send + Sync>;

/// Initialize the logging system. Should be called once at program startup.
///
/// Returns a guard that must be held alive for the duration of the program
/// when file logging is enabled; dropping it flushes the non-blocking writer.
pub fn init_logging(
    config: &LogConfig,
) -> Result<Option<tracing_appender::non_blocking::WorkerGuard>, LoggingError> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let registry = tracing_subscriber::registry().with(env_filter);

    let console_layer: Option<BoxedLayer<_>> = if config.console_output {
        if config.json_format {
            Some(Box::new(fmt::layer().json()))
        } else {
            Some(Box::new(fmt::layer()))
        }
    } else {
        None
    };

    let (file_layer, guard): (Option<BoxedLayer<_>>, _) = match config.log_dir {
        Some(ref log_dir) => {
            let file_appender = rolling::RollingFileAppender::builder()
                .rotation(config.rotation.into())
                .filename_prefix(&config.file_prefix)
                .filename_suffix("log")
                .build(log_dir)
                .map_err(|source| LoggingError::Appender {
                    dir: log_dir.clone(),
                    source,
                })?;

            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

            let layer: BoxedLayer<_> = if config.json_format {
                Box::new(fmt::layer().json().with_writer(non_blocking))
            } else {
                Box::new(fmt::layer().with_ansi(false).with_writer(non_blocking))
            };
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    registry.with(console_layer).with(file_layer).try_init()?;

    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = LogConfig::default();
        assert_eq!(cfg.level, "info");
        assert_eq!(cfg.rotation, Rotation::Hourly);
        assert!(cfg.console_output);
        assert!(cfg.log_dir.is_none());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let cfg: LogConfig = toml::from_str(
            r#"
            level = "debug"
            rotation = "daily"
            log_dir = "/var/log/dfs"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.level, "debug");
        assert_eq!(cfg.rotation, Rotation::Daily);
        assert_eq!(cfg.log_dir, Some(PathBuf::from("/var/log/dfs")));
        assert_eq!(cfg.file_prefix, "naming-server");
        assert!(!cfg.json_format);
    }

    #[test]
    fn test_unknown_rotation_rejected() {
        let res: Result<LogConfig, _> = toml::from_str(r#"rotation = "weekly""#);
        assert!(res.is_err());
    }

    #[test]
    fn test_rotation_conversion() {
        assert_eq!(
            rolling::Rotation::from(Rotation::Never),
            rolling::Rotation::NEVER
        );
    }
}
