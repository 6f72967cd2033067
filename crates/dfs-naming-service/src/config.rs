//! Configuration for the naming service.

use std::path::Path as FsPath;
use std::time::Duration;

use dfs_logging::LogConfig;
use serde::{Deserialize, Serialize};

/// Errors raised while loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid value for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

/// Background replica management settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    /// Whether lock grants schedule replicate/invalidate tasks at all.
    pub enabled: bool,

    /// Shared-lock grants on a file before a replicate task is scheduled.
    pub read_threshold: u64,

    /// Pending tasks the queue holds before new tasks are dropped.
    pub queue_capacity: usize,

    /// Tasks executed concurrently by the dispatcher.
    pub max_concurrent_tasks: usize,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            read_threshold: 20,
            queue_capacity: 1024,
            max_concurrent_tasks: 8,
        }
    }
}

/// Configuration for the naming service core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NamingServiceConfig {
    /// Give up waiting for a path lock after this long. `None` waits forever.
    #[serde(with = "opt_secs")]
    pub lock_timeout: Option<Duration>,

    pub replication: ReplicationConfig,
}

impl Default for NamingServiceConfig {
    fn default() -> Self {
        Self {
            lock_timeout: None,
            replication: ReplicationConfig::default(),
        }
    }
}

impl NamingServiceConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let r = &self.replication;
        if r.read_threshold == 0 {
            return Err(ConfigError::Invalid {
                key: "replication.read_threshold",
                reason: "must be at least 1".into(),
            });
        }
        if r.queue_capacity == 0 {
            return Err(ConfigError::Invalid {
                key: "replication.queue_capacity",
                reason: "must be at least 1".into(),
            });
        }
        if r.max_concurrent_tasks == 0 {
            return Err(ConfigError::Invalid {
                key: "replication.max_concurrent_tasks",
                reason: "must be at least 1".into(),
            });
        }
        if self.lock_timeout == Some(Duration::ZERO) {
            return Err(ConfigError::Invalid {
                key: "lock_timeout",
                reason: "must be positive; omit it to wait forever".into(),
            });
        }
        Ok(())
    }
}

/// Top-level configuration file of the naming server process.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NamingServerConfig {
    pub log: LogConfig,
    pub naming: NamingServiceConfig,
}

impl NamingServerConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.naming.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<FsPath>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Render as TOML, e.g. for `--dump-default-config`.
    pub fn to_toml_string(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }
}

/// Durations are written as (fractional) seconds.
mod opt_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => serializer.serialize_f64(d.as_secs_f64()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = Option::<f64>::deserialize(deserializer)?;
        match secs {
            Some(s) if !s.is_finite() || s < 0.0 => Err(serde::de::Error::custom(
                "duration must be a non-negative number of seconds",
            )),
            Some(s) => Ok(Some(Duration::from_secs_f64(s))),
            None => Ok(None),
        }
    }
}
