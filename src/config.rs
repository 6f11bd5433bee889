//! Configuration for the mergequeue daemon.
//!
//! Configuration is resolved from (lowest to highest precedence):
//! - Built-in defaults
//! - A TOML configuration file
//! - Command-line overrides applied by the binary
//!
//! All fields have defaults, so an empty file and no file at all are
//! both valid configurations.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default bound on conflict retries before a worker is abandoned.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default capacity of the pending queue.
pub const DEFAULT_MAX_QUEUE_SIZE: usize = 100;

/// Daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// How many conflicting attempts a worker may accumulate before it
    /// is abandoned.
    pub max_retries: u32,
    /// Capacity of the pending queue; enqueue beyond this is refused.
    pub max_queue_size: usize,
    /// Integration branch used when a registration does not name one.
    pub default_target_branch: String,
    /// Unix socket path the control interface listens on.
    pub socket_path: PathBuf,
    /// Override for the state directory (defaults to the XDG state dir).
    pub state_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            max_queue_size: DEFAULT_MAX_QUEUE_SIZE,
            default_target_branch: "main".to_string(),
            socket_path: PathBuf::from("/tmp/mergequeued.sock"),
            state_dir: None,
        }
    }
}

impl Config {
    /// Loads configuration from a TOML file.
    pub fn load_from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            anyhow::anyhow!("Failed to read config file {}: {}", path.display(), e)
        })?;
        let config: Self = toml::from_str(&content).map_err(|e| {
            anyhow::anyhow!("Failed to parse config file {}: {}", path.display(), e)
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration.
    ///
    /// Rejects values the queue cannot operate with; merely unusual
    /// values only produce a warning.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_queue_size == 0 {
            anyhow::bail!("max_queue_size must be at least 1");
        }
        if self.default_target_branch.trim().is_empty() {
            anyhow::bail!("default_target_branch must not be empty");
        }
        if self.socket_path.as_os_str().is_empty() {
            anyhow::bail!("socket_path must not be empty");
        }
        if self.max_retries > 10 {
            tracing::warn!(
                max_retries = self.max_retries,
                "unusually high max_retries; conflicting workers will occupy the queue head repeatedly"
            );
        }
        Ok(())
    }
}
