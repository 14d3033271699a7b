//! Configuration management for appforge.
//!
//! Configuration can be set via environment variables:
//! - `APPFORGE_WORKSPACE` - Optional. Sandbox workspace root directory.
//!   Defaults to `./workspace`.
//! - `APPFORGE_RECONCILE_SECS` - Optional. File-tree reconciliation poll
//!   interval in seconds. Defaults to `5`.
//!
//! Log level is a collaborator concern and comes from `RUST_LOG`.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Sandbox workspace root directory.
    pub workspace_path: PathBuf,

    /// Interval of the background file-tree reconciliation poll.
    pub reconcile_interval: Duration,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let workspace_path = std::env::var("APPFORGE_WORKSPACE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./workspace"));

        let reconcile_secs: u64 = std::env::var("APPFORGE_RECONCILE_SECS")
            .unwrap_or_else(|_| "5".to_string())
            .parse()
            .map_err(|e| {
                ConfigError::InvalidValue("APPFORGE_RECONCILE_SECS".to_string(), format!("{}", e))
            })?;

        Ok(Self {
            workspace_path,
            reconcile_interval: Duration::from_secs(reconcile_secs),
        })
    }

    /// Create a config with custom values (useful for testing).
    pub fn new(workspace_path: PathBuf) -> Self {
        Self {
            workspace_path,
            reconcile_interval: Duration::from_secs(5),
        }
    }
}
