// SPDX-License-Identifier: GPL-3.0-only

//! Runtime configuration
//!
//! Settings are read from a JSON file, either given explicitly or found at
//! `<config dir>/camera-lifecycle/config.json`. A missing file yields the
//! defaults; any field left out of the file falls back to its default.

use crate::constants::{DEFAULT_LOG_FILTER, config_file, simulation, timing};
use crate::errors::{LifecycleError, LifecycleResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Behaviour of the simulated camera backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Time the hardware takes to open a camera
    pub open_latency_ms: u64,
    /// Time the hardware takes to close a camera
    pub close_latency_ms: u64,
    /// Camera ids whose open fails with an error code
    pub failing_cameras: Vec<String>,
    /// Camera ids that report "opened, but a close was requested"
    pub interrupted_cameras: Vec<String>,
    /// Camera ids whose close fails
    pub close_failing_cameras: Vec<String>,
    /// Number of cameras exposed, numbered from zero
    pub camera_count: u32,
}

impl SimulationConfig {
    pub fn open_latency(&self) -> Duration {
        Duration::from_millis(self.open_latency_ms)
    }

    pub fn close_latency(&self) -> Duration {
        Duration::from_millis(self.close_latency_ms)
    }
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            open_latency_ms: timing::OPEN_LATENCY_MS,
            close_latency_ms: timing::CLOSE_LATENCY_MS,
            failing_cameras: Vec::new(),
            interrupted_cameras: Vec::new(),
            close_failing_cameras: Vec::new(),
            camera_count: simulation::CAMERA_COUNT,
        }
    }
}

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// `tracing` filter used when `RUST_LOG` is not set
    pub log_filter: String,
    /// How long to wait for the arbiter to shut down
    pub shutdown_timeout_ms: u64,
    /// How long to wait for a single device request
    pub request_timeout_ms: u64,
    /// Simulated backend settings
    pub simulation: SimulationConfig,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            log_filter: DEFAULT_LOG_FILTER.to_string(),
            shutdown_timeout_ms: timing::SHUTDOWN_TIMEOUT_MS,
            request_timeout_ms: timing::REQUEST_TIMEOUT_MS,
            simulation: SimulationConfig::default(),
        }
    }
}

impl LifecycleConfig {
    /// Default location of the configuration file, if the platform has a
    /// config directory
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(config_file::APP_DIR).join(config_file::FILE_NAME))
    }

    /// Load from `path`, or from [`default_path`](Self::default_path) when
    /// `path` is `None`.
    ///
    /// A file that does not exist gives the defaults. A file that exists but
    /// cannot be read or parsed is an error.
    pub fn load(path: Option<&Path>) -> LifecycleResult<Self> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => match Self::default_path() {
                Some(path) => path,
                None => {
                    debug!("No config directory available, using defaults");
                    return Ok(Self::default());
                }
            },
        };

        if !path.exists() {
            debug!(path = %path.display(), "Config file not found, using defaults");
            return Ok(Self::default());
        }

        let contents = std::fs::read_to_string(&path).map_err(|e| {
            LifecycleError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        let config = Self::from_json(&contents).map_err(|e| {
            LifecycleError::Config(format!("failed to parse {}: {}", path.display(), e))
        })?;

        info!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    /// Parse configuration from a JSON string
    pub fn from_json(json: &str) -> LifecycleResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Write the configuration to `path` as pretty JSON, creating parent
    /// directories as needed
    pub fn save(&self, path: &Path) -> LifecycleResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_fills_defaults() {
        let config =
            LifecycleConfig::from_json(r#"{ "simulation": { "failing_cameras": ["1"] } }"#)
                .unwrap();

        assert_eq!(config.log_filter, "warn");
        assert_eq!(config.simulation.failing_cameras, vec!["1".to_string()]);
        assert_eq!(config.simulation.camera_count, simulation::CAMERA_COUNT);
    }

    #[test]
    fn test_malformed_json_is_config_error() {
        let err = LifecycleConfig::from_json("{ not json").unwrap_err();
        assert!(matches!(err, LifecycleError::Config(_)));
    }
}
