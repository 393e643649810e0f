//! Acquisition configuration
//!
//! Every field has a default, so a JSON file only needs the keys it
//! changes:
//!
//! ```json
//! { "connect_timeout_ms": 5000, "simulation": { "tick_ms": 40 } }
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use wearlink_core::channel_map::VendorChannelMap;
use wearlink_core::error::ChannelMapError;
use wearlink_core::simulation::SimulationConfig;

use crate::bridge::streams::StreamSettings;

/// Errors from loading a configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File could not be read
    #[error("Failed to read config {path}: {source}")]
    Io {
        /// Offending file
        path: PathBuf,
        /// Underlying error
        source: std::io::Error,
    },

    /// File is not valid configuration JSON
    #[error("Invalid config {path}: {source}")]
    Parse {
        /// Offending file
        path: PathBuf,
        /// Underlying error
        source: serde_json::Error,
    },
}

/// Acquisition layer configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcquisitionConfig {
    /// Scan window (ms)
    pub scan_window_ms: u64,
    /// Link negotiation timeout (ms)
    pub connect_timeout_ms: u64,
    /// Samples buffered per subscription before dropping
    pub queue_capacity: usize,
    /// Serve simulated samples when a real channel is unusable
    pub simulation_fallback: bool,
    /// Simulator parameters
    pub simulation: SimulationConfig,
    /// Vendor channel table to use instead of the built-in one
    pub channel_map_path: Option<PathBuf>,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            scan_window_ms: 5_000,
            connect_timeout_ms: 10_000,
            queue_capacity: 256,
            simulation_fallback: true,
            simulation: SimulationConfig::default(),
            channel_map_path: None,
        }
    }
}

impl AcquisitionConfig {
    /// Load from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file is unreadable or malformed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&json).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Scan window as a duration.
    pub fn scan_window(&self) -> Duration {
        Duration::from_millis(self.scan_window_ms)
    }

    /// Connect timeout as a duration.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// The configured vendor table, or the built-in one.
    ///
    /// # Errors
    ///
    /// Returns [`ChannelMapError`] if a configured table cannot be loaded.
    pub fn channel_map(&self) -> Result<VendorChannelMap, ChannelMapError> {
        match &self.channel_map_path {
            Some(path) => VendorChannelMap::from_path(path),
            None => Ok(VendorChannelMap::builtin()),
        }
    }

    pub(crate) fn stream_settings(&self) -> StreamSettings {
        StreamSettings {
            simulation: self.simulation.clone(),
            simulation_fallback: self.simulation_fallback,
            queue_capacity: self.queue_capacity,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config: AcquisitionConfig =
            serde_json::from_str(r#"{ "connect_timeout_ms": 2500, "simulation": { "tick_ms": 40 } }"#)
                .unwrap();
        assert_eq!(config.connect_timeout(), Duration::from_millis(2_500));
        assert_eq!(config.scan_window(), Duration::from_secs(5));
        assert_eq!(config.simulation.tick_ms, 40);
        assert_eq!(config.simulation.start_battery, 85);
        assert!(config.simulation_fallback);
    }

    #[test]
    fn test_unknown_channel_map_path() {
        let config = AcquisitionConfig {
            channel_map_path: Some(PathBuf::from("/nonexistent/channels.json")),
            ..Default::default()
        };
        assert!(matches!(config.channel_map(), Err(ChannelMapError::Io(_))));
    }

    #[test]
    fn test_missing_file() {
        assert!(matches!(
            AcquisitionConfig::from_file("/nonexistent/wearlink.json"),
            Err(ConfigError::Io { .. })
        ));
    }
}
