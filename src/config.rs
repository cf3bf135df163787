//! Bridge configuration.
//!
//! The configuration is a small JSON document, the same shape a host platform
//! stores for a plugin:
//!
//! ```json
//! { "host": "localhost", "port": 6502, "secure": false,
//!   "discoveryPollIntervalSeconds": 10, "reconnectIntervalSeconds": 5 }
//! ```
//!
//! Missing fields fall back to their defaults. [`BridgeConfig::validate`] must
//! pass before the configuration is handed to the fleet.

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;

pub const MIN_DISCOVERY_POLL_INTERVAL_SECS: u64 = 5;
pub const MIN_RECONNECT_INTERVAL_SECS: u64 = 1;

const CONFIG_FILE_NAME: &str = "bridge.json";

/// JSON schema of [`BridgeConfig`], for hosts that render plugin settings.
pub const CONFIG_SCHEMA: &str = r#"{
  "type": "object",
  "properties": {
    "host": { "type": "string", "title": "mayara-server host", "default": "localhost" },
    "port": { "type": "integer", "title": "mayara-server port", "minimum": 1, "maximum": 65535, "default": 6502 },
    "secure": { "type": "boolean", "title": "Use HTTPS/WSS", "default": false },
    "discoveryPollIntervalSeconds": { "type": "integer", "title": "Radar discovery interval (s)", "minimum": 5, "default": 10 },
    "reconnectIntervalSeconds": { "type": "integer", "title": "Reconnect interval (s)", "minimum": 1, "default": 5 }
  }
}"#;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BridgeConfig {
    pub host: String,
    /// Kept wider than `u16` so out-of-range values are reported, not truncated
    pub port: u32,
    pub secure: bool,
    pub discovery_poll_interval_seconds: u64,
    pub reconnect_interval_seconds: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 6502,
            secure: false,
            discovery_poll_interval_seconds: 10,
            reconnect_interval_seconds: 5,
        }
    }
}

impl BridgeConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Read(format!("{}: {}", path.display(), e)))?;
        Self::from_json(&json)
    }

    /// Load the configuration from `path`, or from the default location when
    /// no path is given. A missing default file yields the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::from_file(path),
            None => match default_config_path() {
                Some(path) if path.exists() => {
                    log::info!("Loading configuration from {}", path.display());
                    Self::from_file(&path)
                }
                _ => {
                    log::debug!("No configuration file, using defaults");
                    Ok(Self::default())
                }
            },
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::EmptyHost);
        }
        if self.port == 0 || self.port > u16::MAX as u32 {
            return Err(ConfigError::InvalidPort(self.port));
        }
        if self.discovery_poll_interval_seconds < MIN_DISCOVERY_POLL_INTERVAL_SECS {
            return Err(ConfigError::DiscoveryIntervalTooShort {
                min: MIN_DISCOVERY_POLL_INTERVAL_SECS,
                actual: self.discovery_poll_interval_seconds,
            });
        }
        if self.reconnect_interval_seconds < MIN_RECONNECT_INTERVAL_SECS {
            return Err(ConfigError::ReconnectIntervalTooShort {
                min: MIN_RECONNECT_INTERVAL_SECS,
                actual: self.reconnect_interval_seconds,
            });
        }
        Ok(())
    }

    pub fn discovery_poll_interval(&self) -> Duration {
        Duration::from_secs(self.discovery_poll_interval_seconds)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_secs(self.reconnect_interval_seconds)
    }

    /// `host:port`, used in status messages
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

pub fn get_project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("com", "Marine Yacht Radar", "mayara-bridge")
}

pub fn default_config_path() -> Option<PathBuf> {
    get_project_dirs().map(|dirs| dirs.config_dir().join(CONFIG_FILE_NAME))
}
