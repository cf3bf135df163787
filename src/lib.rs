//! # Mayara Bridge
//!
//! Connects a host platform (such as a SignalK server) to a running
//! mayara-server. The bridge:
//! - Discovers the radars mayara-server exposes and follows them as they come and go
//! - Keeps one spoke relay per radar, forwarding every binary frame to the host
//! - Offers the radar provider methods (state, controls, targets) as a thin
//!   pass-through to the mayara-server REST API
//!
//! The bridge never looks inside spoke frames, and it keeps no state across
//! restarts.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                     mayara-bridge                        │
//! │  ┌───────────────────────┐    ┌────────────────────────┐ │
//! │  │ Fleet                 │    │ RadarProvider          │ │
//! │  │ - discovery polling   │    │ - per-call pass-through│ │
//! │  │ - reconnect polling   │    │ - errors → None/false  │ │
//! │  │ - relay table         │    └───────────┬────────────┘ │
//! │  └──────┬──────────┬─────┘                │              │
//! │         │          │ one per radar        │              │
//! │         │          ▼                      │              │
//! │         │   ┌──────────────┐              │              │
//! │         │   │ SpokeRelay   │──► StreamSink (host)        │
//! │         │   └──────┬───────┘              │              │
//! │         ▼          │ WebSocket            ▼              │
//! │  ┌──────────────────────────────────────────────────────┐│
//! │  │ BackendClient (reqwest) / stream URL builder         ││
//! │  └──────────────────────────────────────────────────────┘│
//! └──────────────────────────────────────────────────────────┘
//!                           │
//!                           ▼
//!                mayara-server /v2/api/radars
//! ```
//!
//! ## Key Components
//!
//! - [`fleet::Fleet`] - discovery state machine and relay table
//! - [`relay::SpokeRelay`] - per-radar stream relay with fixed-delay reconnect
//! - [`client::BackendClient`] - mayara-server REST client
//! - [`provider::RadarProvider`] - method surface registered with the host
//! - [`host`] - the traits a host platform implements

use clap::Parser;
use std::path::PathBuf;

pub mod client;
pub mod config;
pub mod error;
pub mod fleet;
pub mod host;
pub mod provider;
pub mod relay;

pub use client::BackendClient;
pub use config::BridgeConfig;
pub use error::{BridgeError, ConfigError};
pub use fleet::{Fleet, FleetStatus, Phase};
pub use provider::{RadarProvider, PROVIDER_ID, PROVIDER_NAME};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser, Clone, Debug)]
pub struct Cli {
    #[clap(flatten)]
    pub verbose: clap_verbosity_flag::Verbosity<clap_verbosity_flag::InfoLevel>,

    /// Configuration file (JSON), defaults to the user config directory
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// mayara-server host name or address
    #[arg(long)]
    pub host: Option<String>,

    /// mayara-server port
    #[arg(short, long)]
    pub port: Option<u32>,

    /// Use HTTPS and WSS to reach mayara-server
    #[arg(short, long, default_value_t = false)]
    pub secure: bool,

    /// Seconds between radar discovery polls while connected
    #[arg(long)]
    pub discovery_interval: Option<u64>,

    /// Seconds between reconnect attempts
    #[arg(long)]
    pub reconnect_interval: Option<u64>,

    /// Port for the bridge's own status and provider API
    #[arg(short, long, default_value_t = 6503)]
    pub listen: u16,
}

impl Cli {
    /// Load the configuration file and apply command line overrides.
    pub fn bridge_config(&self) -> Result<BridgeConfig, ConfigError> {
        let mut config = BridgeConfig::load(self.config.as_deref())?;
        if let Some(host) = &self.host {
            config.host = host.clone();
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if self.secure {
            config.secure = true;
        }
        if let Some(secs) = self.discovery_interval {
            config.discovery_poll_interval_seconds = secs;
        }
        if let Some(secs) = self.reconnect_interval {
            config.reconnect_interval_seconds = secs;
        }
        config.validate()?;
        Ok(config)
    }
}
