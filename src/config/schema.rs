//! Configuration schema definitions.
//!
//! All types derive Serde traits for deserialization from config files.

use std::path::PathBuf;

use serde::Deserialize;

use crate::observability::LogLevel;

/// Root configuration for the host server.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ServerConfig {
    /// Listener configuration (bind address).
    pub listener: ListenerConfig,

    /// Where sessions are proxied to.
    pub backend: BackendConfig,

    /// Logging and metrics settings.
    pub observability: ObservabilityConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    pub bind_address: String,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
        }
    }
}

/// Backend configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Backend base URL (`ws://` or `wss://`). Path and query are taken from
    /// each inbound request.
    pub url: String,

    /// Forward all client headers instead of the allow-listed subset.
    pub natural_tunnel: bool,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:9000".to_string(),
            natural_tunnel: false,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Verbosity (`error_only`, `standard`, `elevated`, ... `verbose`).
    pub log_level: LogLevel,

    /// Write logs to this file instead of stderr.
    pub debug_file_path: Option<PathBuf>,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Default,
            debug_file_path: None,
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}
