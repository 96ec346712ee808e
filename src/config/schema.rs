//! Configuration schema definitions.
//!
//! This module defines the process-level configuration of the gateway.
//! The workflow itself is not configured here; it arrives as YAML and is
//! hot-reloadable. All types derive Serde traits for deserialization from TOML.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Bearer token for the management API. Unset disables write endpoints.
pub const MANAGEMENT_TOKEN_ENV: &str = "KDEPS_MANAGEMENT_TOKEN";

/// Overrides the bind host of both the API server and the WebServer.
pub const BIND_HOST_ENV: &str = "KDEPS_BIND_HOST";

/// Debug-mode toggle (`"true"` or `"1"`).
pub const DEBUG_ENV: &str = "DEBUG";

const MIB: u64 = 1024 * 1024;

/// Root configuration for the gateway.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct GatewayConfig {
    /// Listener configuration (bind address override, connection limit).
    pub listener: ListenerConfig,

    /// Server-wide timeouts.
    pub timeouts: TimeoutConfig,

    /// Upload scratch storage.
    pub uploads: UploadConfig,

    /// Management API body ceilings.
    pub management: ManagementConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,

    /// Reload the workflow when files change on disk.
    pub dev_mode: bool,

    /// Expose internal error detail and stack traces in responses.
    pub debug: bool,
}

impl GatewayConfig {
    /// Apply environment overrides (`DEBUG`).
    pub fn with_env_overrides(mut self) -> Self {
        if debug_from_env() {
            self.debug = true;
        }
        self
    }
}

/// True when `DEBUG` is `"true"` or `"1"`.
pub fn debug_from_env() -> bool {
    matches!(std::env::var(DEBUG_ENV).as_deref(), Ok("true") | Ok("1"))
}

/// Non-empty, trimmed `KDEPS_BIND_HOST`.
pub fn bind_host_from_env() -> Option<String> {
    std::env::var(BIND_HOST_ENV)
        .ok()
        .map(|host| host.trim().to_string())
        .filter(|host| !host.is_empty())
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:16395"). Overrides the workflow's
    /// `apiServer.hostIp`/`portNum` when set.
    pub bind_address: Option<String>,

    /// Maximum concurrent connections (backpressure).
    pub max_connections: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: None,
            max_connections: 10_000,
        }
    }
}

/// Timeout configuration, all in seconds.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Time allowed to receive request headers.
    pub read_secs: u64,

    /// Time allowed to produce a response. Long to accommodate slow workflows.
    pub write_secs: u64,

    /// Keep-alive idle timeout.
    pub idle_secs: u64,

    /// Time allowed for a proxied app to send response headers.
    pub proxy_response_header_secs: u64,

    /// WebSocket dial + handshake timeout.
    pub websocket_handshake_secs: u64,

    /// Drain budget for in-flight connections on shutdown.
    pub shutdown_grace_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            read_secs: 30,
            write_secs: 300,
            idle_secs: 60,
            proxy_response_header_secs: 30,
            websocket_handshake_secs: 30,
            shutdown_grace_secs: 10,
        }
    }
}

/// Upload handling configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct UploadConfig {
    /// Scratch directory for uploaded files.
    pub dir: PathBuf,

    /// Per-file ceiling, also the multipart request ceiling, in bytes.
    pub max_file_size: u64,

    /// Ceiling for buffered request bodies, in bytes.
    pub max_memory: u64,

    /// Interval between expiry sweeps.
    pub cleanup_interval_secs: u64,

    /// Age at which uploaded files expire.
    pub ttl_secs: u64,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            dir: std::env::temp_dir().join("kdeps-uploads"),
            max_file_size: 10 * MIB,
            max_memory: 32 * MIB,
            cleanup_interval_secs: 300,
            ttl_secs: 1800,
        }
    }
}

/// Management API limits.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ManagementConfig {
    /// Maximum workflow YAML body.
    pub max_workflow_bytes: u64,

    /// Maximum compressed package body.
    pub max_package_bytes: u64,

    /// Maximum size of any single extracted package entry.
    pub max_package_file_bytes: u64,
}

impl Default for ManagementConfig {
    fn default() -> Self {
        Self {
            max_workflow_bytes: 5 * MIB,
            max_package_bytes: 200 * MIB,
            max_package_file_bytes: 500 * MIB,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Emit logs as JSON lines.
    pub json_logs: bool,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9090".to_string(),
        }
    }
}
