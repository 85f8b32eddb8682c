//! Configuration structures.
//!
//! Configuration is loaded from environment variables and config files.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Global engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Server configuration.
    #[serde(default)]
    pub server: ServerConfig,

    /// Observability configuration.
    #[serde(default)]
    pub observability: ObservabilityConfig,

    /// Engine-wide defaults (cooldowns, depth cap, pulse timing).
    #[serde(default)]
    pub defaults: EngineDefaults,

    /// IPC transport configuration.
    #[serde(default)]
    pub ipc: IpcConfig,

    /// Persisted-document directory configuration.
    #[serde(default)]
    pub persistence: PersistenceConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// IPC server bind address (TCP).
    pub listen_addr: String,

    /// Metrics endpoint bind address.
    pub metrics_addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:50061".to_string(),
            metrics_addr: "127.0.0.1:9090".to_string(),
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Tracing log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable JSON log formatting.
    pub json_logs: bool,

    /// OTLP exporter endpoint (optional).
    pub otlp_endpoint: Option<String>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
            otlp_endpoint: None,
        }
    }
}

/// Engine-wide default limits and timings (spec §4.1, §9).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineDefaults {
    /// Messages-since-last-fire required before a speech trigger can fire
    /// again (spec §4.1 point 2).
    pub default_trigger_cooldown: u32,

    /// Idle duration before an `idle` trigger can match.
    #[serde(with = "humantime_serde")]
    pub default_idle_threshold: Duration,

    /// Safety-net cap on nodes visited within a single chain (spec §9).
    pub max_chain_depth: u32,

    /// Inter-pulse delay for `pulse_pump` action nodes (spec §4.3).
    #[serde(with = "humantime_serde")]
    pub pulse_pump_delay: Duration,
}

impl Default for EngineDefaults {
    fn default() -> Self {
        Self {
            default_trigger_cooldown: 5,
            default_idle_threshold: Duration::from_secs(120),
            max_chain_depth: 256,
            pulse_pump_delay: Duration::from_secs(1),
        }
    }
}

/// IPC transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpcConfig {
    /// Maximum frame payload size in bytes.
    pub max_frame_bytes: u32,

    /// Maximum concurrent TCP connections. New connections beyond this limit
    /// are rejected (backpressure via semaphore).
    pub max_connections: usize,

    /// Read timeout in seconds per frame. Connections idle beyond this
    /// duration are dropped (prevents slowloris-style resource exhaustion).
    pub read_timeout_secs: u64,

    /// Write timeout in seconds per frame. Slow consumers that cannot
    /// accept a response within this window are dropped.
    pub write_timeout_secs: u64,

    /// Bounded channel capacity for streamed broadcast subscriptions.
    pub stream_channel_capacity: usize,
}

impl Default for IpcConfig {
    fn default() -> Self {
        Self {
            max_frame_bytes: 5 * 1024 * 1024,
            max_connections: 1000,
            read_timeout_secs: 30,
            write_timeout_secs: 10,
            stream_channel_capacity: 64,
        }
    }
}

/// Persisted-document directory configuration (devices/characters/personas/settings).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// Directory containing `devices.json`, `characters.json`,
    /// `personas.json`, `settings.json`.
    pub dir: String,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            dir: "./data".to_string(),
        }
    }
}
