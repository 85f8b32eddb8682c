//! Top-level IPC router — routes by service, delegates to handlers.

use crate::engine::Engine;
use crate::ipc::handlers;
use crate::types::{Error, IpcConfig, Result};
use serde_json::Value;
use tokio::sync::mpsc;

/// Result from dispatching a request.
#[allow(missing_debug_implementations)]
pub enum DispatchResponse {
    /// Single response value (most endpoints).
    Single(Value),
    /// Streaming response — server writes each value as MSG_STREAM_CHUNK,
    /// then MSG_STREAM_END when the receiver closes.
    Stream(mpsc::Receiver<Value>),
}

/// Route an IPC request to the appropriate service handler.
pub async fn route_request(
    engine: &Engine,
    service: &str,
    method: &str,
    body: Value,
    ipc_config: &IpcConfig,
) -> Result<DispatchResponse> {
    match service {
        "engine" => handlers::engine::handle(engine, method, body).await,
        "devices" => handlers::devices::handle(engine, method, body).await,
        "pending" => handlers::pending::handle(engine, method, body).await,
        "control" => handlers::control::handle(engine, method, body, ipc_config).await,
        _ => Err(Error::not_found(format!("Unknown service: {}", service))),
    }
}

// =============================================================================
// Shared helpers — used by all handler modules
// =============================================================================

pub fn str_field(body: &Value, key: &str) -> Result<String> {
    body.get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| Error::validation(format!("Missing required field: {}", key)))
}

pub fn opt_str_field(body: &Value, key: &str) -> Option<String> {
    body.get(key).and_then(|v| v.as_str()).map(|s| s.to_string())
}

pub fn u8_field(body: &Value, key: &str) -> Result<u8> {
    body.get(key)
        .and_then(|v| v.as_u64())
        .map(|n| n as u8)
        .ok_or_else(|| Error::validation(format!("Missing required field: {}", key)))
}

pub fn f64_field(body: &Value, key: &str) -> Result<f64> {
    body.get(key)
        .and_then(|v| v.as_f64())
        .ok_or_else(|| Error::validation(format!("Missing required field: {}", key)))
}

pub fn value_field(body: &Value, key: &str) -> Result<Value> {
    body.get(key)
        .cloned()
        .ok_or_else(|| Error::validation(format!("Missing required field: {}", key)))
}
