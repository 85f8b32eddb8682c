//! `devices` service — catalog resolution and driver completion callbacks.
//!
//! The device driver layer is an external collaborator (spec §1); this
//! handler is its narrow seam into the engine: resolving author-facing
//! device references, and feeding back the two completion callbacks the
//! pending-op registry listens for (spec §4.4 items 1-2).

use crate::engine::Engine;
use crate::ipc::router::{str_field, DispatchResponse};
use crate::types::{Error, Result};
use serde_json::{json, Value};

pub async fn handle(engine: &Engine, method: &str, body: Value) -> Result<DispatchResponse> {
    match method {
        "Resolve" => {
            let device_ref = str_field(&body, "device_ref")?;
            let key = engine.resolve_device(&device_ref).await?;
            Ok(DispatchResponse::Single(json!({"device_key": key})))
        }
        "CycleComplete" => {
            let device_key = str_field(&body, "device_key")?;
            engine.handle_cycle_complete(device_key).await;
            Ok(DispatchResponse::Single(json!({"ok": true})))
        }
        "DeviceOnComplete" => {
            let device_key = str_field(&body, "device_key")?;
            engine.handle_device_on_complete(device_key).await;
            Ok(DispatchResponse::Single(json!({"ok": true})))
        }
        other => Err(Error::not_found(format!("Unknown devices method: {}", other))),
    }
}
