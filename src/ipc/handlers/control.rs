//! `control` service — whole-engine lifecycle operations that sit outside
//! normal flow execution (spec §5): pause/resume, emergency stop, and
//! graceful IPC shutdown.

use crate::engine::Engine;
use crate::ipc::router::{opt_str_field, DispatchResponse};
use crate::types::{Error, IpcConfig, Result};
use serde_json::{json, Value};

pub async fn handle(
    engine: &Engine,
    method: &str,
    body: Value,
    _ipc_config: &IpcConfig,
) -> Result<DispatchResponse> {
    match method {
        "EmergencyStop" => {
            let devices = engine.emergency_stop().await;
            Ok(DispatchResponse::Single(json!({"devices_turned_off": devices})))
        }
        "PauseFlows" => {
            let reason = opt_str_field(&body, "reason");
            engine.pause_flows(reason).await;
            Ok(DispatchResponse::Single(json!({"ok": true})))
        }
        "ResumeFlows" => {
            engine.resume_flows().await;
            Ok(DispatchResponse::Single(json!({"ok": true})))
        }
        "Shutdown" => {
            engine.shutdown();
            Ok(DispatchResponse::Single(json!({"ok": true})))
        }
        other => Err(Error::not_found(format!("Unknown control method: {}", other))),
    }
}
