//! `engine` service — flow lifecycle and inbound event delivery.
//!
//! Grounded on the teacher's `handlers/orchestration.rs` shape (one `match
//! method` per handler module, JSON body in/out); here the lone
//! orchestration verb "process an envelope through its pipeline" becomes
//! "match an inbound event against active flows and run the winning
//! chain" (spec §4.1, §6).

use crate::dispatcher::InboundEvent;
use crate::engine::Engine;
use crate::ipc::router::{f64_field, str_field, value_field, DispatchResponse};
use crate::model::flow::{Flow, StateField};
use crate::types::{Error, FlowId, Result};
use serde_json::{json, Value};

pub async fn handle(engine: &Engine, method: &str, body: Value) -> Result<DispatchResponse> {
    match method {
        "ActivateFlow" => activate_flow(engine, body).await,
        "DeactivateFlow" => deactivate_flow(engine, body).await,
        "DeactivateAll" => {
            engine.deactivate_all().await;
            Ok(DispatchResponse::Single(json!({"ok": true})))
        }
        "HandleEvent" => handle_event(engine, body).await,
        "SessionSnapshot" => {
            let session = engine.session_snapshot().await;
            Ok(DispatchResponse::Single(serde_json::to_value(session)?))
        }
        "ActiveExecutions" => {
            let execs = engine.active_executions_snapshot().await;
            Ok(DispatchResponse::Single(serde_json::to_value(execs)?))
        }
        other => Err(Error::not_found(format!("Unknown engine method: {}", other))),
    }
}

async fn activate_flow(engine: &Engine, body: Value) -> Result<DispatchResponse> {
    let flow_value = value_field(&body, "flow")?;
    let flow: Flow = serde_json::from_value(flow_value)
        .map_err(|e| Error::validation(format!("invalid flow: {e}")))?;
    let priority_tier = body
        .get("priority_tier")
        .and_then(|v| v.as_u64())
        .map(|n| n as u8)
        .unwrap_or(0);
    engine.activate_flow(flow, priority_tier).await?;
    Ok(DispatchResponse::Single(json!({"ok": true})))
}

async fn deactivate_flow(engine: &Engine, body: Value) -> Result<DispatchResponse> {
    let flow_id = str_field(&body, "flow_id")?;
    let flow_id = FlowId::from_string(flow_id).map_err(Error::validation)?;
    engine.deactivate_flow(&flow_id).await;
    Ok(DispatchResponse::Single(json!({"ok": true})))
}

async fn handle_event(engine: &Engine, body: Value) -> Result<DispatchResponse> {
    let event_body = value_field(&body, "event")?;
    let event_type = str_field(&event_body, "type")?;

    let event = match event_type.as_str() {
        "device_on" => InboundEvent::DeviceOn {
            device_ref: str_field(&event_body, "device_ref")?,
        },
        "device_off" => InboundEvent::DeviceOff {
            device_ref: str_field(&event_body, "device_ref")?,
        },
        "player_speaks" => InboundEvent::PlayerSpeaks {
            content: str_field(&event_body, "content")?,
        },
        "ai_speaks" => InboundEvent::AiSpeaks {
            content: str_field(&event_body, "content")?,
        },
        "random" => InboundEvent::Random,
        "idle" => InboundEvent::Idle,
        "new_session" => InboundEvent::NewSession,
        "player_state_change" => {
            let field_str = str_field(&event_body, "field")?;
            let new_value = f64_field(&event_body, "new_value")?;
            let field = match field_str.as_str() {
                "capacity" => StateField::Capacity,
                "pain" => StateField::Pain,
                "emotion" => StateField::Emotion,
                other => {
                    return Err(Error::validation(format!("unknown state field: {other}")))
                }
            };
            // The session mutation and the trigger match happen together:
            // spec §4.4 item 3 requires every capacity/pain/emotion change
            // to re-check device monitors, and §4.1 point 3g matches the
            // trigger against the post-mutation value.
            engine
                .mutate_session_and_check(|s| match field {
                    StateField::Capacity => s.set_capacity(new_value),
                    StateField::Pain => s.set_pain(new_value),
                    StateField::Emotion => {
                        if let Some(label) = event_body.get("emotion_label").and_then(|v| v.as_str()) {
                            s.set_emotion(label.to_string());
                        }
                    }
                })
                .await;
            InboundEvent::PlayerStateChange { field, new_value }
        }
        "button_press" => InboundEvent::ButtonPress {
            button_id: str_field(&event_body, "button_id")?,
        },
        other => return Err(Error::validation(format!("unknown event type: {other}"))),
    };

    engine.handle_event(event).await;
    Ok(DispatchResponse::Single(json!({"ok": true})))
}
