//! `pending` service — the user-response resumption sources (spec §4.4
//! items 4-6): player-choice selection, challenge result, and input
//! response. Each looks up its `PendingOp` by node id and, if still
//! registered, resumes the owning chain.

use crate::engine::Engine;
use crate::ipc::router::{str_field, value_field, DispatchResponse};
use crate::types::{Error, NodeId, Result};
use serde_json::{json, Value};

fn node_id(body: &Value) -> Result<NodeId> {
    let raw = str_field(body, "node_id")?;
    NodeId::from_string(raw).map_err(Error::validation)
}

pub async fn handle(engine: &Engine, method: &str, body: Value) -> Result<DispatchResponse> {
    match method {
        "PlayerChoice" => {
            let node_id = node_id(&body)?;
            let choice_id = str_field(&body, "choice_id")?;
            let label = str_field(&body, "label")?;
            engine.handle_player_choice(node_id, choice_id, label).await;
            Ok(DispatchResponse::Single(json!({"ok": true})))
        }
        "ChallengeResult" => {
            let node_id = node_id(&body)?;
            let outcome_id = str_field(&body, "outcome_id")?;
            let details = body.get("details").cloned().unwrap_or(Value::Null);
            engine
                .handle_challenge_result(node_id, outcome_id, details)
                .await;
            Ok(DispatchResponse::Single(json!({"ok": true})))
        }
        "InputResponse" => {
            let node_id = node_id(&body)?;
            let value = value_field(&body, "value")?;
            engine.handle_input_response(node_id, value).await;
            Ok(DispatchResponse::Single(json!({"ok": true})))
        }
        other => Err(Error::not_found(format!("Unknown pending method: {}", other))),
    }
}
