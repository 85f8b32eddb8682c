//! Outbound broadcast envelope and sink (spec §6).
//!
//! Grounded on the teacher's gRPC `commbus` streaming idea (a single
//! outbound channel fanned out to subscribers) but without the dropped
//! protobuf plumbing: `BroadcastSink` is a plain async trait and the
//! default implementation is a `tokio::sync::broadcast` channel, mirroring
//! how `ipc/server.rs` already uses bounded `mpsc` channels for streamed
//! responses.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Typed outbound envelope (spec §6). Serializes as `{"type": ..., ...}`
/// via the internally-tagged representation so IPC consumers see the same
/// shape the source's JSON broadcasts used.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BroadcastEvent {
    AiMessage {
        content: String,
        suppress_llm: bool,
        flow_id: Option<String>,
        node_id: Option<String>,
        /// Extra routing context (spec §6 `...context`): e.g. challenge
        /// pre-message annotations (`is_challenge_pre_message`,
        /// `possible_outcomes`) so the downstream chat pipeline knows not
        /// to spoil the outcome.
        #[serde(default)]
        context: Option<Value>,
    },
    PlayerMessage {
        content: String,
        suppress_llm: bool,
        flow_id: Option<String>,
        node_id: Option<String>,
        #[serde(default)]
        context: Option<Value>,
    },
    SystemMessage {
        content: String,
    },
    ChatMessage {
        id: String,
        content: String,
        sender: String,
        timestamp: DateTime<Utc>,
        generated: bool,
        from_choice: bool,
    },
    PlayerChoice {
        node_id: String,
        description: Option<String>,
        choices: Vec<ChoiceSummary>,
    },
    SimpleAb {
        node_id: String,
        description: Option<String>,
        label_a: String,
        description_a: String,
        label_b: String,
        description_b: String,
    },
    Challenge {
        node_id: String,
        challenge_type: String,
        config: Value,
    },
    InputRequest {
        node_id: String,
        prompt: Option<String>,
        input_type: String,
        min_value: Option<f64>,
        max_value: Option<f64>,
        variable_name: String,
        required: bool,
    },
    CapacityUpdate {
        capacity: u8,
    },
    PainUpdate {
        pain: u8,
    },
    EmotionUpdate {
        emotion: String,
    },
    InfiniteCycleStart {
        device: String,
        flow_id: String,
        node_id: String,
    },
    InfiniteCycleEnd {
        device: String,
        flow_id: String,
        node_id: String,
    },
    PumpSafetyBlock {
        reason: String,
        capacity: u8,
        device: String,
        source: String,
    },
    ReminderUpdated {
        reminder_id: String,
        action: String,
        is_global: bool,
    },
    CharactersUpdate {
        characters: Value,
    },
    FlowToast {
        event: ToastEvent,
        message: String,
        flow_name: String,
        current_step: Option<u32>,
        total_steps: Option<u32>,
        priority: Option<i32>,
    },
    FlowPaused {
        paused: bool,
        reason: Option<String>,
        current_node_label: Option<String>,
        resuming_at: Option<String>,
    },
    FlowExecutionsUpdate {
        executions: Value,
    },
    Error {
        message: String,
        error: Option<String>,
        context: Option<Value>,
    },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ToastEvent {
    Start,
    Progress,
    Complete,
    Takeover,
    Blocked,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChoiceSummary {
    pub id: String,
    pub label: String,
}

impl BroadcastEvent {
    /// Flow-carrying events are suppressed while `aborted` is set (spec
    /// §5); status events always pass through.
    pub fn is_status_event(&self) -> bool {
        matches!(
            self,
            BroadcastEvent::FlowToast { .. }
                | BroadcastEvent::FlowExecutionsUpdate { .. }
                | BroadcastEvent::Error { .. }
        )
    }
}

/// Outbound event sink. Implementations must not block the engine mutex —
/// `send` is expected to be a cheap enqueue (a channel, a socket write
/// behind its own buffering), not synchronous I/O.
#[async_trait]
pub trait BroadcastSink: Send + Sync {
    async fn send(&self, event: BroadcastEvent);
}

/// Default sink: a bounded `tokio::sync::broadcast` channel. Lagging
/// subscribers lose the oldest events rather than backpressuring the
/// engine (status events are still delivered to subscribers that keep up).
#[derive(Debug)]
pub struct ChannelBroadcastSink {
    tx: tokio::sync::broadcast::Sender<BroadcastEvent>,
}

impl ChannelBroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = tokio::sync::broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<BroadcastEvent> {
        self.tx.subscribe()
    }
}

#[async_trait]
impl BroadcastSink for ChannelBroadcastSink {
    async fn send(&self, event: BroadcastEvent) {
        // No receivers is not an error: nothing is subscribed yet.
        let _ = self.tx.send(event);
    }
}

/// Wraps a sink with the abort-gating rule (spec §5): while `aborted` is
/// true, flow-carrying events are dropped and only status events pass.
pub async fn send_gated(sink: &dyn BroadcastSink, event: BroadcastEvent, aborted: bool) {
    if aborted && !event.is_status_event() {
        tracing::debug!("broadcast_dropped_during_abort");
        return;
    }
    sink.send(event).await;
}
