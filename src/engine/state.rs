//! `EngineState` — every mutable registry the engine serializes access to.
//!
//! Grounded on the teacher's `Kernel` struct owning
//! `ResourceTracker`/`LifecycleManager`/`InterruptService`/`RateLimiter` as
//! plain fields; this is the same shape with the flow-engine's own
//! subsystems in place of the process-orchestration ones.

use crate::broadcast::BroadcastEvent;
use crate::concurrency::Concurrency;
use crate::devices::DeviceCatalog;
use crate::dispatcher::CooldownTracker;
use crate::model::{FlowRegistry, SessionState};
use crate::pending::{DeviceMonitorRegistry, PendingRegistry};
use crate::types::{FlowId, NodeId};
use tokio_util::sync::CancellationToken;

/// The single `send_message`/`send_player_message` broadcast `pause_flows`
/// deferred, held until `resume_flows` replays it and continues the chain
/// past `node_id` (spec line 195).
#[derive(Debug, Clone)]
pub struct PausedMessage {
    pub flow_id: FlowId,
    pub node_id: NodeId,
    pub event: BroadcastEvent,
}

/// Every piece of mutable, process-global state the engine owns (spec §3's
/// `SessionState`, `FlowRegistry`, and the pending-op/monitor registries),
/// gathered behind `Engine`'s single mutex.
#[derive(Debug)]
pub struct EngineState {
    pub flows: FlowRegistry,
    pub session: SessionState,
    pub pending: PendingRegistry,
    pub monitors: DeviceMonitorRegistry,
    pub concurrency: Concurrency,
    pub cooldowns: CooldownTracker,
    pub catalog: DeviceCatalog,
    /// Set by `pauseFlows`/`resumeFlows` (spec §5): orthogonal to
    /// `abortEpoch` preemption — suspends new chain dispatch without
    /// unwinding anything already in flight.
    pub paused: bool,
    pub pause_reason: Option<String>,
    /// Replaced (and the old one cancelled) on every `pause_flows` call, so
    /// an in-flight LLM generation is dropped without tearing down process
    /// shutdown's own token.
    pub llm_cancel: CancellationToken,
    pub paused_message: Option<PausedMessage>,
}

impl EngineState {
    pub fn new(catalog: DeviceCatalog) -> Self {
        Self {
            flows: FlowRegistry::default(),
            session: SessionState::default(),
            pending: PendingRegistry::default(),
            monitors: DeviceMonitorRegistry::default(),
            concurrency: Concurrency::default(),
            cooldowns: CooldownTracker::default(),
            catalog,
            paused: false,
            pause_reason: None,
            llm_cancel: CancellationToken::new(),
            paused_message: None,
        }
    }
}
