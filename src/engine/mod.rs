//! The single-serialized-executor (spec §5, §9).
//!
//! `Engine` is the crate's one mutable-state owner, grounded on the
//! teacher's `Kernel` (`src/kernel/mod.rs`: one struct owning every
//! subsystem, every mutation going through `&mut self`). Spec §5 permits
//! two implementations of the serialization invariant: "running the engine
//! on a single executor task with a message queue, or a single coarse lock
//! around each mutation." This crate takes the second path — `EngineState`
//! lives behind a `tokio::sync::Mutex` acquired for short, synchronous
//! bookkeeping bursts and released across every suspension point (device
//! I/O, delay, broadcast, LLM call), so concurrent chains and preemption
//! interleave exactly as spec §5's ordering guarantees require. The
//! teacher's IPC actor loop (`ipc/server.rs`) still drains one request at a
//! time, but request handlers that kick off a flow chain spawn it rather
//! than awaiting it inline, matching "each top-level handleEvent ... runs
//! as its own task."

mod state;

pub use state::{EngineState, PausedMessage};

use crate::broadcast::{send_gated, BroadcastEvent, BroadcastSink, ToastEvent};
use crate::devices::{DeviceCatalog, DeviceDriver, DeviceKey};
use crate::dispatcher::{self, InboundEvent};
use crate::interpreter;
use crate::llm::LlmService;
use crate::model::variables::MessageSender;
use crate::model::{ActiveFlow, Flow, SessionState};
use crate::pending::{DeviceMonitor, MonitorKind, MonitorPredicate};
use crate::types::{EngineDefaults, FlowId, NodeId, Result};
use chrono::Utc;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

struct EngineInner {
    state: Mutex<EngineState>,
    defaults: EngineDefaults,
    device_driver: Arc<dyn DeviceDriver>,
    broadcast: Arc<dyn BroadcastSink>,
    llm: Arc<dyn LlmService>,
    cancel: CancellationToken,
}

/// Cheaply clonable handle to the engine; every handler, timer, and device
/// callback holds a clone of this, never a direct reference to the state.
#[derive(Clone)]
pub struct Engine(Arc<EngineInner>);

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine").finish_non_exhaustive()
    }
}

impl Engine {
    pub fn new(
        defaults: EngineDefaults,
        catalog: DeviceCatalog,
        device_driver: Arc<dyn DeviceDriver>,
        broadcast: Arc<dyn BroadcastSink>,
        llm: Arc<dyn LlmService>,
    ) -> Self {
        Self(Arc::new(EngineInner {
            state: Mutex::new(EngineState::new(catalog)),
            defaults,
            device_driver,
            broadcast,
            llm,
            cancel: CancellationToken::new(),
        }))
    }

    pub fn defaults(&self) -> &EngineDefaults {
        &self.0.defaults
    }

    pub fn device_driver(&self) -> &Arc<dyn DeviceDriver> {
        &self.0.device_driver
    }

    pub fn llm(&self) -> &Arc<dyn LlmService> {
        &self.0.llm
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.0.cancel.clone()
    }

    /// The token an in-flight LLM generation should race against, distinct
    /// from `cancel_token()`'s process-shutdown token — `pause_flows`
    /// cancels and replaces this one without touching shutdown (spec line
    /// 195).
    pub async fn llm_cancel_token(&self) -> CancellationToken {
        self.with_state(|s| s.llm_cancel.clone()).await
    }

    pub async fn is_paused(&self) -> bool {
        self.with_state(|s| s.paused).await
    }

    /// Defers a message broadcast queued by a `send_message`/
    /// `send_player_message` node while flows are paused (spec line 195);
    /// `resume_flows` replays it and continues the chain past `node_id`.
    pub(crate) async fn queue_paused_message(
        &self,
        flow_id: FlowId,
        node_id: NodeId,
        event: BroadcastEvent,
    ) {
        self.with_state(|s| {
            s.pending
                .register_paused_message(flow_id.clone(), node_id.clone());
            s.paused_message = Some(PausedMessage {
                flow_id,
                node_id,
                event,
            });
        })
        .await;
    }

    /// Shuts down background timer tasks registered against this engine
    /// (idle checker, cycle/until timers) — spec §10.5 graceful shutdown.
    pub fn shutdown(&self) {
        self.0.cancel.cancel();
    }

    /// Runs `f` against the engine's single state guard. Held only for the
    /// duration of `f` — callers must never `.await` a suspension point
    /// while inside the closure.
    pub async fn with_state<R>(&self, f: impl FnOnce(&mut EngineState) -> R) -> R {
        let mut guard = self.0.state.lock().await;
        f(&mut guard)
    }

    pub async fn epoch(&self) -> u64 {
        self.with_state(|s| s.concurrency.epoch()).await
    }

    /// True if `snapshot` no longer matches the live epoch — call after
    /// every suspension point (spec §4.2's abort-epoch protocol).
    pub async fn epoch_changed(&self, snapshot: u64) -> bool {
        self.with_state(|s| s.concurrency.epoch_changed(snapshot)).await
    }

    pub async fn is_aborted(&self) -> bool {
        self.with_state(|s| s.concurrency.is_aborted()).await
    }

    pub async fn session_snapshot(&self) -> SessionState {
        self.with_state(|s| s.session.clone()).await
    }

    pub async fn active_executions_snapshot(&self) -> Vec<crate::concurrency::ActiveExecution> {
        self.with_state(|s| s.concurrency.all_active().cloned().collect())
            .await
    }

    /// Sends `event` through the abort-gating filter (spec §5): dropped
    /// while `aborted` is set unless it's a status event.
    pub async fn broadcast_gated(&self, event: BroadcastEvent) {
        let aborted = self.is_aborted().await;
        send_gated(self.0.broadcast.as_ref(), event, aborted).await;
    }

    // ---- Flow lifecycle -------------------------------------------------

    pub async fn activate_flow(&self, flow: Flow, priority_tier: u8) -> Result<()> {
        flow.validate()?;
        self.with_state(|s| s.flows.activate(flow, priority_tier)).await;
        Ok(())
    }

    pub async fn deactivate_flow(&self, flow_id: &FlowId) {
        self.with_state(|s| s.flows.deactivate(flow_id)).await;
    }

    /// Deactivates every flow. Per spec §9's open question, this does NOT
    /// clear `fireOnlyOnce`/once-condition bookkeeping (only
    /// `emergency_stop` does).
    pub async fn deactivate_all(&self) {
        self.with_state(|s| s.flows.deactivate_all()).await;
    }

    /// Dispatcher-level preempt-everything (spec §5 `emergencyStop`):
    /// bumps the epoch, clears every pending-op/monitor/active-execution
    /// registry, resets once-bookkeeping, and syncs `previous_*` session
    /// fields so no phantom `player_state_change` trigger fires against a
    /// stale delta. Returns the devices this flow activity had turned on,
    /// for the caller to physically turn off.
    pub async fn emergency_stop(&self) -> Vec<DeviceKey> {
        let devices = self
            .with_state(|s| {
                s.concurrency.preempt();
                s.pending.clear_all();
                s.monitors.clear_all();
                s.concurrency.clear_all();
                s.paused_message = None;
                for state in s.flows.states.values_mut() {
                    state.clear_once_bookkeeping();
                }
                s.session.sync_previous_state();
                let devices: Vec<DeviceKey> = s
                    .session
                    .device_execution_history
                    .iter()
                    .filter(|(_, d)| d.on || d.cycling)
                    .map(|(k, _)| k.clone())
                    .collect();
                for key in &devices {
                    if let Some(entry) = s.session.device_execution_history.get_mut(key) {
                        entry.on = false;
                        entry.cycling = false;
                    }
                }
                devices
            })
            .await;

        for key in &devices {
            let _ = self.0.device_driver.turn_off(key).await;
        }
        self.with_state(|s| s.concurrency.reset_aborted()).await;
        devices
    }

    /// Spec line 195: suspends new chain dispatch (`handle_event` checks
    /// `s.paused`), discards any in-flight LLM generation by cancelling and
    /// replacing `llm_cancel`, and leaves whatever a message-sending node
    /// already queued (see `queue_paused_message`) for `resume_flows` to
    /// replay. Does not touch already-running non-LLM chain steps — pause
    /// is orthogonal to `abort_epoch` preemption.
    pub async fn pause_flows(&self, reason: Option<String>) {
        self.with_state(|s| {
            s.paused = true;
            s.pause_reason = reason.clone();
            let old = std::mem::replace(&mut s.llm_cancel, CancellationToken::new());
            old.cancel();
        })
        .await;
        self.broadcast_gated(BroadcastEvent::FlowPaused {
            paused: true,
            reason,
            current_node_label: None,
            resuming_at: None,
        })
        .await;
    }

    /// Un-pauses, then re-broadcasts and continues past whichever message
    /// `pause_flows` left queued, if any (spec line 195).
    pub async fn resume_flows(&self) {
        let queued = self
            .with_state(|s| {
                s.paused = false;
                s.pause_reason = None;
                s.paused_message.take()
            })
            .await;

        self.broadcast_gated(BroadcastEvent::FlowPaused {
            paused: false,
            reason: None,
            current_node_label: None,
            resuming_at: queued.as_ref().map(|pm| pm.node_id.to_string()),
        })
        .await;

        if let Some(PausedMessage {
            flow_id,
            node_id,
            event,
        }) = queued
        {
            self.with_state(|s| s.pending.take_paused_message(&flow_id, &node_id))
                .await;
            self.broadcast_gated(event).await;
            let inherited = self
                .with_state(|s| s.concurrency.active_execution(&flow_id).cloned())
                .await;
            let (priority, notify) = inherited
                .map(|e| (e.trigger_priority, e.notify))
                .unwrap_or((None, false));
            let engine = self.clone();
            tokio::spawn(async move {
                interpreter::follow_edges(&engine, &flow_id, &node_id, &[None], true, priority, notify)
                    .await;
            });
        }
    }

    // ---- Event dispatch ---------------------------------------------------

    /// Matches `event` against every active flow's triggers and spawns the
    /// winning chain(s) as independent tasks (spec §5: "each top-level
    /// handleEvent ... runs as its own task"). Returns once dispatch
    /// decisions are made; does not wait for chains to finish.
    pub async fn handle_event(&self, event: InboundEvent) {
        if self.is_paused().await {
            return;
        }
        let now = Utc::now();
        let decision = self
            .with_state(|s| {
                s.session.last_activity = now;
                if matches!(event, InboundEvent::NewSession) {
                    s.session.message_count = 0;
                    s.cooldowns.reset();
                }
                if matches!(
                    event,
                    InboundEvent::PlayerSpeaks { .. } | InboundEvent::AiSpeaks { .. }
                ) {
                    s.session.message_count += 1;
                }
                let mut rng = StdRng::from_entropy();
                let decision = dispatcher::dispatch(
                    &s.flows,
                    &s.session,
                    &mut s.cooldowns,
                    &self.0.defaults,
                    &event,
                    now,
                    &mut rng,
                );
                decision
            })
            .await;

        // Message-count hook (spec §4.1 point 2 / §4.4 item 7) runs before
        // trigger matching settles into execution, so a pause that
        // completes on this message can influence what happens next.
        if matches!(
            event,
            InboundEvent::PlayerSpeaks { .. } | InboundEvent::AiSpeaks { .. }
        ) {
            self.tick_pauses().await;
        }

        for candidate in decision.unblockable {
            let engine = self.clone();
            tokio::spawn(async move {
                interpreter::start_chain(
                    &engine,
                    candidate.flow_id,
                    candidate.node_id,
                    candidate.trigger_priority,
                    candidate.notify,
                )
                .await;
            });
        }

        if let Some(candidate) = decision.normal {
            // spec §3 invariant 5 / §4.1 point 7: `runningFlowPriority` is a
            // single system-wide value — whichever flow is currently
            // executing through a `hasPriority` trigger — not scoped to the
            // new candidate's own flow id (which hasn't started yet).
            let running_priority = self
                .with_state(|s| s.concurrency.running_flow_priority())
                .await;
            if running_priority.is_some()
                && !dispatcher::should_preempt(candidate.trigger_priority, running_priority)
            {
                // Lower/equal priority than what's running: drop silently.
                return;
            }
            if running_priority.is_some() {
                // spec §4.1 point 7: bump the epoch, clear every pending-op
                // and active-execution entry so no in-flight chain's
                // bookkeeping survives the takeover.
                self.with_state(|s| {
                    s.concurrency.preempt();
                    s.pending.clear_all();
                    s.concurrency.clear_all();
                })
                .await;
                self.broadcast_gated(BroadcastEvent::FlowToast {
                    event: ToastEvent::Takeover,
                    message: "a higher-priority flow took over".into(),
                    flow_name: candidate.flow_id.to_string(),
                    current_step: None,
                    total_steps: None,
                    priority: candidate.trigger_priority,
                })
                .await;
                self.with_state(|s| s.concurrency.reset_aborted()).await;
            }

            let engine = self.clone();
            tokio::spawn(async move {
                interpreter::start_chain(
                    &engine,
                    candidate.flow_id,
                    candidate.node_id,
                    candidate.trigger_priority,
                    candidate.notify,
                )
                .await;
            });
        }
    }

    /// Resumption source 7 (spec §4.4): decrements every `PauseResume`
    /// counter and resumes each that reaches zero.
    async fn tick_pauses(&self) {
        let ready = self.with_state(|s| s.pending.tick_pauses()).await;
        for (flow_id, node_id) in ready {
            self.resume_pending(flow_id, node_id, "source-resume").await;
        }
    }

    /// Resumption source 4: player-choice response.
    pub async fn handle_player_choice(&self, node_id: NodeId, choice_id: String, label: String) {
        let Some(flow_id) = self.with_state(|s| s.pending.find_flow(&node_id)).await else {
            return;
        };
        if self
            .with_state(|s| s.pending.take_player_choice(&flow_id, &node_id))
            .await
            .is_none()
        {
            return;
        }
        interpreter::nodes::resolve_player_choice(self, &flow_id, &node_id, &choice_id, &label)
            .await;
        self.continue_chain(flow_id, node_id, Some(choice_id)).await;
    }

    /// Resumption source 5: challenge result.
    pub async fn handle_challenge_result(&self, node_id: NodeId, outcome_id: String, details: Value) {
        let Some(flow_id) = self.with_state(|s| s.pending.find_flow(&node_id)).await else {
            return;
        };
        if self
            .with_state(|s| s.pending.take_challenge(&flow_id, &node_id))
            .await
            .is_none()
        {
            return;
        }
        interpreter::nodes::resolve_challenge_result(self, &flow_id, &node_id, &outcome_id, &details)
            .await;
        self.continue_chain(flow_id, node_id, Some(outcome_id)).await;
    }

    /// Resumption source 6: input response.
    pub async fn handle_input_response(&self, node_id: NodeId, value: Value) {
        let Some(flow_id) = self.with_state(|s| s.pending.find_flow(&node_id)).await else {
            return;
        };
        if self
            .with_state(|s| s.pending.take_input(&flow_id, &node_id))
            .await
            .is_none()
        {
            return;
        }
        interpreter::nodes::resolve_input(self, &flow_id, &node_id, value).await;
        self.continue_chain(flow_id, node_id, None).await;
    }

    /// Resumption source 1: device-driver cycle-completion callback.
    pub async fn handle_cycle_complete(&self, device_key: DeviceKey) {
        let found = self.with_state(|s| s.pending.take_cycle_completion(&device_key)).await;
        let Some(((flow_id, node_id), infinite)) = found else {
            return;
        };
        self.with_state(|s| {
            if let Some(entry) = s.session.device_execution_history.get_mut(&device_key) {
                entry.cycling = false;
            }
        })
        .await;
        if infinite {
            self.broadcast_gated(BroadcastEvent::InfiniteCycleEnd {
                device: device_key,
                flow_id: flow_id.to_string(),
                node_id: node_id.to_string(),
            })
            .await;
        }
        self.continue_chain(flow_id, node_id, Some("completion".to_string())).await;
    }

    /// Resumption source 2: device turn-off event or "until" monitor fire.
    pub async fn handle_device_on_complete(&self, device_key: DeviceKey) {
        let found = self.with_state(|s| s.pending.take_device_on_completion(&device_key)).await;
        let Some((flow_id, node_id)) = found else {
            return;
        };
        self.with_state(|s| {
            if let Some(entry) = s.session.device_execution_history.get_mut(&device_key) {
                entry.on = false;
            }
        })
        .await;
        self.continue_chain(flow_id, node_id, Some("completion".to_string())).await;
    }

    /// Resumption source 3: called after every capacity/pain/emotion
    /// change. Evaluates every `DeviceMonitor`; for each that fires, turns
    /// the device off (or stops its cycle) then invokes the matching
    /// completion path.
    pub async fn check_device_monitors(&self) {
        let fired = self
            .with_state(|s| {
                let session = s.session.clone();
                s.monitors.fired(&session)
            })
            .await;
        for monitor in fired {
            self.with_state(|s| s.monitors.remove(&monitor.device_key)).await;
            match monitor.kind {
                MonitorKind::DeviceOn => {
                    let _ = self.0.device_driver.turn_off(&monitor.device_key).await;
                    self.handle_device_on_complete(monitor.device_key).await;
                }
                MonitorKind::Cycle => {
                    let _ = self.0.device_driver.stop_cycle(&monitor.device_key).await;
                    self.handle_cycle_complete(monitor.device_key).await;
                }
            }
        }
    }

    pub async fn register_device_monitor(&self, monitor: DeviceMonitor) {
        self.with_state(|s| s.monitors.register(monitor)).await;
    }

    pub async fn monitor_predicate_from_until(
        kind: MonitorKind,
        predicate: MonitorPredicate,
        flow_id: FlowId,
        node_id: NodeId,
        device_key: DeviceKey,
    ) -> DeviceMonitor {
        DeviceMonitor {
            flow_id,
            node_id,
            device_key,
            kind,
            predicate,
        }
    }

    /// Mutates session state then re-checks every device monitor (spec
    /// §4.4 item 3: "called after every capacity/pain/emotion change").
    pub async fn mutate_session_and_check(&self, f: impl FnOnce(&mut SessionState)) {
        self.with_state(|s| f(&mut s.session)).await;
        self.check_device_monitors().await;
    }

    pub async fn append_chat_message(&self, content: String, sender: MessageSender) {
        self.with_state(|s| {
            s.session.chat_history_tail.push(crate::model::variables::ChatMessage {
                content,
                sender,
                timestamp: Utc::now(),
            });
        })
        .await;
    }

    /// Resumes a pending-op's flow with the priority/notify the original
    /// trigger carried (spec §4.4: "all six resume paths inherit the
    /// originating flow's triggerPriority and notify from the
    /// ActiveExecution record").
    async fn resume_pending(&self, flow_id: FlowId, node_id: NodeId, handle: &str) {
        let inherited = self
            .with_state(|s| s.concurrency.active_execution(&flow_id).cloned())
            .await;
        let (priority, notify) = inherited
            .map(|e| (e.trigger_priority, e.notify))
            .unwrap_or((None, false));
        let engine = self.clone();
        let handle = handle.to_string();
        tokio::spawn(async move {
            interpreter::resume_chain(&engine, flow_id, node_id, Some(handle), priority, notify).await;
        });
    }

    async fn continue_chain(&self, flow_id: FlowId, node_id: NodeId, handle: Option<String>) {
        let inherited = self
            .with_state(|s| s.concurrency.active_execution(&flow_id).cloned())
            .await;
        let (priority, notify) = inherited
            .map(|e| (e.trigger_priority, e.notify))
            .unwrap_or((None, false));
        let engine = self.clone();
        tokio::spawn(async move {
            interpreter::resume_chain(&engine, flow_id, node_id, handle, priority, notify).await;
        });
    }

    /// Resolves `device_ref` against the catalog (spec §4.9/§6).
    pub async fn resolve_device(&self, device_ref: &str) -> Result<DeviceKey> {
        self.with_state(|s| s.catalog.resolve(device_ref)).await
    }

    pub async fn is_pump(&self, key: &DeviceKey) -> bool {
        self.with_state(|s| s.catalog.is_pump(key)).await
    }

    pub async fn flow_name(&self, flow_id: &FlowId) -> String {
        self.with_state(|s| {
            s.flows
                .active
                .get(flow_id)
                .map(|a| a.flow.name.clone())
                .unwrap_or_else(|| flow_id.to_string())
        })
        .await
    }

    pub fn active_flow_snapshot(active: &ActiveFlow) -> (FlowId, u8) {
        (active.flow.id.clone(), active.priority_tier)
    }
}
