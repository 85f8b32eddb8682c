//! Pending-op registry and device monitors (spec §3, §4.4).
//!
//! Grounded on the teacher's `ResourceTracker`/`ProcessControlBlock` idiom
//! of plain `HashMap`-backed registries owned by the engine and mutated
//! via `&mut self` — no interior mutability, no separate actor.

use crate::model::flow::{ChallengeType, StateComparison};
use crate::model::SessionState;
use crate::types::{FlowId, NodeId};
use std::collections::HashMap;

/// The six independent resumption sources of spec §4.4 (the message-count
/// hook, item 7, operates on `PauseResume` entries already in this map
/// rather than being a distinct variant).
#[derive(Debug, Clone)]
pub enum PendingOp {
    CycleCompletion { infinite: bool },
    DeviceOnCompletion,
    PlayerChoice,
    Challenge { challenge_type: ChallengeType },
    Input,
    PauseResume { messages_remaining: u32 },
    /// A `send_message`/`send_player_message` broadcast deferred by
    /// `Engine::pause_flows` (spec line 195); holds the chain open until
    /// `resume_flows` replays the queued event and continues past this node.
    PausedMessage,
}

pub type OpKey = (FlowId, NodeId);

/// All in-flight pending operations, keyed by the node that registered
/// them. Device-completion lookups are indexed separately by device key
/// since their resumption source (a driver callback) only knows the
/// device, not the node.
#[derive(Debug, Default)]
pub struct PendingRegistry {
    ops: HashMap<OpKey, PendingOp>,
    by_flow: HashMap<FlowId, Vec<NodeId>>,
    cycle_devices: HashMap<String, OpKey>,
    device_on_devices: HashMap<String, OpKey>,
}

impl PendingRegistry {
    fn insert(&mut self, key: OpKey, op: PendingOp) {
        self.by_flow
            .entry(key.0.clone())
            .or_default()
            .push(key.1.clone());
        self.ops.insert(key, op);
    }

    fn remove(&mut self, key: &OpKey) -> Option<PendingOp> {
        if let Some(nodes) = self.by_flow.get_mut(&key.0) {
            nodes.retain(|n| n != &key.1);
            if nodes.is_empty() {
                self.by_flow.remove(&key.0);
            }
        }
        self.ops.remove(key)
    }

    pub fn register_cycle_completion(
        &mut self,
        flow_id: FlowId,
        node_id: NodeId,
        device_key: String,
        infinite: bool,
    ) {
        let key = (flow_id, node_id);
        self.cycle_devices.insert(device_key, key.clone());
        self.insert(key, PendingOp::CycleCompletion { infinite });
    }

    pub fn register_device_on_completion(
        &mut self,
        flow_id: FlowId,
        node_id: NodeId,
        device_key: String,
    ) {
        let key = (flow_id, node_id);
        self.device_on_devices.insert(device_key, key.clone());
        self.insert(key, PendingOp::DeviceOnCompletion);
    }

    pub fn register_player_choice(&mut self, flow_id: FlowId, node_id: NodeId) {
        self.insert((flow_id, node_id), PendingOp::PlayerChoice);
    }

    pub fn register_challenge(
        &mut self,
        flow_id: FlowId,
        node_id: NodeId,
        challenge_type: ChallengeType,
    ) {
        self.insert((flow_id, node_id), PendingOp::Challenge { challenge_type });
    }

    pub fn register_input(&mut self, flow_id: FlowId, node_id: NodeId) {
        self.insert((flow_id, node_id), PendingOp::Input);
    }

    pub fn register_pause_resume(
        &mut self,
        flow_id: FlowId,
        node_id: NodeId,
        messages_remaining: u32,
    ) {
        self.insert(
            (flow_id, node_id),
            PendingOp::PauseResume { messages_remaining },
        );
    }

    pub fn register_paused_message(&mut self, flow_id: FlowId, node_id: NodeId) {
        self.insert((flow_id, node_id), PendingOp::PausedMessage);
    }

    /// Takes the deferred-message pending op back out once `resume_flows`
    /// has replayed it and is about to continue the chain.
    pub fn take_paused_message(&mut self, flow_id: &FlowId, node_id: &NodeId) -> Option<OpKey> {
        let key = (flow_id.clone(), node_id.clone());
        match self.remove(&key) {
            Some(PendingOp::PausedMessage) => Some(key),
            _ => None,
        }
    }

    /// Resumption source 1: device-driver cycle-completion callback.
    pub fn take_cycle_completion(&mut self, device_key: &str) -> Option<(OpKey, bool)> {
        let key = self.cycle_devices.remove(device_key)?;
        match self.remove(&key) {
            Some(PendingOp::CycleCompletion { infinite }) => Some((key, infinite)),
            _ => None,
        }
    }

    /// Resumption source 2: device turn-off event or "until" monitor fire.
    pub fn take_device_on_completion(&mut self, device_key: &str) -> Option<OpKey> {
        let key = self.device_on_devices.remove(device_key)?;
        match self.remove(&key) {
            Some(PendingOp::DeviceOnCompletion) => Some(key),
            _ => None,
        }
    }

    /// Resumption source 4: player-choice response.
    pub fn take_player_choice(&mut self, flow_id: &FlowId, node_id: &NodeId) -> Option<OpKey> {
        let key = (flow_id.clone(), node_id.clone());
        match self.remove(&key) {
            Some(PendingOp::PlayerChoice) => Some(key),
            _ => None,
        }
    }

    /// Resumption source 5: challenge result.
    pub fn take_challenge(&mut self, flow_id: &FlowId, node_id: &NodeId) -> Option<OpKey> {
        let key = (flow_id.clone(), node_id.clone());
        match self.remove(&key) {
            Some(PendingOp::Challenge { .. }) => Some(key),
            _ => None,
        }
    }

    /// Resumption source 6: input response.
    pub fn take_input(&mut self, flow_id: &FlowId, node_id: &NodeId) -> Option<OpKey> {
        let key = (flow_id.clone(), node_id.clone());
        match self.remove(&key) {
            Some(PendingOp::Input) => Some(key),
            _ => None,
        }
    }

    /// Resumption source 7: after every player/AI message, decrement every
    /// `PauseResume` entry's counter and return the keys that reached zero
    /// (already removed from the registry).
    pub fn tick_pauses(&mut self) -> Vec<OpKey> {
        let mut ready = Vec::new();
        let mut updated = Vec::new();
        for (key, op) in self.ops.iter() {
            if let PendingOp::PauseResume { messages_remaining } = op {
                let next = messages_remaining.saturating_sub(1);
                updated.push((key.clone(), next));
            }
        }
        for (key, next) in updated {
            if next == 0 {
                self.remove(&key);
                ready.push(key);
            } else if let Some(PendingOp::PauseResume { messages_remaining }) =
                self.ops.get_mut(&key)
            {
                *messages_remaining = next;
            }
        }
        ready
    }

    /// Finds which flow registered a pending op on `node_id`. External
    /// responses (choice/challenge/input) only carry a node id; this
    /// recovers the flow id needed to resume the right chain.
    pub fn find_flow(&self, node_id: &NodeId) -> Option<FlowId> {
        self.ops
            .keys()
            .find(|(_, n)| n == node_id)
            .map(|(f, _)| f.clone())
    }

    pub fn has_any_for_flow(&self, flow_id: &FlowId) -> bool {
        self.by_flow
            .get(flow_id)
            .map(|nodes| !nodes.is_empty())
            .unwrap_or(false)
    }

    pub fn clear_all(&mut self) {
        self.ops.clear();
        self.by_flow.clear();
        self.cycle_devices.clear();
        self.device_on_devices.clear();
    }

    pub fn clear_flow(&mut self, flow_id: &FlowId) {
        if let Some(nodes) = self.by_flow.remove(flow_id) {
            for node in nodes {
                self.ops.remove(&(flow_id.clone(), node));
            }
        }
        self.cycle_devices.retain(|_, k| &k.0 != flow_id);
        self.device_on_devices.retain(|_, k| &k.0 != flow_id);
    }
}

/// Which check path a device monitor takes at registration time (spec §9
/// open question: `cycle` and `device_on` monitors are treated as disjoint
/// variants here rather than a single ambiguous `monitorType` string).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorKind {
    Cycle,
    DeviceOn,
}

/// An "until" predicate evaluated on every session-state mutation (spec
/// §4.4 item 3). Timer-based "until" specs are not represented here — they
/// are scheduled directly via `timers` and fire independently.
#[derive(Debug, Clone)]
pub struct DeviceMonitor {
    pub flow_id: FlowId,
    pub node_id: NodeId,
    pub device_key: String,
    pub kind: MonitorKind,
    pub predicate: MonitorPredicate,
}

#[derive(Debug, Clone)]
pub enum MonitorPredicate {
    Capacity(StateComparison),
    Pain(StateComparison),
    Emotion(String),
}

impl MonitorPredicate {
    pub fn holds(&self, session: &SessionState) -> bool {
        match self {
            MonitorPredicate::Capacity(cmp) => cmp.holds(session.capacity as f64),
            MonitorPredicate::Pain(cmp) => cmp.holds(session.pain as f64),
            MonitorPredicate::Emotion(expected) => &session.emotion == expected,
        }
    }
}

#[derive(Debug, Default)]
pub struct DeviceMonitorRegistry {
    monitors: HashMap<String, DeviceMonitor>,
}

impl DeviceMonitorRegistry {
    pub fn register(&mut self, monitor: DeviceMonitor) {
        self.monitors.insert(monitor.device_key.clone(), monitor);
    }

    pub fn remove(&mut self, device_key: &str) -> Option<DeviceMonitor> {
        self.monitors.remove(device_key)
    }

    /// Returns monitors whose predicate currently holds; caller is
    /// responsible for turning the device off/stopping the cycle and then
    /// firing the corresponding pending-op completion (spec §4.4 item 3).
    pub fn fired(&self, session: &SessionState) -> Vec<DeviceMonitor> {
        self.monitors
            .values()
            .filter(|m| m.predicate.holds(session))
            .cloned()
            .collect()
    }

    pub fn clear_flow(&mut self, flow_id: &FlowId) {
        self.monitors.retain(|_, m| &m.flow_id != flow_id);
    }

    pub fn clear_all(&mut self) {
        self.monitors.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cycle_completion_roundtrips_by_device_key() {
        let mut reg = PendingRegistry::default();
        let flow = FlowId::new();
        let node = NodeId::new();
        reg.register_cycle_completion(flow.clone(), node.clone(), "10.0.0.5".into(), false);
        assert!(reg.has_any_for_flow(&flow));
        let (key, infinite) = reg.take_cycle_completion("10.0.0.5").unwrap();
        assert_eq!(key, (flow.clone(), node));
        assert!(!infinite);
        assert!(!reg.has_any_for_flow(&flow));
        assert!(reg.take_cycle_completion("10.0.0.5").is_none());
    }

    #[test]
    fn pause_resume_ticks_down_and_fires_at_zero() {
        let mut reg = PendingRegistry::default();
        let flow = FlowId::new();
        let node = NodeId::new();
        reg.register_pause_resume(flow.clone(), node.clone(), 2);
        assert!(reg.tick_pauses().is_empty());
        let ready = reg.tick_pauses();
        assert_eq!(ready, vec![(flow, node)]);
    }

    #[test]
    fn device_monitor_fires_on_capacity_threshold() {
        let mut registry = DeviceMonitorRegistry::default();
        let monitor = DeviceMonitor {
            flow_id: FlowId::new(),
            node_id: NodeId::new(),
            device_key: "pump-1".into(),
            kind: MonitorKind::DeviceOn,
            predicate: MonitorPredicate::Capacity(StateComparison::Greater(50.0)),
        };
        registry.register(monitor);
        let mut session = SessionState::default();
        session.capacity = 30;
        assert!(registry.fired(&session).is_empty());
        session.capacity = 55;
        assert_eq!(registry.fired(&session).len(), 1);
    }
}
