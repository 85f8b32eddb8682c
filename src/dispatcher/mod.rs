//! Trigger matching, priority arbitration, and preemption (spec §4.1).
//!
//! Priority arbitration reuses the teacher's `PriorityItem`/min-heap-with-
//! tiebreak idiom from its lifecycle scheduler, with the tiebreak changed
//! from FIFO to a uniform random draw per spec §4.1 point 6 ("ties broken
//! uniformly at random").

pub mod pattern;

use crate::model::flow::{EventType, StateField, TriggerConfig};
use crate::model::{FlowRegistry, SessionState};
use crate::types::{EngineDefaults, FlowId, NodeId};
use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::HashMap;
use std::time::Duration;

/// An event handed to the dispatcher from outside the engine.
#[derive(Debug, Clone)]
pub enum InboundEvent {
    DeviceOn { device_ref: String },
    DeviceOff { device_ref: String },
    PlayerSpeaks { content: String },
    AiSpeaks { content: String },
    Random,
    Idle,
    NewSession,
    PlayerStateChange { field: StateField, new_value: f64 },
    ButtonPress { button_id: String },
}

impl InboundEvent {
    fn event_type(&self) -> EventType {
        match self {
            InboundEvent::DeviceOn { .. } => EventType::DeviceOn,
            InboundEvent::DeviceOff { .. } => EventType::DeviceOff,
            InboundEvent::PlayerSpeaks { .. } => EventType::PlayerSpeaks,
            InboundEvent::AiSpeaks { .. } => EventType::AiSpeaks,
            InboundEvent::Random => EventType::Random,
            InboundEvent::Idle => EventType::Idle,
            InboundEvent::NewSession => EventType::NewSession,
            InboundEvent::PlayerStateChange { .. } => EventType::PlayerStateChange,
            InboundEvent::ButtonPress { .. } => EventType::ButtonPress,
        }
    }

    fn device_ref(&self) -> Option<&str> {
        match self {
            InboundEvent::DeviceOn { device_ref } | InboundEvent::DeviceOff { device_ref } => {
                Some(device_ref)
            }
            _ => None,
        }
    }
}

/// Tracks messages-since-last-fire per speech trigger (spec §4.1 point 2).
/// Adapted from the teacher's `SlidingWindow` prune-then-check idiom, but a
/// message-count distance rather than a time window.
#[derive(Debug, Default)]
pub struct CooldownTracker {
    last_fired_at_message: HashMap<(FlowId, NodeId), u64>,
}

impl CooldownTracker {
    pub fn reset(&mut self) {
        self.last_fired_at_message.clear();
    }

    fn ready(&self, key: &(FlowId, NodeId), now: u64, cooldown: u32) -> bool {
        match self.last_fired_at_message.get(key) {
            None => true,
            Some(&last) => now.saturating_sub(last) >= cooldown as u64,
        }
    }

    fn record(&mut self, key: (FlowId, NodeId), now: u64) {
        self.last_fired_at_message.insert(key, now);
    }
}

/// A trigger that matched the current event.
#[derive(Debug, Clone)]
pub struct TriggerCandidate {
    pub flow_id: FlowId,
    pub node_id: NodeId,
    pub combined_priority: i32,
    pub unblockable: bool,
    pub trigger_priority: Option<i32>,
    pub notify: bool,
}

/// Result of matching one event against every active flow's triggers.
#[derive(Debug, Default)]
pub struct DispatchDecision {
    pub unblockable: Vec<TriggerCandidate>,
    pub normal: Option<TriggerCandidate>,
}

fn matches_trigger(
    cfg: &TriggerConfig,
    event: &InboundEvent,
    session: &SessionState,
    defaults: &EngineDefaults,
    now: DateTime<Utc>,
    rng: &mut impl Rng,
) -> bool {
    let is_first_message_alias = cfg.event_type == EventType::FirstMessage
        && matches!(
            event,
            InboundEvent::PlayerSpeaks { .. } | InboundEvent::AiSpeaks { .. }
        );
    if cfg.event_type != event.event_type() && !is_first_message_alias {
        return false;
    }

    if let Some(filter) = &cfg.device_ref {
        match event.device_ref() {
            Some(ip) if device_ref_matches(filter, ip) => {}
            _ => return false,
        }
    }

    match event {
        InboundEvent::PlayerSpeaks { content } | InboundEvent::AiSpeaks { content } => {
            if !pattern::matches_any(&cfg.keywords, content) {
                return false;
            }
        }
        InboundEvent::Random => {
            let draw = rng.gen_range(0.0..100.0);
            let threshold = cfg.probability.unwrap_or(0.0);
            if draw >= threshold {
                return false;
            }
        }
        InboundEvent::Idle => {
            let threshold = cfg.idle_threshold.unwrap_or(defaults.default_idle_threshold);
            let elapsed = now.signed_duration_since(session.last_activity);
            let elapsed = Duration::from_millis(elapsed.num_milliseconds().max(0) as u64);
            if elapsed < threshold {
                return false;
            }
        }
        InboundEvent::PlayerStateChange { field, new_value } => {
            if cfg.state_type != Some(*field) {
                return false;
            }
            let Some(cmp) = &cfg.state_comparison else {
                return false;
            };
            if !cmp.holds(*new_value) {
                return false;
            }
        }
        _ => {}
    }

    if matches!(event, InboundEvent::PlayerSpeaks { .. } | InboundEvent::AiSpeaks { .. })
        && cfg.event_type == EventType::FirstMessage
        && session.message_count != 1
    {
        return false;
    }

    true
}

/// Device-ref filters match exact ip, or `ip:childId`. Alias/name
/// resolution happens earlier in `devices::resolve`; by the time a
/// `device_ref` reaches the dispatcher it is already the resolved ip key.
fn device_ref_matches(filter: &str, ip: &str) -> bool {
    if filter == ip {
        return true;
    }
    if let Some((filter_ip, _child)) = filter.split_once(':') {
        return filter_ip == ip;
    }
    false
}

/// Matches `event` against every trigger in `registry`, applies cooldown
/// and `fire_only_once` gating, partitions unblockable vs. normal
/// candidates, and randomly tie-breaks among the lowest-priority normal
/// candidates (spec §4.1 points 3-6).
#[allow(clippy::too_many_arguments)]
pub fn dispatch(
    registry: &FlowRegistry,
    session: &SessionState,
    cooldowns: &mut CooldownTracker,
    defaults: &EngineDefaults,
    event: &InboundEvent,
    now: DateTime<Utc>,
    rng: &mut impl Rng,
) -> DispatchDecision {
    let mut unblockable = Vec::new();
    let mut normal = Vec::new();

    for (flow_id, active) in &registry.active {
        let state = registry.states.get(flow_id);
        for (node_id, cfg) in active.flow.triggers() {
            if cfg.fire_only_once
                && state
                    .map(|s| s.executed_once_nodes.contains(node_id))
                    .unwrap_or(false)
            {
                continue;
            }

            if matches!(
                event,
                InboundEvent::PlayerSpeaks { .. } | InboundEvent::AiSpeaks { .. }
            ) {
                let cooldown = cfg.cooldown.unwrap_or(defaults.default_trigger_cooldown);
                let key = (flow_id.clone(), node_id.clone());
                if !cooldowns.ready(&key, session.message_count, cooldown) {
                    continue;
                }
            }

            if !matches_trigger(cfg, event, session, defaults, now, rng) {
                continue;
            }

            let combined_priority = active.priority_tier as i32 * 100
                + cfg.trigger_priority.filter(|_| cfg.trigger_priority.is_some()).unwrap_or(99);

            let candidate = TriggerCandidate {
                flow_id: flow_id.clone(),
                node_id: node_id.clone(),
                combined_priority,
                unblockable: cfg.unblockable,
                trigger_priority: cfg.trigger_priority,
                notify: cfg.notify,
            };

            if cfg.unblockable {
                unblockable.push(candidate);
            } else {
                normal.push(candidate);
            }
        }
    }

    let is_speech = matches!(
        event,
        InboundEvent::PlayerSpeaks { .. } | InboundEvent::AiSpeaks { .. }
    );

    // spec §4.1 step 8: the cooldown marker is bumped only for triggers
    // that actually execute — every unblockable candidate plus the single
    // normal candidate `select_normal`'s tie-break settles on, never for a
    // candidate that merely matched but lost the pick.
    if is_speech {
        for candidate in &unblockable {
            cooldowns.record(
                (candidate.flow_id.clone(), candidate.node_id.clone()),
                session.message_count,
            );
        }
    }

    let selected = select_normal(normal, rng);
    if is_speech {
        if let Some(candidate) = &selected {
            cooldowns.record(
                (candidate.flow_id.clone(), candidate.node_id.clone()),
                session.message_count,
            );
        }
    }

    DispatchDecision {
        unblockable,
        normal: selected,
    }
}

fn select_normal(
    mut candidates: Vec<TriggerCandidate>,
    rng: &mut impl Rng,
) -> Option<TriggerCandidate> {
    let min_priority = candidates.iter().map(|c| c.combined_priority).min()?;
    candidates.retain(|c| c.combined_priority == min_priority);
    candidates.choose(rng).cloned()
}

/// Whether a newly-selected trigger should preempt the currently running
/// flow (spec §4.1 point 7).
pub fn should_preempt(
    new_trigger_priority: Option<i32>,
    running_flow_priority: Option<i32>,
) -> bool {
    match (new_trigger_priority, running_flow_priority) {
        (Some(new_p), Some(running_p)) => new_p < running_p,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::flow::{Edge, Flow, Node, NodeType};
    use crate::model::{ActiveFlow, FlowState};
    use crate::types::{FlowId, NodeId};
    use std::collections::HashMap;

    fn trigger_flow(
        flow_id: FlowId,
        node_id: NodeId,
        cfg: TriggerConfig,
        priority_tier: u8,
    ) -> (ActiveFlow, FlowState) {
        let mut nodes = HashMap::new();
        nodes.insert(
            node_id.clone(),
            Node {
                id: node_id,
                kind: NodeType::Trigger(cfg),
            },
        );
        let flow = Flow {
            id: flow_id,
            name: "test".into(),
            nodes,
            edges: Vec::<Edge>::new(),
        };
        (
            ActiveFlow {
                flow,
                priority_tier,
            },
            FlowState::default(),
        )
    }

    fn base_trigger(event_type: EventType) -> TriggerConfig {
        TriggerConfig {
            event_type,
            device_ref: None,
            keywords: Vec::new(),
            cooldown: None,
            probability: None,
            idle_threshold: None,
            state_type: None,
            state_comparison: None,
            fire_only_once: true,
            unblockable: false,
            trigger_priority: None,
            flow_priority: 0,
            notify: false,
        }
    }

    #[test]
    fn cooldown_blocks_refire_within_window() {
        let mut cooldowns = CooldownTracker::default();
        let key = (FlowId::new(), NodeId::new());
        cooldowns.record(key.clone(), 1);
        assert!(!cooldowns.ready(&key, 3, 5));
        assert!(cooldowns.ready(&key, 6, 5));
    }

    #[test]
    fn single_normal_trigger_selected_among_equal_priority() {
        let mut registry = FlowRegistry::default();
        let defaults = EngineDefaults::default();
        let mut cooldowns = CooldownTracker::default();
        let mut rng = rand::thread_rng();

        for _ in 0..2 {
            let flow_id = FlowId::new();
            let node_id = NodeId::new();
            let mut cfg = base_trigger(EventType::PlayerSpeaks);
            cfg.fire_only_once = false;
            let (active, state) = trigger_flow(flow_id.clone(), node_id, cfg, 0);
            registry.active.insert(flow_id.clone(), active);
            registry.states.insert(flow_id, state);
        }

        let session = SessionState::default();
        let decision = dispatch(
            &registry,
            &session,
            &mut cooldowns,
            &defaults,
            &InboundEvent::PlayerSpeaks {
                content: "hello".into(),
            },
            Utc::now(),
            &mut rng,
        );
        assert!(decision.normal.is_some());
        assert!(decision.unblockable.is_empty());
    }

    #[test]
    fn only_the_selected_normal_trigger_records_its_cooldown() {
        let mut registry = FlowRegistry::default();
        let defaults = EngineDefaults::default();
        let mut cooldowns = CooldownTracker::default();
        let mut rng = rand::thread_rng();

        let mut keys = Vec::new();
        for _ in 0..2 {
            let flow_id = FlowId::new();
            let node_id = NodeId::new();
            let mut cfg = base_trigger(EventType::PlayerSpeaks);
            cfg.fire_only_once = false;
            keys.push((flow_id.clone(), node_id.clone()));
            let (active, state) = trigger_flow(flow_id.clone(), node_id, cfg, 0);
            registry.active.insert(flow_id.clone(), active);
            registry.states.insert(flow_id, state);
        }

        let session = SessionState::default();
        let decision = dispatch(
            &registry,
            &session,
            &mut cooldowns,
            &defaults,
            &InboundEvent::PlayerSpeaks {
                content: "hello".into(),
            },
            Utc::now(),
            &mut rng,
        );
        let selected = decision.normal.expect("one candidate should win the tie-break");
        let winner_key = (selected.flow_id.clone(), selected.node_id.clone());
        let loser_key = keys.into_iter().find(|k| k != &winner_key).unwrap();

        // The winner's cooldown marker was bumped...
        assert!(!cooldowns.ready(&winner_key, session.message_count, defaults.default_trigger_cooldown));
        // ...but the candidate that merely matched and lost the random
        // tie-break never fired, so its cooldown must be untouched.
        assert!(cooldowns.ready(&loser_key, session.message_count, defaults.default_trigger_cooldown));
    }

    #[test]
    fn fire_only_once_prevents_rematch() {
        let mut registry = FlowRegistry::default();
        let flow_id = FlowId::new();
        let node_id = NodeId::new();
        let mut cfg = base_trigger(EventType::NewSession);
        cfg.fire_only_once = true;
        let (active, mut state) = trigger_flow(flow_id.clone(), node_id.clone(), cfg, 0);
        state.executed_once_nodes.insert(node_id);
        registry.active.insert(flow_id.clone(), active);
        registry.states.insert(flow_id, state);

        let defaults = EngineDefaults::default();
        let mut cooldowns = CooldownTracker::default();
        let mut rng = rand::thread_rng();
        let session = SessionState::default();
        let decision = dispatch(
            &registry,
            &session,
            &mut cooldowns,
            &defaults,
            &InboundEvent::NewSession,
            Utc::now(),
            &mut rng,
        );
        assert!(decision.normal.is_none());
    }

    #[test]
    fn preemption_requires_strictly_lower_priority() {
        assert!(should_preempt(Some(2), Some(5)));
        assert!(!should_preempt(Some(5), Some(2)));
        assert!(!should_preempt(Some(5), Some(5)));
        assert!(!should_preempt(None, Some(5)));
    }

    #[test]
    fn executed_once_conditions_field_is_keyed_by_node_and_clause() {
        let mut state = FlowState::default();
        let node = NodeId::new();
        let other_node = NodeId::new();

        state.executed_once_conditions.insert((node.clone(), 0));
        assert!(state.executed_once_conditions.contains(&(node.clone(), 0)));
        // A different clause index on the same node is independent.
        assert!(!state.executed_once_conditions.contains(&(node.clone(), 1)));

        state.executed_once_conditions.insert((node.clone(), 1));
        assert_eq!(state.executed_once_conditions.len(), 2);

        // Same clause index on a different node is also independent.
        assert!(!state
            .executed_once_conditions
            .contains(&(other_node.clone(), 0)));
        state.executed_once_conditions.insert((other_node.clone(), 0));
        assert_eq!(state.executed_once_conditions.len(), 3);

        state.clear_once_bookkeeping();
        assert!(state.executed_once_conditions.is_empty());
    }

    #[test]
    fn first_message_trigger_matches_only_the_opening_message() {
        let mut registry = FlowRegistry::default();
        let flow_id = FlowId::new();
        let node_id = NodeId::new();
        let mut cfg = base_trigger(EventType::FirstMessage);
        cfg.fire_only_once = false;
        cfg.cooldown = Some(0);
        let (active, state) = trigger_flow(flow_id.clone(), node_id, cfg, 0);
        registry.active.insert(flow_id.clone(), active);
        registry.states.insert(flow_id, state);

        let defaults = EngineDefaults::default();
        let mut cooldowns = CooldownTracker::default();
        let mut rng = rand::thread_rng();
        let event = InboundEvent::PlayerSpeaks {
            content: "hello".into(),
        };

        let mut session = SessionState::default();
        session.message_count = 1;
        let decision = dispatch(&registry, &session, &mut cooldowns, &defaults, &event, Utc::now(), &mut rng);
        assert!(decision.normal.is_some());

        session.message_count = 2;
        let decision = dispatch(&registry, &session, &mut cooldowns, &defaults, &event, Utc::now(), &mut rng);
        assert!(decision.normal.is_none());
    }
}
