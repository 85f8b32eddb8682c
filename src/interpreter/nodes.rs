//! Per-`NodeType` executors (spec §4.3).
//!
//! Grounded on the teacher's `PipelineStage` trait objects
//! (`src/kernel/orchestrator.rs`): one function per stage kind, each
//! returning a typed outcome the caller routes on rather than the stage
//! mutating shared control flow directly.

use crate::broadcast::BroadcastEvent;
use crate::model::flow::{
    handles, ActionConfig, BranchConfig, ConditionConfig, ConditionOperator, ConditionVariable,
    DelayConfig, Node, NodeType, PauseResumeConfig, StateField, SubCondition, UntilSpec,
};
use crate::model::variables::{substitute, MessageSender, SubstitutionExtras};
use crate::model::SessionState;
use crate::pending::{DeviceMonitor, MonitorKind, MonitorPredicate};
use crate::types::{FlowId, NodeId};
use crate::Engine;
use chrono::Utc;
use rand::Rng;
use rand::{rngs::StdRng, SeedableRng};
use serde_json::Value;
use std::time::Duration;

/// What the interpreter should do after a node finishes (spec §4.2 step 6).
#[derive(Debug, Clone)]
pub enum NodeOutcome {
    /// Follow the first candidate handle (in order) that has a matching
    /// outgoing edge.
    Next(Vec<Option<String>>),
    /// Suspend the chain; a pending-op resumption will continue it later.
    Wait,
    /// Chain was preempted mid-node; caller drains depth and stops.
    Aborted,
    /// The node itself failed (device/LLM error already broadcast); the
    /// interpreter still unwinds depth as if finished (spec §4.5: node
    /// failures don't kill the chain on their own — callers that want a
    /// "failure" edge route it via `Next` from within the handler instead).
    Failed,
}

/// Node kind name used for panic-recovery logging and as the recovery
/// macro's operation context (spec §4.5: a failing node executor must not
/// unwind the chain it belongs to).
fn node_kind_label(kind: &NodeType) -> &'static str {
    match kind {
        NodeType::Trigger(_) => "trigger",
        NodeType::ButtonPress(_) => "button_press",
        NodeType::Action(_) => "action",
        NodeType::Condition(_) => "condition",
        NodeType::Branch(_) => "branch",
        NodeType::Delay(_) => "delay",
        NodeType::PlayerChoice(_) => "player_choice",
        NodeType::SimpleAb(_) => "simple_ab",
        NodeType::Input(_) => "input",
        NodeType::RandomNumber(_) => "random_number",
        NodeType::CapacityAiMessage(_) => "capacity_ai_message",
        NodeType::CapacityPlayerMessage(_) => "capacity_player_message",
        NodeType::PauseResume(_) => "pause_resume",
        NodeType::Challenge(_) => "challenge",
    }
}

pub async fn execute(
    engine: &Engine,
    flow_id: &FlowId,
    node_id: &NodeId,
    node: &Node,
    inherited_priority: Option<i32>,
    inherited_notify: bool,
) -> NodeOutcome {
    let outcome = crate::recovery::with_recovery_async(
        || async {
            Ok(match &node.kind {
                NodeType::Trigger(_) | NodeType::ButtonPress(_) => NodeOutcome::Next(vec![None]),
                NodeType::Action(cfg) => exec_action(engine, flow_id, node_id, cfg).await,
                NodeType::Condition(cfg) => exec_condition(engine, flow_id, node_id, cfg).await,
                NodeType::Branch(cfg) => exec_branch(cfg),
                NodeType::Delay(cfg) => exec_delay(engine, cfg).await,
                NodeType::PlayerChoice(cfg) => {
                    exec_player_choice(engine, flow_id, node_id, cfg).await
                }
                NodeType::SimpleAb(cfg) => exec_simple_ab(engine, flow_id, node_id, cfg).await,
                NodeType::Input(cfg) => exec_input(engine, flow_id, node_id, cfg).await,
                NodeType::RandomNumber(cfg) => exec_random_number(engine, cfg).await,
                NodeType::CapacityAiMessage(cfg) => {
                    exec_capacity_message(engine, flow_id, node_id, cfg, true).await
                }
                NodeType::CapacityPlayerMessage(cfg) => {
                    exec_capacity_message(engine, flow_id, node_id, cfg, false).await
                }
                NodeType::PauseResume(cfg) => {
                    exec_pause_resume(
                        engine,
                        flow_id,
                        node_id,
                        cfg,
                        inherited_priority,
                        inherited_notify,
                    )
                    .await
                }
                NodeType::Challenge(cfg) => exec_challenge(engine, flow_id, node_id, cfg).await,
            })
        },
        node_kind_label(&node.kind),
    )
    .await;

    match outcome {
        Ok(outcome) => outcome,
        Err(e) => {
            engine
                .broadcast_gated(BroadcastEvent::Error {
                    message: format!("node executor panicked: {e}"),
                    error: Some(e.to_string()),
                    context: Some(
                        serde_json::json!({"context": "node_panic", "node_id": node_id.to_string()}),
                    ),
                })
                .await;
            NodeOutcome::Failed
        }
    }
}

// ---- action ----------------------------------------------------------

async fn exec_action(
    engine: &Engine,
    flow_id: &FlowId,
    node_id: &NodeId,
    cfg: &crate::model::flow::ActionConfig,
) -> NodeOutcome {
    match cfg {
        ActionConfig::SendMessage(spec) => {
            let session = engine.session_snapshot().await;
            let content = substitute(&spec.text, &session, &SubstitutionExtras::default());
            let event = BroadcastEvent::AiMessage {
                content,
                suppress_llm: spec.suppress_llm,
                flow_id: Some(flow_id.to_string()),
                node_id: Some(node_id.to_string()),
                context: None,
            };
            if engine.is_paused().await {
                engine
                    .queue_paused_message(flow_id.clone(), node_id.clone(), event)
                    .await;
                return NodeOutcome::Wait;
            }
            engine.broadcast_gated(event).await;
            NodeOutcome::Next(vec![None])
        }
        ActionConfig::SendPlayerMessage(spec) => {
            let session = engine.session_snapshot().await;
            let content = substitute(&spec.text, &session, &SubstitutionExtras::default());
            let event = BroadcastEvent::PlayerMessage {
                content,
                suppress_llm: spec.suppress_llm,
                flow_id: Some(flow_id.to_string()),
                node_id: Some(node_id.to_string()),
                context: None,
            };
            if engine.is_paused().await {
                engine
                    .queue_paused_message(flow_id.clone(), node_id.clone(), event)
                    .await;
                return NodeOutcome::Wait;
            }
            engine.broadcast_gated(event).await;
            NodeOutcome::Next(vec![None])
        }
        ActionConfig::SystemMessage { text } => {
            let session = engine.session_snapshot().await;
            let content = substitute(text, &session, &SubstitutionExtras::default());
            engine.broadcast_gated(BroadcastEvent::SystemMessage { content }).await;
            NodeOutcome::Next(vec![None])
        }
        ActionConfig::DeviceOn {
            device_ref,
            until,
            allow_over_inflation,
        } => exec_device_on(engine, flow_id, node_id, device_ref, until.as_ref(), *allow_over_inflation).await,
        ActionConfig::DeviceOff { device_ref } => exec_device_off(engine, device_ref).await,
        ActionConfig::StartCycle {
            device_ref,
            duration_secs,
            interval_secs,
            cycles,
            until,
        } => {
            exec_start_cycle(
                engine, flow_id, node_id, device_ref, duration_secs, interval_secs, *cycles, until.as_ref(),
            )
            .await
        }
        ActionConfig::StopCycle { device_ref } => exec_stop_cycle(engine, device_ref).await,
        ActionConfig::PulsePump { device_ref, pulses } => exec_pulse_pump(engine, device_ref, pulses).await,
        ActionConfig::DeclareVariable { name, value } => {
            engine
                .with_state(|s| {
                    s.session.flow_variables.insert(name.clone(), value.clone());
                })
                .await;
            NodeOutcome::Next(vec![None])
        }
        ActionConfig::SetVariable { target, value } => {
            let resolved = {
                let session = engine.session_snapshot().await;
                value.resolve(&session)
            };
            match target {
                StateField::Capacity => {
                    engine.mutate_session_and_check(|s| s.set_capacity(resolved)).await;
                    let capacity = engine.session_snapshot().await.capacity;
                    engine.broadcast_gated(BroadcastEvent::CapacityUpdate { capacity }).await;
                }
                StateField::Pain => {
                    engine.mutate_session_and_check(|s| s.set_pain(resolved)).await;
                    let pain = engine.session_snapshot().await.pain;
                    engine.broadcast_gated(BroadcastEvent::PainUpdate { pain }).await;
                }
                StateField::Emotion => {
                    let emotion = resolved.to_string();
                    engine.mutate_session_and_check(|s| s.set_emotion(emotion)).await;
                    let emotion = engine.session_snapshot().await.emotion;
                    engine.broadcast_gated(BroadcastEvent::EmotionUpdate { emotion }).await;
                }
            }
            NodeOutcome::Next(vec![None])
        }
        ActionConfig::ToggleReminder { reminder_id, is_global } => {
            engine
                .broadcast_gated(BroadcastEvent::ReminderUpdated {
                    reminder_id: reminder_id.clone(),
                    action: "toggled".into(),
                    is_global: *is_global,
                })
                .await;
            NodeOutcome::Next(vec![None])
        }
        ActionConfig::ToggleButton { button_id } => {
            engine
                .broadcast_gated(BroadcastEvent::ReminderUpdated {
                    reminder_id: button_id.clone(),
                    action: "button_toggled".into(),
                    is_global: false,
                })
                .await;
            NodeOutcome::Next(vec![None])
        }
    }
}

async fn exec_device_on(
    engine: &Engine,
    flow_id: &FlowId,
    node_id: &NodeId,
    device_ref: &str,
    until: Option<&UntilSpec>,
    allow_over_inflation: bool,
) -> NodeOutcome {
    let key = match engine.resolve_device(device_ref).await {
        Ok(k) => k,
        Err(e) => {
            engine
                .broadcast_gated(BroadcastEvent::Error {
                    message: format!("device_on: {e}"),
                    error: Some(e.to_string()),
                    context: None,
                })
                .await;
            return NodeOutcome::Next(vec![Some(handles::IMMEDIATE.to_string())]);
        }
    };

    let already_on = engine
        .with_state(|s| {
            s.session
                .device_execution_history
                .get(&key)
                .map(|d| d.on)
                .unwrap_or(false)
        })
        .await;
    if already_on {
        return NodeOutcome::Next(vec![Some(handles::IMMEDIATE.to_string())]);
    }

    if engine.is_pump(&key).await {
        let capacity = engine.session_snapshot().await.capacity;
        if capacity >= 100 && !allow_over_inflation {
            engine
                .broadcast_gated(BroadcastEvent::PumpSafetyBlock {
                    reason: "capacity at or above 100".into(),
                    capacity,
                    device: key,
                    source: "device_on".into(),
                })
                .await;
            return NodeOutcome::Next(vec![Some(handles::IMMEDIATE.to_string())]);
        }
    }

    if let Err(e) = engine.device_driver().turn_on(&key).await {
        engine
            .broadcast_gated(BroadcastEvent::Error {
                message: format!("device_on turnOn failed: {e}"),
                error: Some(e.to_string()),
                context: None,
            })
            .await;
        return NodeOutcome::Next(vec![Some(handles::IMMEDIATE.to_string())]);
    }

    engine
        .with_state(|s| {
            s.session
                .device_execution_history
                .entry(key.clone())
                .or_default()
                .on = true;
            s.pending.register_device_on_completion(flow_id.clone(), node_id.clone(), key.clone());
        })
        .await;

    if let Some(until) = until {
        register_until(engine, MonitorKind::DeviceOn, until, flow_id.clone(), node_id.clone(), key.clone()).await;
    }

    NodeOutcome::Next(vec![Some(handles::IMMEDIATE.to_string())])
}

async fn exec_device_off(engine: &Engine, device_ref: &str) -> NodeOutcome {
    let key = match engine.resolve_device(device_ref).await {
        Ok(k) => k,
        Err(e) => {
            engine
                .broadcast_gated(BroadcastEvent::Error {
                    message: format!("device_off: {e}"),
                    error: Some(e.to_string()),
                    context: None,
                })
                .await;
            return NodeOutcome::Next(vec![None]);
        }
    };

    let already_off = engine
        .with_state(|s| {
            !s.session
                .device_execution_history
                .get(&key)
                .map(|d| d.on)
                .unwrap_or(false)
        })
        .await;
    if already_off {
        return NodeOutcome::Next(vec![None]);
    }

    let _ = engine.device_driver().turn_off(&key).await;
    engine.with_state(|s| { s.monitors.remove(&key); }).await;
    engine.handle_device_on_complete(key).await;
    NodeOutcome::Next(vec![None])
}

#[allow(clippy::too_many_arguments)]
async fn exec_start_cycle(
    engine: &Engine,
    flow_id: &FlowId,
    node_id: &NodeId,
    device_ref: &str,
    duration_secs: &crate::model::flow::VarOrNumber,
    interval_secs: &crate::model::flow::VarOrNumber,
    cycles: u32,
    until: Option<&UntilSpec>,
) -> NodeOutcome {
    let key = match engine.resolve_device(device_ref).await {
        Ok(k) => k,
        Err(e) => {
            engine
                .broadcast_gated(BroadcastEvent::Error {
                    message: format!("start_cycle: {e}"),
                    error: Some(e.to_string()),
                    context: None,
                })
                .await;
            return NodeOutcome::Next(vec![Some(handles::IMMEDIATE.to_string())]);
        }
    };

    let already_cycling = engine
        .with_state(|s| {
            s.session
                .device_execution_history
                .get(&key)
                .map(|d| d.cycling)
                .unwrap_or(false)
        })
        .await;
    if already_cycling {
        return NodeOutcome::Next(vec![Some(handles::IMMEDIATE.to_string())]);
    }

    let session = engine.session_snapshot().await;
    let duration = Duration::from_secs_f64(duration_secs.resolve(&session).max(0.0));
    let interval = Duration::from_secs_f64(interval_secs.resolve(&session).max(0.0));

    let result = engine.device_driver().start_cycle(&key, duration, interval, cycles).await;
    let infinite = match result {
        Ok(handle) => handle.infinite || (cycles == 0 && until.is_none()),
        Err(e) => {
            engine
                .broadcast_gated(BroadcastEvent::Error {
                    message: format!("start_cycle failed: {e}"),
                    error: Some(e.to_string()),
                    context: None,
                })
                .await;
            return NodeOutcome::Next(vec![Some(handles::IMMEDIATE.to_string())]);
        }
    };

    engine
        .with_state(|s| {
            s.session
                .device_execution_history
                .entry(key.clone())
                .or_default()
                .cycling = true;
            s.pending.register_cycle_completion(flow_id.clone(), node_id.clone(), key.clone(), infinite);
        })
        .await;

    if let Some(until) = until {
        register_until(engine, MonitorKind::Cycle, until, flow_id.clone(), node_id.clone(), key.clone()).await;
    } else if !infinite {
        // No "until" predicate and a finite cycle count: the cycle
        // completes on its own after cycles * (duration + interval)
        // (spec §8 scenario 3), so schedule the natural completion timer.
        crate::timers::spawn_cycle_completion_timer(engine.clone(), key.clone(), duration, interval, cycles);
    }

    if infinite {
        engine
            .broadcast_gated(BroadcastEvent::InfiniteCycleStart {
                device: key,
                flow_id: flow_id.to_string(),
                node_id: node_id.to_string(),
            })
            .await;
    }

    NodeOutcome::Next(vec![Some(handles::IMMEDIATE.to_string())])
}

async fn exec_stop_cycle(engine: &Engine, device_ref: &str) -> NodeOutcome {
    let key = match engine.resolve_device(device_ref).await {
        Ok(k) => k,
        Err(e) => {
            engine
                .broadcast_gated(BroadcastEvent::Error {
                    message: format!("stop_cycle: {e}"),
                    error: Some(e.to_string()),
                    context: None,
                })
                .await;
            return NodeOutcome::Next(vec![None]);
        }
    };

    match engine.device_driver().stop_cycle(&key).await {
        Ok(false) => {
            let _ = engine.device_driver().turn_off(&key).await;
        }
        Err(e) => {
            engine
                .broadcast_gated(BroadcastEvent::Error {
                    message: format!("stop_cycle failed: {e}"),
                    error: Some(e.to_string()),
                    context: None,
                })
                .await;
        }
        Ok(true) => {}
    }

    engine.with_state(|s| {
        s.monitors.remove(&key);
        if let Some(entry) = s.session.device_execution_history.get_mut(&key) {
            entry.cycling = false;
        }
    }).await;
    engine.handle_cycle_complete(key).await;
    NodeOutcome::Next(vec![None])
}

async fn exec_pulse_pump(
    engine: &Engine,
    device_ref: &str,
    pulses: &crate::model::flow::VarOrNumber,
) -> NodeOutcome {
    let key = match engine.resolve_device(device_ref).await {
        Ok(k) => k,
        Err(e) => {
            engine
                .broadcast_gated(BroadcastEvent::Error {
                    message: format!("pulse_pump: {e}"),
                    error: Some(e.to_string()),
                    context: None,
                })
                .await;
            return NodeOutcome::Next(vec![None]);
        }
    };

    let count = {
        let session = engine.session_snapshot().await;
        pulses.resolve(&session).round().max(0.0) as u32
    };
    let pulse_delay = engine.defaults().pulse_pump_delay;

    for _ in 0..count {
        if engine.is_aborted().await {
            return NodeOutcome::Aborted;
        }
        if engine.device_driver().turn_on(&key).await.is_err() {
            let _ = engine.device_driver().turn_off(&key).await;
            break;
        }
        tokio::time::sleep(pulse_delay).await;
        let _ = engine.device_driver().turn_off(&key).await;
        tokio::time::sleep(pulse_delay).await;
    }

    NodeOutcome::Next(vec![None])
}

/// Registers an "until" predicate against the monitor registry, or schedules
/// a direct auto-off timer for the `timer` variant (spec §4.3: "timer
/// variant schedules auto-off").
async fn register_until(
    engine: &Engine,
    kind: MonitorKind,
    until: &UntilSpec,
    flow_id: FlowId,
    node_id: NodeId,
    device_key: String,
) {
    match until {
        UntilSpec::Capacity(cmp) => {
            engine
                .register_device_monitor(DeviceMonitor {
                    flow_id,
                    node_id,
                    device_key,
                    kind,
                    predicate: MonitorPredicate::Capacity(cmp.clone()),
                })
                .await;
        }
        UntilSpec::Pain(cmp) => {
            engine
                .register_device_monitor(DeviceMonitor {
                    flow_id,
                    node_id,
                    device_key,
                    kind,
                    predicate: MonitorPredicate::Pain(cmp.clone()),
                })
                .await;
        }
        UntilSpec::Emotion(value) => {
            engine
                .register_device_monitor(DeviceMonitor {
                    flow_id,
                    node_id,
                    device_key,
                    kind,
                    predicate: MonitorPredicate::Emotion(value.clone()),
                })
                .await;
        }
        UntilSpec::Timer(duration) => {
            let engine = engine.clone();
            let duration = *duration;
            tokio::spawn(async move {
                tokio::time::sleep(duration).await;
                match kind {
                    MonitorKind::DeviceOn => {
                        let _ = engine.device_driver().turn_off(&device_key).await;
                        engine.handle_device_on_complete(device_key).await;
                    }
                    MonitorKind::Cycle => {
                        let _ = engine.device_driver().stop_cycle(&device_key).await;
                        engine.handle_cycle_complete(device_key).await;
                    }
                }
            });
        }
    }
}

// ---- condition ---------------------------------------------------------

async fn exec_condition(engine: &Engine, flow_id: &FlowId, node_id: &NodeId, cfg: &ConditionConfig) -> NodeOutcome {
    let session = engine.session_snapshot().await;
    let matched = engine
        .with_state(|s| {
            let already: std::collections::HashSet<usize> = s
                .flows
                .states
                .get(flow_id)
                .map(|st| {
                    st.executed_once_conditions
                        .iter()
                        .filter(|(n, _)| n == node_id)
                        .map(|(_, i)| *i)
                        .collect()
                })
                .unwrap_or_default();
            for (idx, clause) in cfg.clauses.iter().enumerate() {
                if cfg.once_only && already.contains(&idx) {
                    continue;
                }
                if clause.iter().all(|sc| sub_condition_holds(sc, &session)) {
                    if cfg.once_only {
                        if let Some(state) = s.flows.states.get_mut(flow_id) {
                            state.executed_once_conditions.insert((node_id.clone(), idx));
                        }
                    }
                    return Some(idx);
                }
            }
            None
        })
        .await;

    match matched {
        Some(idx) => NodeOutcome::Next(vec![Some(handles::true_n(idx as u32))]),
        None => NodeOutcome::Next(vec![Some(handles::FALSE.to_string())]),
    }
}

fn sub_condition_holds(sc: &SubCondition, session: &SessionState) -> bool {
    match &sc.variable {
        ConditionVariable::Capacity => numeric_holds(session.capacity as f64, sc, true),
        ConditionVariable::Pain => numeric_holds(session.pain as f64, sc, true),
        ConditionVariable::Emotion => string_holds(&session.emotion, sc),
        ConditionVariable::FlowVar(name) => match session.flow_variables.get(name) {
            Some(v) => value_holds(v, sc),
            None => false,
        },
    }
}

fn as_f64(v: &Value) -> Option<f64> {
    v.as_f64().or_else(|| v.as_str().and_then(|s| s.parse().ok()))
}

fn numeric_holds(value: f64, sc: &SubCondition, integer: bool) -> bool {
    let target = as_f64(&sc.value).unwrap_or(0.0);
    let (value, target) = if integer { (value.round(), target.round()) } else { (value, target) };
    match sc.operator {
        ConditionOperator::Eq => (value - target).abs() < f64::EPSILON,
        ConditionOperator::Ne => (value - target).abs() >= f64::EPSILON,
        ConditionOperator::Gt => value > target,
        ConditionOperator::Lt => value < target,
        ConditionOperator::Gte => value >= target,
        ConditionOperator::Lte => value <= target,
        ConditionOperator::Range => {
            let hi_raw = sc.value2.as_ref().and_then(as_f64).unwrap_or(target);
            let hi = if integer { hi_raw.round() } else { hi_raw };
            value >= target && value <= hi
        }
        ConditionOperator::Contains => false,
    }
}

fn string_holds(value: &str, sc: &SubCondition) -> bool {
    let target = sc.value.as_str().unwrap_or_default();
    match sc.operator {
        ConditionOperator::Eq => value == target,
        ConditionOperator::Ne => value != target,
        ConditionOperator::Contains => value.to_lowercase().contains(&target.to_lowercase()),
        _ => false,
    }
}

fn value_holds(value: &Value, sc: &SubCondition) -> bool {
    if let Some(n) = value.as_f64() {
        return numeric_holds(n, sc, false);
    }
    if let Some(s) = value.as_str() {
        return string_holds(s, sc);
    }
    matches!(sc.operator, ConditionOperator::Eq) && value == &sc.value
}

// ---- branch --------------------------------------------------------------

fn exec_branch(cfg: &BranchConfig) -> NodeOutcome {
    match cfg {
        BranchConfig::Sequential => NodeOutcome::Next(vec![Some(handles::branch_n(0))]),
        BranchConfig::Random { weights } => {
            let idx = weighted_pick(weights);
            NodeOutcome::Next(vec![Some(handles::branch_n(idx as u32))])
        }
    }
}

fn weighted_pick(weights: &[f64]) -> usize {
    if weights.is_empty() {
        return 0;
    }
    let total: f64 = weights.iter().sum();
    let mut rng = StdRng::from_entropy();
    if total <= 0.0 {
        return rng.gen_range(0..weights.len());
    }
    let mut draw = rng.gen::<f64>() * total;
    for (i, w) in weights.iter().enumerate() {
        if draw < *w {
            return i;
        }
        draw -= w;
    }
    weights.len() - 1
}

// ---- delay ---------------------------------------------------------------

async fn exec_delay(engine: &Engine, cfg: &DelayConfig) -> NodeOutcome {
    let resolved = {
        let session = engine.session_snapshot().await;
        cfg.duration.resolve(&session)
    };
    let duration = cfg.as_duration(resolved);
    let snapshot = engine.epoch().await;
    tokio::time::sleep(duration).await;
    if engine.epoch_changed(snapshot).await {
        return NodeOutcome::Aborted;
    }
    NodeOutcome::Next(vec![None])
}

// ---- player_choice / simple_ab -------------------------------------------

async fn exec_player_choice(
    engine: &Engine,
    flow_id: &FlowId,
    node_id: &NodeId,
    cfg: &crate::model::flow::PlayerChoiceConfig,
) -> NodeOutcome {
    let session = engine.session_snapshot().await;
    if let Some(intro) = &cfg.intro_message {
        let labels: Vec<String> = cfg.choices.iter().map(|c| c.label.clone()).collect();
        let extras = SubstitutionExtras {
            choices_list: Some(&labels),
            ..Default::default()
        };
        let content = substitute(&intro.text, &session, &extras);
        engine
            .broadcast_gated(BroadcastEvent::AiMessage {
                content,
                suppress_llm: intro.suppress_llm,
                flow_id: Some(flow_id.to_string()),
                node_id: Some(node_id.to_string()),
                context: None,
            })
            .await;
    }
    if let Some(prompt) = &cfg.ai_prompt {
        let content = substitute(prompt, &session, &SubstitutionExtras::default());
        engine
            .broadcast_gated(BroadcastEvent::AiMessage {
                content,
                suppress_llm: false,
                flow_id: Some(flow_id.to_string()),
                node_id: Some(node_id.to_string()),
                context: None,
            })
            .await;
    }

    engine.with_state(|s| s.pending.register_player_choice(flow_id.clone(), node_id.clone())).await;

    engine
        .broadcast_gated(BroadcastEvent::PlayerChoice {
            node_id: node_id.to_string(),
            description: cfg.ai_prompt.clone(),
            choices: cfg
                .choices
                .iter()
                .map(|c| crate::broadcast::ChoiceSummary {
                    id: c.id.clone(),
                    label: c.label.clone(),
                })
                .collect(),
        })
        .await;

    NodeOutcome::Wait
}

async fn exec_simple_ab(
    engine: &Engine,
    flow_id: &FlowId,
    node_id: &NodeId,
    cfg: &crate::model::flow::SimpleAbConfig,
) -> NodeOutcome {
    engine.with_state(|s| s.pending.register_player_choice(flow_id.clone(), node_id.clone())).await;
    engine
        .broadcast_gated(BroadcastEvent::SimpleAb {
            node_id: node_id.to_string(),
            description: None,
            label_a: cfg.label_a.clone(),
            description_a: cfg.description_a.clone(),
            label_b: cfg.label_b.clone(),
            description_b: cfg.description_b.clone(),
        })
        .await;
    NodeOutcome::Wait
}

/// Resumption path for player-choice/simple-ab responses (spec §4.4 item 4).
/// `simple_ab` never generates a persona message, matching spec §4.3.
pub async fn resolve_player_choice(engine: &Engine, flow_id: &FlowId, node_id: &NodeId, choice_id: &str, label: &str) {
    let node = engine
        .with_state(|s| {
            s.flows
                .active
                .get(flow_id)
                .and_then(|a| a.flow.nodes.get(node_id))
                .cloned()
        })
        .await;
    let Some(node) = node else { return };
    let NodeType::PlayerChoice(cfg) = &node.kind else {
        return;
    };
    let Some(choice) = cfg.choices.iter().find(|c| c.id == choice_id) else {
        return;
    };

    let (content, generated) = if let Some(template) = &choice.player_response {
        let session = engine.session_snapshot().await;
        let extras = SubstitutionExtras {
            choice: Some(label),
            ..Default::default()
        };
        (substitute(template, &session, &extras), false)
    } else if choice.llm_enhance {
        let prompt = format!(
            "The player has chosen \"{label}\". Respond in character, committing to this choice without spoiling future outcomes."
        );
        let generated = engine
            .llm()
            .generate_choice_response(&prompt, label, engine.llm_cancel_token().await)
            .await
            .unwrap_or_else(|_| label.to_string());
        (generated, true)
    } else {
        (label.to_string(), false)
    };

    let suppress_llm = choice.player_response.is_some() && choice.player_response_suppress_llm;
    engine.append_chat_message(content.clone(), MessageSender::Player).await;
    engine
        .broadcast_gated(BroadcastEvent::PlayerMessage {
            content: content.clone(),
            suppress_llm,
            flow_id: Some(flow_id.to_string()),
            node_id: Some(node_id.to_string()),
            context: None,
        })
        .await;
    engine
        .broadcast_gated(BroadcastEvent::ChatMessage {
            id: uuid::Uuid::new_v4().to_string(),
            content,
            sender: "player".into(),
            timestamp: Utc::now(),
            generated,
            from_choice: true,
        })
        .await;
}

// ---- input -----------------------------------------------------------

async fn exec_input(
    engine: &Engine,
    flow_id: &FlowId,
    node_id: &NodeId,
    cfg: &crate::model::flow::InputConfig,
) -> NodeOutcome {
    engine.with_state(|s| s.pending.register_input(flow_id.clone(), node_id.clone())).await;
    engine
        .broadcast_gated(BroadcastEvent::InputRequest {
            node_id: node_id.to_string(),
            prompt: cfg.prompt.clone(),
            input_type: format!("{:?}", cfg.input_type).to_lowercase(),
            min_value: cfg.min_value,
            max_value: cfg.max_value,
            variable_name: cfg.variable_name.clone(),
            required: cfg.required,
        })
        .await;
    NodeOutcome::Wait
}

pub async fn resolve_input(engine: &Engine, flow_id: &FlowId, node_id: &NodeId, value: Value) {
    let node = engine
        .with_state(|s| {
            s.flows
                .active
                .get(flow_id)
                .and_then(|a| a.flow.nodes.get(node_id))
                .cloned()
        })
        .await;
    let Some(node) = node else { return };
    if let NodeType::Input(cfg) = &node.kind {
        engine
            .with_state(|s| {
                s.session.flow_variables.insert(cfg.variable_name.clone(), value);
            })
            .await;
    }
}

// ---- random_number --------------------------------------------------

async fn exec_random_number(engine: &Engine, cfg: &crate::model::flow::RandomNumberConfig) -> NodeOutcome {
    let value = {
        let mut rng = StdRng::from_entropy();
        if cfg.max >= cfg.min {
            rng.gen_range(cfg.min..=cfg.max)
        } else {
            cfg.min
        }
    };
    engine
        .with_state(|s| {
            s.session
                .flow_variables
                .insert(cfg.variable_name.clone(), Value::from(value));
        })
        .await;
    NodeOutcome::Next(vec![None])
}

// ---- capacity messages ------------------------------------------------

async fn exec_capacity_message(
    engine: &Engine,
    flow_id: &FlowId,
    node_id: &NodeId,
    cfg: &crate::model::flow::CapacityMessageConfig,
    as_ai: bool,
) -> NodeOutcome {
    let session = engine.session_snapshot().await;
    match cfg.matching(session.capacity) {
        Some(range) => {
            let content = substitute(&range.message.text, &session, &SubstitutionExtras::default());
            let context = Some(serde_json::json!({"is_capacity_message": true}));
            if as_ai {
                engine
                    .broadcast_gated(BroadcastEvent::AiMessage {
                        content,
                        suppress_llm: range.message.suppress_llm,
                        flow_id: Some(flow_id.to_string()),
                        node_id: Some(node_id.to_string()),
                        context,
                    })
                    .await;
            } else {
                engine
                    .broadcast_gated(BroadcastEvent::PlayerMessage {
                        content,
                        suppress_llm: range.message.suppress_llm,
                        flow_id: Some(flow_id.to_string()),
                        node_id: Some(node_id.to_string()),
                        context,
                    })
                    .await;
            }
            NodeOutcome::Next(vec![Some(range.id.clone())])
        }
        None => NodeOutcome::Next(vec![Some(handles::GLOBAL.to_string())]),
    }
}

// ---- pause_resume ------------------------------------------------------

async fn exec_pause_resume(
    engine: &Engine,
    flow_id: &FlowId,
    node_id: &NodeId,
    cfg: &PauseResumeConfig,
    inherited_priority: Option<i32>,
    inherited_notify: bool,
) -> NodeOutcome {
    super::follow_edges(
        engine,
        flow_id,
        node_id,
        &[Some(handles::SOURCE_PAUSE.to_string())],
        true,
        inherited_priority,
        inherited_notify,
    )
    .await;

    engine
        .with_state(|s| {
            s.pending
                .register_pause_resume(flow_id.clone(), node_id.clone(), cfg.resume_after_messages);
        })
        .await;

    NodeOutcome::Wait
}

// ---- challenge -----------------------------------------------------------

async fn exec_challenge(
    engine: &Engine,
    flow_id: &FlowId,
    node_id: &NodeId,
    cfg: &crate::model::flow::ChallengeConfig,
) -> NodeOutcome {
    let possible_outcomes: Vec<String> = engine
        .with_state(|s| {
            s.flows
                .active
                .get(flow_id)
                .map(|a| {
                    a.flow
                        .edges
                        .iter()
                        .filter(|e| &e.source == node_id)
                        .filter_map(|e| e.handle.clone())
                        .collect()
                })
                .unwrap_or_default()
        })
        .await;

    if let Some(pre) = &cfg.pre_message {
        let session = engine.session_snapshot().await;
        let content = substitute(&pre.text, &session, &SubstitutionExtras::default());
        engine
            .broadcast_gated(BroadcastEvent::AiMessage {
                content,
                suppress_llm: pre.suppress_llm,
                flow_id: Some(flow_id.to_string()),
                node_id: Some(node_id.to_string()),
                context: Some(serde_json::json!({
                    "is_challenge_pre_message": true,
                    "possible_outcomes": possible_outcomes,
                })),
            })
            .await;
    }

    engine
        .with_state(|s| {
            s.pending
                .register_challenge(flow_id.clone(), node_id.clone(), cfg.challenge_type);
        })
        .await;

    engine
        .broadcast_gated(BroadcastEvent::Challenge {
            node_id: node_id.to_string(),
            challenge_type: format!("{:?}", cfg.challenge_type).to_lowercase(),
            config: cfg.params.clone(),
        })
        .await;

    NodeOutcome::Wait
}

/// Resumption path for challenge results (spec §4.3 challenge / §4.4 item 5):
/// stores outcome variables, optionally broadcasts a caller-supplied result
/// message, then the engine continues via the edge matching `outcome_id`.
pub async fn resolve_challenge_result(engine: &Engine, flow_id: &FlowId, node_id: &NodeId, outcome_id: &str, details: &Value) {
    let segment = details.get("segment").and_then(|v| v.as_str()).map(str::to_string);
    let segments = details.get("segments").and_then(|v| v.as_str()).map(str::to_string);
    let roll = details.get("roll").and_then(|v| v.as_str()).map(str::to_string);
    let slots = details.get("slots").and_then(|v| v.as_str()).map(str::to_string);

    engine
        .with_state(|s| {
            s.session
                .flow_variables
                .insert("lastChallengeResult".into(), Value::String(outcome_id.to_string()));
            if let Some(v) = &segment {
                s.session.flow_variables.insert("lastSegment".into(), Value::String(v.clone()));
            }
            if let Some(v) = &segments {
                s.session.flow_variables.insert("lastSegments".into(), Value::String(v.clone()));
            }
            if let Some(v) = &roll {
                s.session.flow_variables.insert("lastRoll".into(), Value::String(v.clone()));
            }
            if let Some(v) = &slots {
                s.session.flow_variables.insert("lastSlots".into(), Value::String(v.clone()));
            }
        })
        .await;

    if let Some(message) = details.get("message").and_then(|v| v.as_str()) {
        let session = engine.session_snapshot().await;
        let extras = SubstitutionExtras {
            segment: segment.as_deref(),
            segments: segments.as_deref(),
            roll: roll.as_deref(),
            slots: slots.as_deref(),
            ..Default::default()
        };
        let content = substitute(message, &session, &extras);
        let suppress_llm = details.get("suppressLlm").and_then(|v| v.as_bool()).unwrap_or(false);
        engine
            .broadcast_gated(BroadcastEvent::AiMessage {
                content,
                suppress_llm,
                flow_id: Some(flow_id.to_string()),
                node_id: Some(node_id.to_string()),
                context: None,
            })
            .await;
    }
}
