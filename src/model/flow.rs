//! The authored flow graph: `Flow`, `Node`, `NodeType`, `Edge`.
//!
//! Replaces the source's string-keyed `node.type` dispatch with a closed,
//! tagged variant — each node carries exactly the configuration its type
//! needs, and the interpreter becomes a match over the discriminant instead
//! of a dynamic lookup.

use crate::types::{FlowId, NodeId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// A directed graph of typed nodes authored in the UI.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Flow {
    pub id: FlowId,
    pub name: String,
    pub nodes: HashMap<NodeId, Node>,
    pub edges: Vec<Edge>,
}

impl Flow {
    /// Validates every edge's endpoints exist (spec §4.1: surfaced but does
    /// not poison other flows — callers decide what "surfaced" means).
    pub fn validate(&self) -> Result<(), crate::types::Error> {
        for edge in &self.edges {
            if !self.nodes.contains_key(&edge.source) {
                return Err(crate::types::Error::config(format!(
                    "flow {}: edge references missing source node {}",
                    self.id, edge.source
                )));
            }
            if !self.nodes.contains_key(&edge.target) {
                return Err(crate::types::Error::config(format!(
                    "flow {}: edge references missing target node {}",
                    self.id, edge.target
                )));
            }
        }
        Ok(())
    }

    pub fn outgoing(&self, node: &NodeId, handle: Option<&str>) -> Vec<&Edge> {
        self.edges
            .iter()
            .filter(|e| &e.source == node)
            .filter(|e| match handle {
                Some(h) => e.handle.as_deref() == Some(h),
                None => e.handle.is_none(),
            })
            .collect()
    }

    pub fn triggers(&self) -> impl Iterator<Item = (&NodeId, &TriggerConfig)> {
        self.nodes.iter().filter_map(|(id, n)| match &n.kind {
            NodeType::Trigger(cfg) => Some((id, cfg)),
            _ => None,
        })
    }
}

/// One node within a flow: identity plus closed type-tagged configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub kind: NodeType,
}

/// An edge between two nodes, optionally tagged with a routing handle.
/// Handle values are authored strings: `true-N`, `false`, `branch-N`,
/// `immediate`, `completion`, `source-pause`, `source-resume`, a capacity
/// range id, or an arbitrary choice/challenge outcome id (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Edge {
    pub source: NodeId,
    pub target: NodeId,
    pub handle: Option<String>,
}

pub mod handles {
    pub const FALSE: &str = "false";
    pub const IMMEDIATE: &str = "immediate";
    pub const COMPLETION: &str = "completion";
    pub const SOURCE_PAUSE: &str = "source-pause";
    pub const SOURCE_RESUME: &str = "source-resume";
    pub const GLOBAL: &str = "global";

    pub fn true_n(n: u32) -> String {
        format!("true-{n}")
    }

    pub fn branch_n(n: u32) -> String {
        format!("branch-{n}")
    }
}

/// Closed set of node behaviors (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "node_type", rename_all = "snake_case")]
pub enum NodeType {
    Trigger(TriggerConfig),
    ButtonPress(ButtonPressConfig),
    Action(ActionConfig),
    Condition(ConditionConfig),
    Branch(BranchConfig),
    Delay(DelayConfig),
    PlayerChoice(PlayerChoiceConfig),
    SimpleAb(SimpleAbConfig),
    Input(InputConfig),
    RandomNumber(RandomNumberConfig),
    CapacityAiMessage(CapacityMessageConfig),
    CapacityPlayerMessage(CapacityMessageConfig),
    PauseResume(PauseResumeConfig),
    Challenge(ChallengeConfig),
}

impl NodeType {
    /// Whether this node type defaults to firing at most once per flow
    /// lifetime (spec §4.1 point 3: trigger nodes default TRUE, others FALSE).
    pub fn default_fire_only_once(&self) -> bool {
        matches!(self, NodeType::Trigger(_))
    }
}

/// A scalar that may be a literal or a `[Flow:name]` lookup, used anywhere
/// authors can parametrize a node with a flow variable (pulse counts, delay
/// durations, cycle counts).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum VarOrNumber {
    Literal(f64),
    FlowVar(String),
}

impl VarOrNumber {
    /// Resolves a literal or `[Flow:name]` lookup against the current
    /// session's flow-variable map. Missing/non-numeric flow variables
    /// resolve to 0.0 rather than failing the chain (spec §4.3: pulse
    /// counts, cycle counts, and delay durations are all best-effort
    /// numeric parses of author-supplied config).
    pub fn resolve(&self, session: &crate::model::SessionState) -> f64 {
        match self {
            VarOrNumber::Literal(v) => *v,
            VarOrNumber::FlowVar(name) => session
                .flow_variables
                .get(name)
                .and_then(|v| v.as_f64().or_else(|| v.as_str().and_then(|s| s.parse().ok())))
                .unwrap_or(0.0),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    DeviceOn,
    DeviceOff,
    PlayerSpeaks,
    AiSpeaks,
    Random,
    Idle,
    NewSession,
    PlayerStateChange,
    ButtonPress,
    /// Pseudo-type: matches only when `message_count == 1`.
    FirstMessage,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateComparison {
    Meet(f64),
    MeetOrExceed(f64),
    Greater(f64),
    Less(f64),
    LessOrEqual(f64),
    Range(f64, f64),
    NotEqual(f64),
}

impl StateComparison {
    pub fn holds(&self, value: f64) -> bool {
        match *self {
            StateComparison::Meet(t) => (value - t).abs() < f64::EPSILON,
            StateComparison::MeetOrExceed(t) => value >= t,
            StateComparison::Greater(t) => value > t,
            StateComparison::Less(t) => value < t,
            StateComparison::LessOrEqual(t) => value <= t,
            StateComparison::Range(lo, hi) => value >= lo && value <= hi,
            StateComparison::NotEqual(t) => (value - t).abs() >= f64::EPSILON,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerConfig {
    pub event_type: EventType,
    /// Device alias/name/ip/`ip:childId` filter; `None` matches any device.
    #[serde(default)]
    pub device_ref: Option<String>,
    /// Keyword/wildcard/alternation patterns (spec §4.9); empty = always matches.
    #[serde(default)]
    pub keywords: Vec<String>,
    /// Messages-since-last-fire required before refiring. `None` uses
    /// `EngineDefaults::default_trigger_cooldown`.
    #[serde(default)]
    pub cooldown: Option<u32>,
    /// `random` event type: probability in `[0, 100)`.
    #[serde(default)]
    pub probability: Option<f64>,
    /// `idle` event type: override of `EngineDefaults::default_idle_threshold`.
    #[serde(default, with = "humantime_serde::option")]
    pub idle_threshold: Option<Duration>,
    /// `player_state_change`: which session field to watch.
    #[serde(default)]
    pub state_type: Option<StateField>,
    #[serde(default)]
    pub state_comparison: Option<StateComparison>,
    #[serde(default = "default_true")]
    pub fire_only_once: bool,
    #[serde(default)]
    pub unblockable: bool,
    #[serde(default)]
    pub trigger_priority: Option<i32>,
    #[serde(default)]
    pub flow_priority: u8,
    #[serde(default)]
    pub notify: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StateField {
    Capacity,
    Pain,
    Emotion,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ButtonPressConfig {
    pub button_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageSpec {
    pub text: String,
    #[serde(default)]
    pub suppress_llm: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "until_type", rename_all = "snake_case")]
pub enum UntilSpec {
    Capacity(StateComparison),
    Pain(StateComparison),
    Emotion(String),
    Timer(#[serde(with = "humantime_serde")] Duration),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action_type", rename_all = "snake_case")]
pub enum ActionConfig {
    SendMessage(MessageSpec),
    SendPlayerMessage(MessageSpec),
    SystemMessage { text: String },
    DeviceOn {
        device_ref: String,
        #[serde(default)]
        until: Option<UntilSpec>,
        #[serde(default)]
        allow_over_inflation: bool,
    },
    DeviceOff {
        device_ref: String,
    },
    StartCycle {
        device_ref: String,
        duration_secs: VarOrNumber,
        interval_secs: VarOrNumber,
        /// 0 means infinite (runs until `stop_cycle`).
        cycles: u32,
        #[serde(default)]
        until: Option<UntilSpec>,
    },
    StopCycle {
        device_ref: String,
    },
    PulsePump {
        device_ref: String,
        pulses: VarOrNumber,
    },
    DeclareVariable {
        name: String,
        value: serde_json::Value,
    },
    SetVariable {
        target: StateField,
        value: VarOrNumber,
    },
    ToggleReminder {
        reminder_id: String,
        #[serde(default)]
        is_global: bool,
    },
    ToggleButton {
        button_id: String,
    },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    Eq,
    Ne,
    Gt,
    Lt,
    Gte,
    Lte,
    Range,
    Contains,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ConditionVariable {
    Capacity,
    Pain,
    Emotion,
    FlowVar(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubCondition {
    pub variable: ConditionVariable,
    pub operator: ConditionOperator,
    pub value: serde_json::Value,
    #[serde(default)]
    pub value2: Option<serde_json::Value>,
}

/// A clause is an AND of sub-conditions; `Condition` returns the index of
/// the first clause whose sub-conditions all hold (spec §4.3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConditionConfig {
    pub clauses: Vec<Vec<SubCondition>>,
    #[serde(default)]
    pub once_only: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "branch_type", rename_all = "snake_case")]
pub enum BranchConfig {
    Sequential,
    Random { weights: Vec<f64> },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TimeUnit {
    Seconds,
    Minutes,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelayConfig {
    pub duration: VarOrNumber,
    pub unit: TimeUnit,
}

impl DelayConfig {
    pub fn as_duration(&self, resolved: f64) -> Duration {
        let secs = match self.unit {
            TimeUnit::Seconds => resolved,
            TimeUnit::Minutes => resolved * 60.0,
        };
        Duration::from_secs_f64(secs.max(0.0))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChoiceOption {
    pub id: String,
    pub label: String,
    #[serde(default)]
    pub player_response: Option<String>,
    #[serde(default)]
    pub player_response_suppress_llm: bool,
    #[serde(default)]
    pub llm_enhance: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerChoiceConfig {
    #[serde(default)]
    pub intro_message: Option<MessageSpec>,
    #[serde(default)]
    pub ai_prompt: Option<String>,
    pub choices: Vec<ChoiceOption>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimpleAbConfig {
    pub label_a: String,
    pub description_a: String,
    pub label_b: String,
    pub description_b: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum InputType {
    Text,
    Number,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputConfig {
    pub variable_name: String,
    pub input_type: InputType,
    #[serde(default)]
    pub min_value: Option<f64>,
    #[serde(default)]
    pub max_value: Option<f64>,
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub required: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RandomNumberConfig {
    pub min: i64,
    pub max: i64,
    pub variable_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapacityRangeEntry {
    pub id: String,
    pub min: u8,
    /// `None` means unbounded above (the `>100` bucket).
    pub max: Option<u8>,
    pub message: MessageSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapacityMessageConfig {
    pub ranges: Vec<CapacityRangeEntry>,
}

impl CapacityMessageConfig {
    pub fn matching(&self, capacity: u8) -> Option<&CapacityRangeEntry> {
        self.ranges.iter().find(|r| {
            capacity >= r.min && r.max.map(|max| capacity <= max).unwrap_or(true)
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PauseResumeConfig {
    pub resume_after_messages: u32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChallengeType {
    PrizeWheel,
    DiceRoll,
    CoinFlip,
    Rps,
    TimerChallenge,
    NumberGuess,
    SlotMachine,
    CardDraw,
    SimonChallenge,
    ReflexChallenge,
}

/// Challenge-type-specific parameters (segment labels, die sides, target
/// number, reel symbols, …) are kept as an open JSON value: the engine does
/// not validate their shape, only forwards them to the broadcast consumer
/// and matches the returned `outcome_id` against an outgoing edge handle
/// (spec §9 "Challenge outcome taxonomy").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChallengeConfig {
    pub challenge_type: ChallengeType,
    #[serde(default)]
    pub pre_message: Option<MessageSpec>,
    #[serde(default)]
    pub params: serde_json::Value,
}
