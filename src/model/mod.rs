//! The flow data model: graph shape (`flow`) and runtime session state
//! (`variables`).

pub mod flow;
pub mod variables;

pub use flow::{Edge, Flow, Node, NodeType};
pub use variables::{SessionState, SubstitutionExtras};

use crate::types::{FlowId, NodeId};
use std::collections::{HashMap, HashSet};

/// Priority tier for an activated flow (spec §3: "0=global, 1=character,
/// 2=persona; lower wins").
pub type FlowPriorityTier = u8;

#[derive(Debug, Clone)]
pub struct ActiveFlow {
    pub flow: Flow,
    pub priority_tier: FlowPriorityTier,
}

/// Per-active-flow bookkeeping of "once" nodes/conditions (spec §3).
#[derive(Debug, Clone, Default)]
pub struct FlowState {
    pub executed_once_nodes: HashSet<NodeId>,
    pub executed_once_conditions: HashSet<(NodeId, usize)>,
}

impl FlowState {
    pub fn clear_once_bookkeeping(&mut self) {
        self.executed_once_nodes.clear();
        self.executed_once_conditions.clear();
    }
}

/// All active flows and their per-flow state, keyed by `FlowId`.
#[derive(Debug, Default)]
pub struct FlowRegistry {
    pub active: HashMap<FlowId, ActiveFlow>,
    pub states: HashMap<FlowId, FlowState>,
}

impl FlowRegistry {
    pub fn activate(&mut self, flow: Flow, priority_tier: FlowPriorityTier) {
        let id = flow.id.clone();
        self.active.insert(id.clone(), ActiveFlow { flow, priority_tier });
        self.states.entry(id).or_default();
    }

    pub fn deactivate(&mut self, id: &FlowId) {
        self.active.remove(id);
        self.states.remove(id);
    }

    pub fn deactivate_all(&mut self) {
        self.active.clear();
        self.states.clear();
    }
}
