//! Abort-epoch cancellation and execution-depth/active-execution tracking
//! (spec §5).
//!
//! Grounded on the teacher's `ResourceTracker` (`src/kernel/resources.rs`):
//! a plain struct owned by the engine and mutated via `&mut self`, not a
//! separate actor. The abort-epoch idiom itself has no teacher analog (the
//! teacher cancels via `tokio_util::sync::CancellationToken` per process);
//! epochs are used here instead because a `CancellationToken` is consumed
//! once fired, while pending-ops need a cancellation signal that can be
//! observed, then implicitly "reset" for the next chain (spec §9
//! "Abort-by-epoch").

use crate::types::{FlowId, NodeId};
use std::collections::HashMap;

/// Monotone cancellation signal plus per-flow depth and active-execution
/// bookkeeping. Owned by `Engine`, mutated only while its mutex is held.
#[derive(Debug, Default)]
pub struct Concurrency {
    epoch: u64,
    aborted: bool,
    depths: HashMap<FlowId, u32>,
    active: HashMap<FlowId, ActiveExecution>,
}

/// Describes a currently-executing flow for UI status reporting and
/// preemption decisions (spec GLOSSARY "Active execution").
#[derive(Debug, Clone, serde::Serialize)]
pub struct ActiveExecution {
    pub flow_id: FlowId,
    pub entry_node: NodeId,
    pub trigger_priority: Option<i32>,
    pub notify: bool,
    pub total_steps: Option<u32>,
    pub current_step: u32,
}

impl Concurrency {
    /// Current cancellation epoch; callers snapshot this before a
    /// suspension point and compare after it returns (spec §5).
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted
    }

    /// Bumps the epoch and sets `aborted`. Callers clear pending-op maps,
    /// device monitors, and timers alongside this (spec §4.1 point 7,
    /// §5 `emergencyStop`) — this type only owns the epoch/depth/active
    /// bookkeeping, not the other registries.
    pub fn preempt(&mut self) {
        self.epoch = self.epoch.wrapping_add(1);
        self.aborted = true;
    }

    /// `aborted` auto-resets on the next scheduler tick so new chains can
    /// start (spec §5). Call once per inbound event after preemption has
    /// had a chance to take effect.
    pub fn reset_aborted(&mut self) {
        self.aborted = false;
    }

    /// True if `snapshot` no longer matches the live epoch — the abort
    /// re-check every suspension point performs (spec §4.2).
    pub fn epoch_changed(&self, snapshot: u64) -> bool {
        snapshot != self.epoch
    }

    pub fn enter(&mut self, flow_id: &FlowId) -> u32 {
        let depth = self.depths.entry(flow_id.clone()).or_insert(0);
        *depth += 1;
        *depth
    }

    pub fn leave(&mut self, flow_id: &FlowId) -> u32 {
        match self.depths.get_mut(flow_id) {
            Some(depth) => {
                *depth = depth.saturating_sub(1);
                let remaining = *depth;
                if remaining == 0 {
                    self.depths.remove(flow_id);
                }
                remaining
            }
            None => 0,
        }
    }

    pub fn depth(&self, flow_id: &FlowId) -> u32 {
        self.depths.get(flow_id).copied().unwrap_or(0)
    }

    pub fn register_active(&mut self, exec: ActiveExecution) {
        self.active.insert(exec.flow_id.clone(), exec);
    }

    pub fn unregister_active(&mut self, flow_id: &FlowId) {
        self.active.remove(flow_id);
    }

    pub fn active_execution(&self, flow_id: &FlowId) -> Option<&ActiveExecution> {
        self.active.get(flow_id)
    }

    pub fn running_priority(&self, flow_id: &FlowId) -> Option<i32> {
        self.active.get(flow_id).and_then(|e| e.trigger_priority)
    }

    /// The system-wide `runningFlowPriority` (spec §3 invariant 5): the
    /// priority of whatever currently-executing flow was entered through a
    /// `hasPriority` trigger, regardless of which flow a new candidate
    /// belongs to. Preemption is a global decision, not a per-flow one —
    /// the protocol guarantees at most one such flow is ever running at a
    /// time, since a lower-priority challenger would already have been
    /// preempted or dropped.
    pub fn running_flow_priority(&self) -> Option<i32> {
        self.active.values().filter_map(|e| e.trigger_priority).min()
    }

    pub fn all_active(&self) -> impl Iterator<Item = &ActiveExecution> {
        self.active.values()
    }

    /// Snapshot used by `emergency_stop`/`deactivate_all` (spec §5): clears
    /// depth and active-execution bookkeeping without touching the epoch
    /// (callers bump the epoch separately via `preempt`).
    pub fn clear_all(&mut self) {
        self.depths.clear();
        self.active.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preempt_bumps_epoch_and_sets_aborted() {
        let mut c = Concurrency::default();
        let snap = c.epoch();
        c.preempt();
        assert!(c.epoch_changed(snap));
        assert!(c.is_aborted());
        c.reset_aborted();
        assert!(!c.is_aborted());
    }

    #[test]
    fn depth_tracks_enter_leave_per_flow() {
        let mut c = Concurrency::default();
        let flow = FlowId::new();
        assert_eq!(c.enter(&flow), 1);
        assert_eq!(c.enter(&flow), 2);
        assert_eq!(c.leave(&flow), 1);
        assert_eq!(c.leave(&flow), 0);
        assert_eq!(c.depth(&flow), 0);
    }

    #[test]
    fn running_flow_priority_is_global_not_per_flow() {
        let mut c = Concurrency::default();
        let flow_a = FlowId::new();
        c.register_active(ActiveExecution {
            flow_id: flow_a.clone(),
            entry_node: NodeId::new(),
            trigger_priority: Some(5),
            notify: false,
            total_steps: None,
            current_step: 0,
        });
        // A brand-new candidate flow that hasn't started yet still sees
        // flow_a's priority as the system-wide running priority.
        assert_eq!(c.running_flow_priority(), Some(5));
        assert_eq!(c.running_priority(&FlowId::new()), None);
    }

    #[test]
    fn active_execution_roundtrips() {
        let mut c = Concurrency::default();
        let flow = FlowId::new();
        c.register_active(ActiveExecution {
            flow_id: flow.clone(),
            entry_node: NodeId::new(),
            trigger_priority: Some(3),
            notify: true,
            total_steps: None,
            current_step: 0,
        });
        assert_eq!(c.running_priority(&flow), Some(3));
        c.unregister_active(&flow);
        assert!(c.active_execution(&flow).is_none());
    }
}
