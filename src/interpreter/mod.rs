//! The node interpreter — depth-first graph walk from a chosen start node
//! (spec §4.2, THE CORE alongside the dispatcher).
//!
//! Grounded on the teacher's `Orchestrator`
//! (`src/kernel/orchestrator.rs`)'s `Instruction`/`RoutingRule` "what
//! happens next" model, generalized from a flat pipeline-stage list to a
//! graph with edge handles. Abort-epoch re-checks are modeled after the
//! cooperative-cancellation posture the teacher's `recovery.rs` implies
//! (catch panics, keep going) combined with `tokio_util::sync::
//! CancellationToken`, a dependency the teacher already carries for
//! `ipc/server.rs`'s accept loop.

pub mod nodes;

use crate::broadcast::{BroadcastEvent, ToastEvent};
use crate::concurrency::ActiveExecution;
use crate::engine::Engine;
use crate::model::flow::{Flow, Node, NodeType};
use crate::types::{FlowId, NodeId};
use std::collections::{HashSet, VecDeque};

pub use nodes::NodeOutcome;

/// Starts a brand-new chain from a winning trigger (spec §4.1/§4.2).
pub async fn start_chain(
    engine: &Engine,
    flow_id: FlowId,
    node_id: NodeId,
    trigger_priority: Option<i32>,
    notify: bool,
) {
    execute_from_node(engine, flow_id, node_id, None, false, trigger_priority, notify).await;
}

/// Resumes a chain from a pending-op's completion/response (spec §4.4):
/// always re-enters with `skip_triggers=true` so the walk can't
/// accidentally re-trigger an entry node mid-graph.
pub async fn resume_chain(
    engine: &Engine,
    flow_id: FlowId,
    node_id: NodeId,
    from_handle: Option<String>,
    trigger_priority: Option<i32>,
    notify: bool,
) {
    let Some(handle) = from_handle else {
        return;
    };
    follow_edges(
        engine,
        &flow_id,
        &node_id,
        &[Some(handle)],
        true,
        trigger_priority,
        notify,
    )
    .await;
}

/// Walks the subgraph reachable from `node_id` (spec §4.2's seven-step
/// algorithm). Boxed because the walk recurses across `.await` points.
pub fn execute_from_node<'a>(
    engine: &'a Engine,
    flow_id: FlowId,
    node_id: NodeId,
    from_handle: Option<String>,
    skip_triggers: bool,
    inherited_priority: Option<i32>,
    inherited_notify: bool,
) -> futures::future::BoxFuture<'a, ()> {
    use futures::FutureExt;
    async move {
        let _ = &from_handle; // consumed via the wait/edge-handle argument of the caller
        // Step 1: abort check.
        if engine.is_aborted().await {
            return;
        }

        let Some(node) = engine
            .with_state(|s| {
                s.flows
                    .active
                    .get(&flow_id)
                    .and_then(|a| a.flow.nodes.get(&node_id))
                    .cloned()
            })
            .await
        else {
            tracing::warn!(flow = %flow_id, node = %node_id, "flow_config_error_missing_node");
            return;
        };

        // Step 2: re-entry guard for trigger nodes during graph traversal.
        if skip_triggers && matches!(node.kind, NodeType::Trigger(_) | NodeType::ButtonPress(_)) {
            return;
        }

        // Step 3: depth bookkeeping + entry registration + depth-cap safety
        // net (spec §9 "should impose a per-event depth cap").
        let max_depth = engine.defaults().max_chain_depth;
        let depth = engine.with_state(|s| s.concurrency.enter(&flow_id)).await;
        if depth > max_depth {
            tracing::error!(flow = %flow_id, node = %node_id, depth, "depth_cap_exceeded");
            engine
                .broadcast_gated(BroadcastEvent::Error {
                    message: "chain aborted: depth cap exceeded".into(),
                    error: None,
                    context: Some(serde_json::json!({"context": "depth_cap_exceeded"})),
                })
                .await;
            engine.with_state(|s| s.concurrency.leave(&flow_id)).await;
            return;
        }

        let is_entry = depth == 1 && matches!(node.kind, NodeType::Trigger(_) | NodeType::ButtonPress(_));
        if is_entry {
            let flow_name = engine.flow_name(&flow_id).await;
            let total_steps = engine
                .with_state(|s| {
                    s.flows
                        .active
                        .get(&flow_id)
                        .map(|a| count_reachable(&a.flow, &node_id))
                })
                .await;
            engine
                .with_state(|s| {
                    s.concurrency.register_active(ActiveExecution {
                        flow_id: flow_id.clone(),
                        entry_node: node_id.clone(),
                        trigger_priority: inherited_priority,
                        notify: inherited_notify,
                        total_steps,
                        current_step: 0,
                    });
                })
                .await;
            if inherited_notify {
                engine
                    .broadcast_gated(BroadcastEvent::FlowToast {
                        event: ToastEvent::Start,
                        message: format!("{flow_name} started"),
                        flow_name,
                        current_step: Some(0),
                        total_steps,
                        priority: inherited_priority,
                    })
                    .await;
            }
        }

        // Step 4: "once" bookkeeping for trigger entry nodes (fireOnlyOnce
        // is also checked by the dispatcher before selection; this is the
        // durable record of it having fired).
        if node.kind.default_fire_only_once() {
            engine
                .with_state(|s| {
                    if let Some(state) = s.flows.states.get_mut(&flow_id) {
                        state.executed_once_nodes.insert(node_id.clone());
                    }
                })
                .await;
        }

        // Step 5/6: dispatch the node, then route along its outgoing edges.
        let outcome = nodes::execute(engine, &flow_id, &node_id, &node, inherited_priority, inherited_notify).await;
        match outcome {
            NodeOutcome::Aborted | NodeOutcome::Failed => {
                finish_step(engine, &flow_id, &node_id, inherited_priority, inherited_notify).await;
            }
            NodeOutcome::Wait => {
                // Depth drains; pending-op bookkeeping keeps the
                // active-execution entry alive until resumption.
                leave_depth_only(engine, &flow_id).await;
            }
            NodeOutcome::Next(candidates) => {
                follow_edges(
                    engine,
                    &flow_id,
                    &node_id,
                    &candidates,
                    true,
                    inherited_priority,
                    inherited_notify,
                )
                .await;
                finish_step(engine, &flow_id, &node_id, inherited_priority, inherited_notify).await;
            }
        }
    }
    .boxed()
}

/// Resolves the first candidate handle with any matching outgoing edges
/// and recurses into each target (spec §4.2 step 7). Candidates are tried
/// in order so capacity-message nodes can fall back to the `global`
/// handle.
pub(crate) async fn follow_edges(
    engine: &Engine,
    flow_id: &FlowId,
    node_id: &NodeId,
    candidates: &[Option<String>],
    skip_triggers: bool,
    inherited_priority: Option<i32>,
    inherited_notify: bool,
) {
    let edges: Vec<(NodeId, Option<String>)> = engine
        .with_state(|s| {
            let Some(active) = s.flows.active.get(flow_id) else {
                return Vec::new();
            };
            for candidate in candidates {
                let matches = active.flow.outgoing(node_id, candidate.as_deref());
                if !matches.is_empty() {
                    return matches.into_iter().map(|e| (e.target.clone(), e.handle.clone())).collect();
                }
            }
            Vec::new()
        })
        .await;

    for (target, _handle) in edges {
        if engine.is_aborted().await {
            return;
        }
        execute_from_node(
            engine,
            flow_id.clone(),
            target,
            None,
            skip_triggers,
            inherited_priority,
            inherited_notify,
        )
        .await;
    }
}

/// Drains this node's depth contribution and, if the flow has fully
/// unwound (depth 0, no pending ops), closes out its active-execution
/// entry (spec §4.2 step 8).
async fn finish_step(
    engine: &Engine,
    flow_id: &FlowId,
    _node_id: &NodeId,
    _inherited_priority: Option<i32>,
    inherited_notify: bool,
) {
    let closed = engine
        .with_state(|s| {
            let remaining = s.concurrency.leave(flow_id);
            if remaining == 0 && !s.pending.has_any_for_flow(flow_id) {
                s.concurrency.unregister_active(flow_id);
                true
            } else {
                false
            }
        })
        .await;
    if closed && inherited_notify {
        let flow_name = engine.flow_name(flow_id).await;
        engine
            .broadcast_gated(BroadcastEvent::FlowToast {
                event: ToastEvent::Complete,
                message: format!("{flow_name} finished"),
                flow_name,
                current_step: None,
                total_steps: None,
                priority: None,
            })
            .await;
    }
}

async fn leave_depth_only(engine: &Engine, flow_id: &FlowId) {
    engine.with_state(|s| s.concurrency.leave(flow_id)).await;
}

/// Counts nodes reachable by BFS from `start`, used for `flow_toast`
/// progress reporting (spec §10.5 `ActiveExecutionSnapshot`).
fn count_reachable(flow: &Flow, start: &NodeId) -> u32 {
    let mut seen: HashSet<NodeId> = HashSet::new();
    let mut queue = VecDeque::new();
    queue.push_back(start.clone());
    seen.insert(start.clone());
    let mut count = 0u32;
    while let Some(current) = queue.pop_front() {
        count += 1;
        for edge in flow.edges.iter().filter(|e| &e.source == &current) {
            if seen.insert(edge.target.clone()) {
                queue.push_back(edge.target.clone());
            }
        }
    }
    count
}

/// Needed by `nodes` for node lookups without re-threading `Node` through
/// every helper signature.
pub(crate) fn node_lookup<'a>(flow: &'a Flow, node_id: &NodeId) -> Option<&'a Node> {
    flow.nodes.get(node_id)
}
