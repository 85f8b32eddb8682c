//! Dispatcher throughput benchmark.
//!
//! Measures `dispatcher::dispatch`'s cost as the number of active flows
//! (and therefore candidate triggers scanned per event) grows — the hot
//! path every inbound event runs through before a chain is ever spawned.
//! Grounded on the teacher's `benches/ipc_throughput.rs` (Criterion,
//! `BenchmarkId::from_parameter` swept over an input-size axis).

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use flow_kernel::dispatcher::{self, CooldownTracker, InboundEvent};
use flow_kernel::model::flow::{Edge, EventType, Flow, Node, NodeType, TriggerConfig};
use flow_kernel::model::{ActiveFlow, FlowRegistry, FlowState, SessionState};
use flow_kernel::types::{EngineDefaults, FlowId, NodeId};
use std::collections::HashMap;

fn trigger_config(keyword: Option<&str>) -> TriggerConfig {
    TriggerConfig {
        event_type: EventType::PlayerSpeaks,
        device_ref: None,
        keywords: keyword.map(|k| vec![k.to_string()]).unwrap_or_default(),
        cooldown: Some(0),
        probability: None,
        idle_threshold: None,
        state_type: None,
        state_comparison: None,
        fire_only_once: false,
        unblockable: false,
        trigger_priority: Some(10),
        flow_priority: 0,
        notify: false,
    }
}

/// Builds a registry of `n` single-trigger flows, each keyed on a
/// distinct keyword so none of them match the benchmark's probe event
/// except the last — the worst case for "scan everything, match nothing".
fn registry_with_flows(n: usize) -> FlowRegistry {
    let mut registry = FlowRegistry::default();
    for i in 0..n {
        let flow_id = FlowId::new();
        let node_id = NodeId::new();
        let keyword = format!("keyword-{i}");
        let mut nodes = HashMap::new();
        nodes.insert(
            node_id.clone(),
            Node {
                id: node_id,
                kind: NodeType::Trigger(trigger_config(Some(&keyword))),
            },
        );
        let flow = Flow {
            id: flow_id.clone(),
            name: format!("flow-{i}"),
            nodes,
            edges: Vec::<Edge>::new(),
        };
        registry.active.insert(
            flow_id.clone(),
            ActiveFlow {
                flow,
                priority_tier: 0,
            },
        );
        registry.states.insert(flow_id, FlowState::default());
    }
    registry
}

fn bench_dispatch_scan(c: &mut Criterion) {
    let defaults = EngineDefaults::default();
    let session = SessionState::default();
    let flow_counts: &[usize] = &[1, 10, 100, 1000];

    let mut group = c.benchmark_group("dispatch_no_match");
    for &count in flow_counts {
        let registry = registry_with_flows(count);
        group.bench_with_input(BenchmarkId::from_parameter(count), &registry, |b, registry| {
            b.iter(|| {
                let mut cooldowns = CooldownTracker::default();
                let mut rng = rand::thread_rng();
                let decision = dispatcher::dispatch(
                    black_box(registry),
                    &session,
                    &mut cooldowns,
                    &defaults,
                    &InboundEvent::PlayerSpeaks {
                        content: "no keywords match this at all".to_string(),
                    },
                    chrono::Utc::now(),
                    &mut rng,
                );
                black_box(decision)
            });
        });
    }
    group.finish();
}

fn bench_dispatch_single_match(c: &mut Criterion) {
    let defaults = EngineDefaults::default();
    let session = SessionState::default();
    let flow_counts: &[usize] = &[1, 10, 100, 1000];

    let mut group = c.benchmark_group("dispatch_one_match");
    for &count in flow_counts {
        let mut registry = registry_with_flows(count.saturating_sub(1));
        let flow_id = FlowId::new();
        let node_id = NodeId::new();
        let mut nodes = HashMap::new();
        nodes.insert(
            node_id.clone(),
            Node {
                id: node_id,
                kind: NodeType::Trigger(trigger_config(Some("pump"))),
            },
        );
        let flow = Flow {
            id: flow_id.clone(),
            name: "matching-flow".to_string(),
            nodes,
            edges: Vec::<Edge>::new(),
        };
        registry.active.insert(
            flow_id.clone(),
            ActiveFlow {
                flow,
                priority_tier: 0,
            },
        );
        registry.states.insert(flow_id, FlowState::default());

        group.bench_with_input(BenchmarkId::from_parameter(count), &registry, |b, registry| {
            b.iter(|| {
                let mut cooldowns = CooldownTracker::default();
                let mut rng = rand::thread_rng();
                let decision = dispatcher::dispatch(
                    black_box(registry),
                    &session,
                    &mut cooldowns,
                    &defaults,
                    &InboundEvent::PlayerSpeaks {
                        content: "please pump it now".to_string(),
                    },
                    chrono::Utc::now(),
                    &mut rng,
                );
                black_box(decision)
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_dispatch_scan, bench_dispatch_single_match);
criterion_main!(benches);
