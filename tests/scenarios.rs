//! End-to-end scenario tests, one per concrete example in the spec's
//! testable-properties section: keyword cooldown, priority preemption,
//! cycle completion, device-on-until-capacity, player choice with
//! substitution, and message-counted pause/resume. Each test builds its
//! flow graph by hand (no authoring UI in this crate) and drives it
//! through `Engine::handle_event`/`mutate_session_and_check`/
//! `handle_player_choice`, asserting on the `BroadcastEvent`s a subscribed
//! `ChannelBroadcastSink` receives.

use flow_kernel::broadcast::{BroadcastEvent, ChannelBroadcastSink, ToastEvent};
use flow_kernel::devices::{DeviceCatalog, DeviceRecord, DeviceType, NullDeviceDriver};
use flow_kernel::dispatcher::InboundEvent;
use flow_kernel::llm::EchoLlm;
use flow_kernel::model::flow::{
    handles, ActionConfig, ChoiceOption, Edge, EventType, Flow, MessageSpec, Node, NodeType,
    PauseResumeConfig, PlayerChoiceConfig, StateComparison, TriggerConfig, UntilSpec,
};
use flow_kernel::types::{EngineDefaults, FlowId, NodeId};
use flow_kernel::Engine;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::Receiver;

fn test_catalog() -> DeviceCatalog {
    DeviceCatalog::load(vec![
        DeviceRecord {
            id: "d1".into(),
            name: "Bedroom Pump".into(),
            label: Some("pump".into()),
            ip: Some("10.0.0.5".into()),
            device_id: None,
            child_id: None,
            brand: "acme".into(),
            device_type: DeviceType::Pump,
            is_primary_pump: true,
            is_primary_vibe: false,
        },
        DeviceRecord {
            id: "d2".into(),
            name: "Nightstand Vibe".into(),
            label: Some("vibe".into()),
            ip: Some("10.0.0.6".into()),
            device_id: None,
            child_id: None,
            brand: "acme".into(),
            device_type: DeviceType::Vibe,
            is_primary_pump: false,
            is_primary_vibe: true,
        },
    ])
}

fn test_engine() -> (Engine, Receiver<BroadcastEvent>) {
    let sink = Arc::new(ChannelBroadcastSink::new(64));
    let rx = sink.subscribe();
    let engine = Engine::new(
        EngineDefaults::default(),
        test_catalog(),
        Arc::new(NullDeviceDriver),
        sink,
        Arc::new(EchoLlm),
    );
    (engine, rx)
}

fn node_id(s: &str) -> NodeId {
    NodeId::from_string(s.to_string()).unwrap()
}

fn trigger_node(id: &str, cfg: TriggerConfig) -> Node {
    Node {
        id: node_id(id),
        kind: NodeType::Trigger(cfg),
    }
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
        fire_only_once: false,
        unblockable: false,
        trigger_priority: None,
        flow_priority: 0,
        notify: false,
    }
}

fn send_message_node(id: &str, text: &str) -> Node {
    Node {
        id: node_id(id),
        kind: NodeType::Action(ActionConfig::SendMessage(MessageSpec {
            text: text.to_string(),
            suppress_llm: true,
        })),
    }
}

async fn drain_until<F>(rx: &mut Receiver<BroadcastEvent>, mut matches: F) -> Option<BroadcastEvent>
where
    F: FnMut(&BroadcastEvent) -> bool,
{
    for _ in 0..30 {
        match tokio::time::timeout(Duration::from_millis(100), rx.recv()).await {
            Ok(Ok(event)) if matches(&event) => return Some(event),
            Ok(Ok(_)) => continue,
            _ => return None,
        }
    }
    None
}

fn ai_message_text(event: &BroadcastEvent) -> Option<&str> {
    match event {
        BroadcastEvent::AiMessage { content, .. } => Some(content),
        _ => None,
    }
}

// ---- scenario 1: keyword trigger with cooldown -----------------------------

#[tokio::test]
async fn keyword_trigger_respects_message_count_cooldown() {
    let (engine, mut rx) = test_engine();

    let trigger_id = "trigger";
    let action_id = "action";
    let mut cfg = base_trigger(EventType::PlayerSpeaks);
    cfg.keywords = vec!["pump".into()];
    cfg.cooldown = Some(3);
    cfg.fire_only_once = false;

    let flow = Flow {
        id: FlowId::new(),
        name: "keyword-cooldown".into(),
        nodes: HashMap::from([
            (node_id(trigger_id), trigger_node(trigger_id, cfg)),
            (node_id(action_id), send_message_node(action_id, "inflating")),
        ]),
        edges: vec![Edge {
            source: node_id(trigger_id),
            target: node_id(action_id),
            handle: None,
        }],
    };
    engine.activate_flow(flow, 0).await.unwrap();

    let mut fired = 0;
    for _ in 0..5 {
        engine
            .handle_event(InboundEvent::PlayerSpeaks {
                content: "pump me up".into(),
            })
            .await;
        if drain_until(&mut rx, |e| ai_message_text(e) == Some("inflating")).await.is_some() {
            fired += 1;
        }
    }

    // message 1 fires (no prior fire), messages 2-3 are within the
    // cooldown window, message 4 is 3 messages past the first fire and
    // fires again, message 5 is back inside the window.
    assert_eq!(fired, 2);
}

// ---- scenario 2: priority preemption ---------------------------------------

#[tokio::test]
async fn higher_priority_flow_preempts_lower_priority_running_chain() {
    tokio::time::pause();
    let (engine, mut rx) = test_engine();

    let a_trigger = "a_trigger";
    let a_delay = "a_delay";
    let a_after = "a_after";
    let mut a_cfg = base_trigger(EventType::PlayerSpeaks);
    a_cfg.keywords = vec!["start-a".into()];
    a_cfg.trigger_priority = Some(5);
    a_cfg.fire_only_once = false;
    a_cfg.notify = true;

    let flow_a = Flow {
        id: FlowId::new(),
        name: "flow-a".into(),
        nodes: HashMap::from([
            (node_id(a_trigger), trigger_node(a_trigger, a_cfg)),
            (
                node_id(a_delay),
                Node {
                    id: node_id(a_delay),
                    kind: NodeType::Delay(flow_kernel::model::flow::DelayConfig {
                        duration: flow_kernel::model::flow::VarOrNumber::Literal(10.0),
                        unit: flow_kernel::model::flow::TimeUnit::Seconds,
                    }),
                },
            ),
            (node_id(a_after), send_message_node(a_after, "a finished")),
        ]),
        edges: vec![
            Edge {
                source: node_id(a_trigger),
                target: node_id(a_delay),
                handle: None,
            },
            Edge {
                source: node_id(a_delay),
                target: node_id(a_after),
                handle: None,
            },
        ],
    };

    let b_trigger = "b_trigger";
    let b_action = "b_action";
    let mut b_cfg = base_trigger(EventType::PlayerSpeaks);
    b_cfg.keywords = vec!["start-b".into()];
    b_cfg.trigger_priority = Some(2);
    b_cfg.fire_only_once = false;

    let flow_b = Flow {
        id: FlowId::new(),
        name: "flow-b".into(),
        nodes: HashMap::from([
            (node_id(b_trigger), trigger_node(b_trigger, b_cfg)),
            (node_id(b_action), send_message_node(b_action, "b done")),
        ]),
        edges: vec![Edge {
            source: node_id(b_trigger),
            target: node_id(b_action),
            handle: None,
        }],
    };

    engine.activate_flow(flow_a, 0).await.unwrap();
    engine.activate_flow(flow_b, 0).await.unwrap();

    engine
        .handle_event(InboundEvent::PlayerSpeaks {
            content: "start-a please".into(),
        })
        .await;
    // Let flow A's chain spawn and enter its delay.
    tokio::task::yield_now().await;
    tokio::task::yield_now().await;

    engine
        .handle_event(InboundEvent::PlayerSpeaks {
            content: "start-b please".into(),
        })
        .await;

    let takeover = drain_until(&mut rx, |e| {
        matches!(e, BroadcastEvent::FlowToast { event: ToastEvent::Takeover, .. })
    })
    .await;
    assert!(takeover.is_some(), "expected a takeover toast");

    let b_result = drain_until(&mut rx, |e| ai_message_text(e) == Some("b done")).await;
    assert!(b_result.is_some(), "flow B should have run to completion");

    // Give flow A's aborted delay a chance to wake and observe the epoch
    // change rather than emitting its post-delay message.
    tokio::time::advance(Duration::from_secs(10)).await;
    tokio::task::yield_now().await;
    let a_result = drain_until(&mut rx, |e| ai_message_text(e) == Some("a finished")).await;
    assert!(a_result.is_none(), "flow A must not reach its post-delay node once preempted");
}

// ---- scenario 3: cycle completion -----------------------------------------

#[tokio::test]
async fn start_cycle_reports_immediate_then_completion() {
    tokio::time::pause();
    let (engine, mut rx) = test_engine();

    let trigger_id = "trigger";
    let cycle_id = "cycle";
    let immediate_id = "immediate_msg";
    let done_id = "done_msg";

    let mut cfg = base_trigger(EventType::PlayerSpeaks);
    cfg.keywords = vec!["cycle".into()];

    let flow = Flow {
        id: FlowId::new(),
        name: "cycle-flow".into(),
        nodes: HashMap::from([
            (node_id(trigger_id), trigger_node(trigger_id, cfg)),
            (
                node_id(cycle_id),
                Node {
                    id: node_id(cycle_id),
                    kind: NodeType::Action(ActionConfig::StartCycle {
                        device_ref: "vibe".into(),
                        duration_secs: flow_kernel::model::flow::VarOrNumber::Literal(2.0),
                        interval_secs: flow_kernel::model::flow::VarOrNumber::Literal(1.0),
                        cycles: 3,
                        until: None,
                    }),
                },
            ),
            (node_id(immediate_id), send_message_node(immediate_id, "started")),
            (node_id(done_id), send_message_node(done_id, "done")),
        ]),
        edges: vec![
            Edge {
                source: node_id(trigger_id),
                target: node_id(cycle_id),
                handle: None,
            },
            Edge {
                source: node_id(cycle_id),
                target: node_id(immediate_id),
                handle: Some(handles::IMMEDIATE.to_string()),
            },
            Edge {
                source: node_id(cycle_id),
                target: node_id(done_id),
                handle: Some(handles::COMPLETION.to_string()),
            },
        ],
    };
    engine.activate_flow(flow, 0).await.unwrap();

    engine
        .handle_event(InboundEvent::PlayerSpeaks {
            content: "cycle please".into(),
        })
        .await;

    let started = drain_until(&mut rx, |e| ai_message_text(e) == Some("started")).await;
    assert!(started.is_some());

    // cycles(3) * (duration(2) + interval(1)) == 9s.
    tokio::time::advance(Duration::from_secs(9)).await;
    tokio::task::yield_now().await;

    let done = drain_until(&mut rx, |e| ai_message_text(e) == Some("done")).await;
    assert!(done.is_some(), "cycle completion handler should fire after 9s");
}

// ---- scenario 4: device-on until capacity ----------------------------------

#[tokio::test]
async fn device_on_until_capacity_turns_off_on_threshold() {
    let (engine, mut rx) = test_engine();

    let trigger_id = "trigger";
    let on_id = "device_on";
    let immediate_id = "immediate_msg";
    let done_id = "off_msg";

    let mut cfg = base_trigger(EventType::PlayerSpeaks);
    cfg.keywords = vec!["vibe on".into()];

    let flow = Flow {
        id: FlowId::new(),
        name: "capacity-until".into(),
        nodes: HashMap::from([
            (node_id(trigger_id), trigger_node(trigger_id, cfg)),
            (
                node_id(on_id),
                Node {
                    id: node_id(on_id),
                    kind: NodeType::Action(ActionConfig::DeviceOn {
                        device_ref: "vibe".into(),
                        until: Some(UntilSpec::Capacity(StateComparison::Greater(50.0))),
                        allow_over_inflation: false,
                    }),
                },
            ),
            (node_id(immediate_id), send_message_node(immediate_id, "on")),
            (node_id(done_id), send_message_node(done_id, "off")),
        ]),
        edges: vec![
            Edge {
                source: node_id(trigger_id),
                target: node_id(on_id),
                handle: None,
            },
            Edge {
                source: node_id(on_id),
                target: node_id(immediate_id),
                handle: Some(handles::IMMEDIATE.to_string()),
            },
            Edge {
                source: node_id(on_id),
                target: node_id(done_id),
                handle: Some(handles::COMPLETION.to_string()),
            },
        ],
    };
    engine.activate_flow(flow, 0).await.unwrap();

    engine.mutate_session_and_check(|s| s.set_capacity(30)).await;
    engine
        .handle_event(InboundEvent::PlayerSpeaks {
            content: "vibe on please".into(),
        })
        .await;

    let on = drain_until(&mut rx, |e| ai_message_text(e) == Some("on")).await;
    assert!(on.is_some());

    engine.mutate_session_and_check(|s| s.set_capacity(45)).await;
    assert!(
        drain_until(&mut rx, |e| ai_message_text(e) == Some("off")).await.is_none(),
        "capacity below threshold must not fire completion"
    );

    engine.mutate_session_and_check(|s| s.set_capacity(55)).await;
    let off = drain_until(&mut rx, |e| ai_message_text(e) == Some("off")).await;
    assert!(off.is_some(), "crossing the capacity threshold should turn the device off");
}

// ---- scenario 5: player choice with [Choice] substitution ------------------

#[tokio::test]
async fn player_choice_substitutes_choice_label_and_continues_chain() {
    let (engine, mut rx) = test_engine();

    let trigger_id = "trigger";
    let choice_id = "choice";
    let a_id = "a_branch";

    let mut cfg = base_trigger(EventType::PlayerSpeaks);
    cfg.keywords = vec!["choose".into()];

    let flow = Flow {
        id: FlowId::new(),
        name: "choice-flow".into(),
        nodes: HashMap::from([
            (node_id(trigger_id), trigger_node(trigger_id, cfg)),
            (
                node_id(choice_id),
                Node {
                    id: node_id(choice_id),
                    kind: NodeType::PlayerChoice(PlayerChoiceConfig {
                        intro_message: None,
                        ai_prompt: None,
                        choices: vec![
                            ChoiceOption {
                                id: "a".into(),
                                label: "yes".into(),
                                player_response: Some("I say [Choice]".into()),
                                player_response_suppress_llm: true,
                                llm_enhance: false,
                            },
                            ChoiceOption {
                                id: "b".into(),
                                label: "no".into(),
                                player_response: Some("I say [Choice]".into()),
                                player_response_suppress_llm: true,
                                llm_enhance: false,
                            },
                        ],
                    }),
                },
            ),
            (node_id(a_id), send_message_node(a_id, "committed to yes")),
        ]),
        edges: vec![
            Edge {
                source: node_id(trigger_id),
                target: node_id(choice_id),
                handle: None,
            },
            Edge {
                source: node_id(choice_id),
                target: node_id(a_id),
                handle: Some("a".to_string()),
            },
        ],
    };
    engine.activate_flow(flow, 0).await.unwrap();

    engine
        .handle_event(InboundEvent::PlayerSpeaks {
            content: "let's choose".into(),
        })
        .await;

    let prompt = drain_until(&mut rx, |e| matches!(e, BroadcastEvent::PlayerChoice { .. })).await;
    assert!(prompt.is_some(), "expected the choice prompt to broadcast");

    engine
        .handle_player_choice(node_id(choice_id), "a".into(), "yes".into())
        .await;

    let player_msg = drain_until(&mut rx, |e| {
        matches!(e, BroadcastEvent::PlayerMessage { content, .. } if content == "I say yes")
    })
    .await;
    assert!(player_msg.is_some(), "expected the substituted player response");

    let continuation = drain_until(&mut rx, |e| ai_message_text(e) == Some("committed to yes")).await;
    assert!(continuation.is_some(), "chain should continue along the chosen edge");
}

// ---- scenario 6: pause/resume across messages ------------------------------

#[tokio::test]
async fn pause_resume_fires_after_exact_message_count_not_before() {
    let (engine, mut rx) = test_engine();

    let trigger_id = "trigger";
    let pause_id = "pause";
    let off_id = "off_msg";
    let resumed_id = "resumed_msg";

    let mut cfg = base_trigger(EventType::PlayerSpeaks);
    cfg.keywords = vec!["pause me".into()];

    let flow = Flow {
        id: FlowId::new(),
        name: "pause-resume-flow".into(),
        nodes: HashMap::from([
            (node_id(trigger_id), trigger_node(trigger_id, cfg)),
            (
                node_id(pause_id),
                Node {
                    id: node_id(pause_id),
                    kind: NodeType::PauseResume(PauseResumeConfig {
                        resume_after_messages: 2,
                    }),
                },
            ),
            (node_id(off_id), send_message_node(off_id, "paused")),
            (node_id(resumed_id), send_message_node(resumed_id, "resumed")),
        ]),
        edges: vec![
            Edge {
                source: node_id(trigger_id),
                target: node_id(pause_id),
                handle: None,
            },
            Edge {
                source: node_id(pause_id),
                target: node_id(off_id),
                handle: Some(handles::SOURCE_PAUSE.to_string()),
            },
            Edge {
                source: node_id(pause_id),
                target: node_id(resumed_id),
                handle: Some(handles::SOURCE_RESUME.to_string()),
            },
        ],
    };
    engine.activate_flow(flow, 0).await.unwrap();

    engine
        .handle_event(InboundEvent::PlayerSpeaks {
            content: "pause me now".into(),
        })
        .await;

    let paused = drain_until(&mut rx, |e| ai_message_text(e) == Some("paused")).await;
    assert!(paused.is_some());

    // First message after the pause ticks the counter from 2 to 1 — must
    // not resume yet.
    engine
        .handle_event(InboundEvent::PlayerSpeaks {
            content: "one".into(),
        })
        .await;
    assert!(
        drain_until(&mut rx, |e| ai_message_text(e) == Some("resumed")).await.is_none(),
        "must not resume after only one message"
    );

    // Second message ticks the counter to 0 and fires the resume edge.
    engine
        .handle_event(InboundEvent::PlayerSpeaks {
            content: "two".into(),
        })
        .await;
    let resumed = drain_until(&mut rx, |e| ai_message_text(e) == Some("resumed")).await;
    assert!(resumed.is_some(), "expected resume after exactly two messages");
}

// ---- scenario 7: global pause defers a mid-chain message -------------------

#[tokio::test]
async fn global_pause_defers_message_and_resume_replays_it() {
    tokio::time::pause();
    let (engine, mut rx) = test_engine();

    let trigger_id = "trigger";
    let delay_id = "delay";
    let send_id = "send";
    let after_id = "after";

    let mut cfg = base_trigger(EventType::PlayerSpeaks);
    cfg.keywords = vec!["go".into()];
    cfg.fire_only_once = false;

    let flow = Flow {
        id: FlowId::new(),
        name: "global-pause-flow".into(),
        nodes: HashMap::from([
            (node_id(trigger_id), trigger_node(trigger_id, cfg)),
            (
                node_id(delay_id),
                Node {
                    id: node_id(delay_id),
                    kind: NodeType::Delay(flow_kernel::model::flow::DelayConfig {
                        duration: flow_kernel::model::flow::VarOrNumber::Literal(5.0),
                        unit: flow_kernel::model::flow::TimeUnit::Seconds,
                    }),
                },
            ),
            (node_id(send_id), send_message_node(send_id, "queued while paused")),
            (node_id(after_id), send_message_node(after_id, "after resume")),
        ]),
        edges: vec![
            Edge {
                source: node_id(trigger_id),
                target: node_id(delay_id),
                handle: None,
            },
            Edge {
                source: node_id(delay_id),
                target: node_id(send_id),
                handle: None,
            },
            Edge {
                source: node_id(send_id),
                target: node_id(after_id),
                handle: None,
            },
        ],
    };
    engine.activate_flow(flow, 0).await.unwrap();

    engine
        .handle_event(InboundEvent::PlayerSpeaks {
            content: "go now".into(),
        })
        .await;
    // Let the chain spawn and enter its delay before pausing.
    tokio::task::yield_now().await;
    tokio::task::yield_now().await;

    engine.pause_flows(Some("user defocused chat".into())).await;
    let paused = drain_until(&mut rx, |e| {
        matches!(e, BroadcastEvent::FlowPaused { paused: true, .. })
    })
    .await;
    assert!(paused.is_some());

    // New events must not dispatch at all while paused.
    engine
        .handle_event(InboundEvent::PlayerSpeaks {
            content: "go now".into(),
        })
        .await;

    tokio::time::advance(Duration::from_secs(5)).await;
    tokio::task::yield_now().await;
    tokio::task::yield_now().await;

    assert!(
        drain_until(&mut rx, |e| ai_message_text(e) == Some("queued while paused"))
            .await
            .is_none(),
        "message reaching a send node while paused must be deferred, not broadcast"
    );

    engine.resume_flows().await;

    let queued = drain_until(&mut rx, |e| ai_message_text(e) == Some("queued while paused")).await;
    assert!(queued.is_some(), "the deferred message must be replayed on resume");

    let after = drain_until(&mut rx, |e| ai_message_text(e) == Some("after resume")).await;
    assert!(after.is_some(), "the chain must continue past the deferred node after resume");
}
