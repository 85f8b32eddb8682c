//! IPC service handlers — one module per `service` string routed by
//! `ipc::router::route_request`.
//!
//! Grounded on the teacher's `ipc/handlers/{kernel,orchestration,commbus,
//! interrupt}.rs` split (one handler module per gRPC-replacement service);
//! here the four services are renamed to match what the engine actually
//! exposes: `engine` (flow lifecycle + inbound events), `devices` (catalog
//! resolution + driver completion callbacks), `pending` (the six external
//! resumption sources from spec §4.4), and `control` (pause/resume/
//! emergency-stop, spec §5).

pub mod control;
pub mod devices;
pub mod engine;
pub mod pending;
