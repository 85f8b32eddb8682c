//! TCP+msgpack IPC transport layer.
//!
//! Replaces the gRPC service layer the teacher shipped alongside it
//! (spec §1 scopes external transport out of the engine core; this is the
//! thin request/response boundary the rest of the stack — UI, device
//! drivers, scenario harnesses — talks through). Implements
//! length-prefixed msgpack framing (see `codec`).

pub mod codec;
pub mod handlers;
pub mod router;
pub mod server;

pub use server::IpcServer;
