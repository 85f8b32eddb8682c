//! Core types for the flow kernel.
//!
//! This module provides foundational types used throughout the system:
//! - **IDs**: Strongly-typed identifiers (FlowId, NodeId, DeviceId)
//! - **Errors**: Application error types with thiserror derives
//! - **Config**: Configuration structures for the engine, IPC, and persistence

mod config;
mod errors;
mod ids;

pub use config::{Config, EngineDefaults, IpcConfig, ObservabilityConfig, PersistenceConfig};
pub use errors::{Error, Result};
pub use ids::{DeviceId, FlowId, NodeId};
