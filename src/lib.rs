//! # Flow Kernel
//!
//! Event-driven flow graph execution engine for a roleplay/companion
//! application: trigger dispatch, graph interpretation, pending-op
//! bookkeeping, priority preemption, and the variable substitution model
//! (see `SPEC_FULL.md`).
//!
//! ## Architecture
//!
//! `Engine` is the crate's single mutable-state owner — every external
//! caller (IPC handlers, timers, device callbacks) goes through its async
//! methods, which serialize access behind one mutex acquired for short,
//! synchronous bursts and released across every suspension point:
//! ```text
//!                    ┌─────────────────────────────────┐
//!   IPC requests  →  │             Engine                │
//!   device events →  │  ┌──────────┐  ┌──────────────┐  │
//!   timers        →  │  │Dispatcher│  │ Interpreter  │  │
//!                    │  └──────────┘  └──────────────┘  │
//!                    │  ┌──────────┐  ┌──────────────┐  │
//!                    │  │ Pending  │  │ Concurrency  │  │
//!                    │  │ Registry │  │ (abort epoch)│  │
//!                    │  └──────────┘  └──────────────┘  │
//!                    └─────────────────────────────────┘
//! ```

// Enforce strict safety at compile time
#![deny(unsafe_code)]
#![warn(missing_debug_implementations)]
#![warn(rust_2018_idioms)]

pub mod broadcast;
pub mod concurrency;
pub mod devices;
pub mod dispatcher;
pub mod engine;
pub mod interpreter;
pub mod ipc;
pub mod llm;
pub mod model;
pub mod pending;
pub mod persistence;
pub mod recovery;
pub mod timers;
pub mod types;

// Internal utilities
pub mod observability;

pub use engine::Engine;
pub use types::{Config, Error, IpcConfig, Result};
