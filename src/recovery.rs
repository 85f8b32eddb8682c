//! Panic recovery utilities.
//!
//! A node executor's author-supplied logic (variable substitution, condition
//! evaluation, device resolution) runs inside these wrappers so that a
//! programming error in one node's handling doesn't bring down the engine —
//! it's caught, logged, turned into an `Error::internal`, and the chain that
//! hit it is aborted in isolation (spec §4.5, §7).

use crate::types::{Error, Result};
use futures::FutureExt;
use std::panic::{catch_unwind, AssertUnwindSafe};

/// Execute a function with panic recovery.
pub fn with_recovery<F, T>(operation: F, operation_name: &str) -> Result<T>
where
    F: FnOnce() -> Result<T>,
{
    match catch_unwind(AssertUnwindSafe(operation)) {
        Ok(result) => result,
        Err(panic_payload) => {
            let panic_msg = extract_panic_message(&panic_payload);
            tracing::error!(
                "panic_recovered: operation={}, panic={}",
                operation_name,
                panic_msg
            );

            Err(Error::internal(format!(
                "panic in {}: {}",
                operation_name, panic_msg
            )))
        }
    }
}

/// Execute an async function with panic recovery.
///
/// `catch_unwind` only guards a synchronous call — wrapping it around the
/// future's *construction* would never see a panic raised while the future
/// is polled across its `.await` points, which is where a node executor
/// actually does its work. `AssertUnwindSafe(future).catch_unwind()` is the
/// `futures` idiom for catching panics on every poll instead.
pub async fn with_recovery_async<F, Fut, T>(operation: F, operation_name: &str) -> Result<T>
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    match AssertUnwindSafe(operation()).catch_unwind().await {
        Ok(result) => result,
        Err(panic_payload) => {
            let panic_msg = extract_panic_message(&panic_payload);
            tracing::error!(
                "async_panic_recovered: operation={}, panic={}",
                operation_name,
                panic_msg
            );

            Err(Error::internal(format!(
                "async panic in {}: {}",
                operation_name, panic_msg
            )))
        }
    }
}

fn extract_panic_message(payload: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic (no message)".to_string()
    }
}

/// Wraps an operation with recovery and a fixed context name.
#[macro_export]
macro_rules! recover_with_context {
    ($operation_name:expr, $body:expr) => {
        $crate::recovery::with_recovery(|| $body, $operation_name)
    };
}
