//! Timer subsystem: the idle checker and finite-cycle auto-completion
//! timer (spec §4.9 "Timer subsystem"). The third timer this spec names —
//! the "until timer" auto-off — is registered directly where it's needed,
//! inline in `interpreter::nodes::register_until`, since it's a one-shot
//! spawned at the moment a `device_on`/`start_cycle` node with a `timer`
//! `until` fires; there's no shared scheduling state to centralize there.
//!
//! Grounded on the teacher's `CleanupService` (`src/kernel/cleanup.rs`):
//! a `tokio::time::interval` loop raced against a stop signal via
//! `tokio::select!`. Here the stop signal is the engine's own
//! `CancellationToken` rather than a dedicated `oneshot` channel, since
//! every background task in this crate already shuts down off the same
//! token (spec §10.5 graceful shutdown).

use crate::dispatcher::InboundEvent;
use crate::engine::Engine;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Periodically checks elapsed idle time against `EngineDefaults::
/// default_idle_threshold` and fires an `Idle` event when crossed. Trigger
/// nodes default to `fireOnlyOnce`, so a flow's idle trigger won't refire
/// on subsequent ticks even though this checker keeps emitting the event
/// every `check_interval` while the session stays idle.
pub fn spawn_idle_checker(engine: Engine, check_interval: Duration) -> JoinHandle<()> {
    let cancel = engine.cancel_token();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(check_interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let session = engine.session_snapshot().await;
                    let idle_for = chrono::Utc::now().signed_duration_since(session.last_activity);
                    let threshold = engine.defaults().default_idle_threshold;
                    if idle_for.num_milliseconds().max(0) as u128 >= threshold.as_millis() {
                        engine.handle_event(InboundEvent::Idle).await;
                    }
                }
            }
        }
    })
}

/// Schedules the natural completion of a finite `start_cycle` (spec §4.3,
/// scenario 3: `cycles * (duration + interval)` after the cycle begins).
/// Cancelled implicitly if the engine's cancel token fires; if the cycle
/// is stopped early via `stop_cycle`, the pending-op it would have
/// resolved is already gone by the time this timer fires, so
/// `handle_cycle_complete` becomes a no-op (spec invariant: a completion
/// source firing against a non-existent `PendingOp` does nothing).
pub fn spawn_cycle_completion_timer(
    engine: Engine,
    device_key: crate::devices::DeviceKey,
    duration: Duration,
    interval: Duration,
    cycles: u32,
) -> JoinHandle<()> {
    let total = (duration + interval).saturating_mul(cycles.max(1));
    let cancel = engine.cancel_token();
    tokio::spawn(async move {
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = tokio::time::sleep(total) => {
                engine.handle_cycle_complete(device_key).await;
            }
        }
    })
}
