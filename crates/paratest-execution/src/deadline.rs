//! Deadline racing for user units.
//!
//! A unit (hooks + body, or a teardown pass) runs on its own thread while the
//! worker's main thread waits with a timeout. When the deadline fires first
//! the unit's cancellation flag flips and the unit gets a grace window equal
//! to the original timeout to unwind; a unit that never comes back is
//! abandoned. A unit that completes first wins the race outright.

use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use tracing::{trace, warn};

use paratest_core::TestState;

/// How the race between a unit and its deadline ended.
pub enum RaceOutcome<T> {
    /// Unit finished before the deadline.
    Finished(T),
    /// Deadline fired, then the unit unwound within the grace window.
    TimedOut(T),
    /// Deadline fired and the unit never returned; its thread is abandoned.
    Abandoned,
    /// The unit's thread died without producing a result.
    Crashed,
}

/// Run `unit` on a dedicated thread and race it against `timeout_ms`
/// (0 = no deadline). `state.cancel()` is the cancellation signal.
pub fn race<T, F>(name: &str, timeout_ms: u64, state: &Arc<TestState>, unit: F) -> RaceOutcome<T>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    let (tx, rx) = mpsc::sync_channel(1);
    let spawned = std::thread::Builder::new()
        .name(format!("unit-{name}"))
        .spawn(move || {
            let _ = tx.send(unit());
        });
    if spawned.is_err() {
        return RaceOutcome::Crashed;
    }

    if timeout_ms == 0 {
        return match rx.recv() {
            Ok(value) => RaceOutcome::Finished(value),
            Err(_) => RaceOutcome::Crashed,
        };
    }

    let timeout = Duration::from_millis(timeout_ms);
    match rx.recv_timeout(timeout) {
        Ok(value) => RaceOutcome::Finished(value),
        Err(mpsc::RecvTimeoutError::Disconnected) => RaceOutcome::Crashed,
        Err(mpsc::RecvTimeoutError::Timeout) => {
            trace!(unit = name, timeout_ms, "deadline fired, cancelling unit");
            state.cancel();
            // Grace window equals the original timeout.
            match rx.recv_timeout(timeout) {
                Ok(value) => RaceOutcome::TimedOut(value),
                Err(mpsc::RecvTimeoutError::Disconnected) => RaceOutcome::Crashed,
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    warn!(unit = name, "unit ignored cancellation; abandoning its thread");
                    RaceOutcome::Abandoned
                }
            }
        }
    }
}
