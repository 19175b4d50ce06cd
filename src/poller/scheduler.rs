//! Cancellable periodic task.
//!
//! `schedule(period, action)` runs `action` on the first tick (immediately)
//! and then every `period`. After [`TaskHandle::cancel`] returns, `action`
//! is not running and will never run again: every invocation holds a gate
//! and re-checks the token under it, and `cancel` waits on that gate.

use std::sync::{Arc, Mutex, PoisonError};

use tokio::time::{self, Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

const MIN_PERIOD: Duration = Duration::from_millis(1);

pub struct TaskHandle {
    token: CancellationToken,
    gate: Arc<Mutex<()>>,
}

impl TaskHandle {
    /// Idempotent. Must not be called from inside the action.
    pub fn cancel(&self) {
        self.token.cancel();
        drop(self.gate.lock().unwrap_or_else(PoisonError::into_inner));
    }
}

impl Drop for TaskHandle {
    /// Only flips the token: the handle may be dropped by the action itself,
    /// which already holds the gate.
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Must be called from within a tokio runtime.
pub fn schedule<F>(period: Duration, mut action: F) -> TaskHandle
where
    F: FnMut() + Send + 'static,
{
    let token = CancellationToken::new();
    let gate = Arc::new(Mutex::new(()));

    let task_token = token.clone();
    let task_gate = Arc::clone(&gate);
    tokio::spawn(async move {
        let mut ticker = time::interval(period.max(MIN_PERIOD));
        // A late tick is dropped rather than replayed in a burst.
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = task_token.cancelled() => break,
                _ = ticker.tick() => {
                    if !invoke(&task_gate, &task_token, &mut action) {
                        break;
                    }
                }
            }
        }
    });

    TaskHandle { token, gate }
}

/// Run `action` unless cancelled. The gate is held for the whole call.
fn invoke<F: FnMut()>(gate: &Mutex<()>, token: &CancellationToken, action: &mut F) -> bool {
    let _gate = gate.lock().unwrap_or_else(PoisonError::into_inner);
    if token.is_cancelled() {
        return false;
    }
    action();
    true
}
