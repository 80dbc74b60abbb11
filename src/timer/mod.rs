//! One-shot timers and blocking sleep.
//!
//! Each armed timer holds an `events` reservation from `schedule` until the
//! callback returns normally (or the timer is cancelled first). Cancellation
//! races the firing: whichever side removes the entry from the table wins,
//! and a lost cancel means the callback runs to completion.

use crate::config::types::{Fungible, Result};
use crate::context::SandboxContext;
use crate::ledger::ResourceLedger;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use uuid::Uuid;

pub type TimerId = Uuid;

pub type TimerCallback = Box<dyn FnOnce(&SandboxContext) + Send + 'static>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum TimerState {
    Pending,
    Firing,
}

pub(crate) struct TimerService {
    ledger: Arc<ResourceLedger>,
    table: Mutex<HashMap<TimerId, TimerState>>,
}

impl TimerService {
    pub fn new(ledger: Arc<ResourceLedger>) -> TimerService {
        TimerService {
            ledger,
            table: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<TimerId, TimerState>> {
        self.table
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Arm a one-shot timer. The `events` item is reserved here, under the
    /// timer's own id, and returned to the pool only after the callback
    /// completes (or the timer is cancelled). Non-blocking: an exhausted
    /// events pool is an error, not a wait.
    pub fn schedule(
        &self,
        ctx: SandboxContext,
        delay: Duration,
        callback: TimerCallback,
    ) -> Result<TimerId> {
        let id = Uuid::new_v4();
        if let Err(err) = self.ledger.reserve_item(Fungible::Events, id) {
            self.ledger.release_item(Fungible::Events, &id);
            return Err(err);
        }
        self.lock().insert(id, TimerState::Pending);

        let spawned = std::thread::Builder::new()
            .name("timer".to_string())
            .spawn(move || fire_after(ctx, id, delay, callback));
        if spawned.is_err() {
            self.lock().remove(&id);
            self.ledger.release_item(Fungible::Events, &id);
            crate::fatal::thread_error("could not start a timer thread");
        }
        Ok(id)
    }

    /// Best-effort cancel. Returns true only when this call is the one that
    /// stopped the timer; a timer that already fired (or was already
    /// cancelled) returns false.
    pub fn cancel(&self, id: TimerId) -> bool {
        let removed = {
            let mut table = self.lock();
            match table.get(&id) {
                Some(TimerState::Pending) => {
                    table.remove(&id);
                    true
                }
                // Mid-fire or unknown: the callback (if any) runs to
                // completion and releases its own reservation.
                Some(TimerState::Firing) | None => false,
            }
        };
        if removed {
            self.ledger.release_item(Fungible::Events, &id);
        }
        removed
    }

    /// Block the calling thread for at least `duration`. The remaining time
    /// is recomputed in a loop, so a spurious early wakeup goes back to
    /// sleep instead of returning short.
    pub fn sleep(&self, duration: Duration) {
        let deadline = Instant::now() + duration;
        loop {
            let now = Instant::now();
            if now >= deadline {
                return;
            }
            std::thread::sleep(deadline - now);
        }
    }

    /// Claim the right to fire. None means a cancel won the race.
    fn begin_firing(&self, id: TimerId) -> Option<()> {
        let mut table = self.lock();
        match table.get(&id) {
            Some(TimerState::Pending) => {
                table.insert(id, TimerState::Firing);
                Some(())
            }
            _ => None,
        }
    }

    fn finish_firing(&self, id: TimerId) {
        self.lock().remove(&id);
        self.ledger.release_item(Fungible::Events, &id);
    }
}

fn fire_after(ctx: SandboxContext, id: TimerId, delay: Duration, callback: TimerCallback) {
    ctx.timers().sleep(delay);

    if ctx.timers().begin_firing(id).is_none() {
        return;
    }

    // Callback first; the reservation is released only after a normal
    // return. A panic here never reaches the release path.
    if let Err(payload) = catch_unwind(AssertUnwindSafe(|| callback(&ctx))) {
        let reason = payload
            .downcast_ref::<String>()
            .map(String::as_str)
            .or_else(|| payload.downcast_ref::<&str>().copied())
            .unwrap_or("non-string panic payload");
        crate::fatal::uncaught_callback(&format!("timer callback panicked: {}", reason));
    }

    ctx.timers().finish_firing(id);
}
