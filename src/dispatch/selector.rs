//! The socket selector: one background loop that notices readable listening
//! entries and hands each to a worker.
//!
//! The loop is started lazily by the first registration, holds an `events`
//! slot for its own lifetime, and exits on its own once no listening entries
//! remain. Entries currently being dispatched are left out of the poll set,
//! so a single entry never has two dispatches in flight; further activity
//! queues in the OS socket buffer until the next cycle.

use crate::comm::registry::CommRegistry;
use crate::config::types::Fungible;
use crate::context::SandboxContext;
use crate::dispatch::poll_strategy::ReadinessPoller;
use crate::dispatch::worker;
use crate::ledger::{new_token, ItemToken, ResourceLedger};
use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Upper bound on one readiness wait, so registration changes and the exit
/// condition are observed promptly.
const POLL_TIMEOUT_MS: i32 = 500;

struct SelectorState {
    running: bool,
    /// The `events` reservation covering the selector thread itself.
    token: Option<ItemToken>,
}

pub(crate) struct EventSelector {
    registry: Arc<CommRegistry>,
    ledger: Arc<ResourceLedger>,
    poller: ReadinessPoller,
    state: Mutex<SelectorState>,
}

impl EventSelector {
    pub fn new(registry: Arc<CommRegistry>, ledger: Arc<ResourceLedger>) -> EventSelector {
        EventSelector {
            registry,
            ledger,
            poller: ReadinessPoller,
            state: Mutex::new(SelectorState {
                running: false,
                token: None,
            }),
        }
    }

    /// Start the selector thread if it is not already running. Called by
    /// every listener registration; the reservation taken here is released
    /// by the loop when it exits.
    pub fn ensure_running(self: &Arc<Self>, ctx: &SandboxContext) {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if state.running {
            return;
        }

        let token = new_token();
        self.ledger.reserve_item_blocking(Fungible::Events, token);
        state.running = true;
        state.token = Some(token);
        drop(state);

        let selector = Arc::clone(self);
        let ctx = ctx.clone();
        let spawned = std::thread::Builder::new()
            .name("socket-selector".to_string())
            .spawn(move || selector.run(ctx));
        if spawned.is_err() {
            self.ledger.release_item(Fungible::Events, &token);
            crate::fatal::thread_error("could not start the socket selector thread");
        }
        log::debug!("socket selector started");
    }

    fn run(self: Arc<Self>, ctx: SandboxContext) {
        loop {
            if self.try_exit() {
                return;
            }

            let targets = self.registry.poll_targets();
            if targets.is_empty() {
                // Every listener is mid-dispatch; give the workers a moment.
                std::thread::sleep(Duration::from_millis(10));
                continue;
            }

            let fds: Vec<RawFd> = targets.iter().map(|t| t.fd).collect();
            for fd in self.poller.ready(&fds, POLL_TIMEOUT_MS) {
                let Some(target) = targets.iter().find(|t| t.fd == fd) else {
                    continue;
                };
                // Stopped between the snapshot and now.
                if !self.registry.contains(target.handle) {
                    continue;
                }

                let token = new_token();
                self.ledger.reserve_item_blocking(Fungible::Events, token);
                self.registry.set_dispatching(target.handle, true);
                worker::dispatch(ctx.clone(), target.handle, token);
            }
        }
    }

    /// Exit once nothing is listening, releasing the loop's own slot. The
    /// next registration starts a fresh loop.
    fn try_exit(&self) -> bool {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if self.registry.listening_count() > 0 {
            return false;
        }
        if let Some(token) = state.token.take() {
            self.ledger.release_item(Fungible::Events, &token);
        }
        state.running = false;
        log::debug!("socket selector exiting: no listening entries remain");
        true
    }
}
