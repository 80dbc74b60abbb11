//! Monotonic runtime clock.
//!
//! All ledger decay and monitor intervals are measured against this clock,
//! never against wall time, so NTP steps cannot grant or revoke resource
//! headroom. The decay layer still floors negative intervals as a defense
//! the clock itself should make unreachable.

use std::time::Instant;

#[derive(Clone, Copy, Debug)]
pub struct RuntimeClock {
    start: Instant,
}

impl RuntimeClock {
    /// Anchor the clock at the moment the sandbox comes up.
    pub fn start() -> RuntimeClock {
        RuntimeClock {
            start: Instant::now(),
        }
    }

    /// Seconds elapsed since the sandbox started.
    pub fn now(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn clock_is_monotonic() {
        let clock = RuntimeClock::start();
        let a = clock.now();
        std::thread::sleep(Duration::from_millis(20));
        let b = clock.now();
        assert!(b > a);
        assert!(b - a >= 0.015);
    }
}
