//! CPU throttling math.
//!
//! The watchdog feeds interval samples through `CpuThrottle`, which keeps a
//! short rolling window and answers with the pause that makes the window's
//! usage legal: `stop = used/limit - wall`, i.e. the algebraic solution of
//! `used / (wall + stop) == limit`. A single burst sample cannot trigger an
//! unfair pause because the decision is taken on the window average, and
//! the very first sample is always a free pass.

use std::collections::VecDeque;
use std::time::Duration;

/// One measurement interval: CPU seconds consumed over wall seconds
/// elapsed. Time the process spent suspended is excluded from both.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CpuSample {
    pub cpu_seconds: f64,
    pub wall_seconds: f64,
}

pub struct CpuThrottle {
    limit: f64,
    window: usize,
    samples: VecDeque<CpuSample>,
    primed: bool,
}

impl CpuThrottle {
    /// `limit` is the permitted fraction of one core; `window` the number
    /// of samples averaged over.
    pub fn new(limit: f64, window: usize) -> CpuThrottle {
        CpuThrottle {
            limit,
            window: window.max(1),
            samples: VecDeque::new(),
            primed: false,
        }
    }

    /// Observe one interval and return how long the process should be
    /// suspended (zero when under the limit). Issuing a pause consumes the
    /// window: the intervals it covered have been punished and must not be
    /// punished again by the next decision.
    pub fn observe(&mut self, sample: CpuSample) -> Duration {
        if !self.primed {
            self.primed = true;
            self.samples.push_back(sample);
            return Duration::ZERO;
        }

        self.samples.push_back(sample);
        if self.samples.len() > self.window {
            self.samples.pop_front();
        }

        let wall: f64 = self.samples.iter().map(|s| s.wall_seconds).sum();
        let used: f64 = self.samples.iter().map(|s| s.cpu_seconds).sum();
        if wall <= 0.0 || self.limit <= 0.0 {
            return Duration::ZERO;
        }
        if used / wall <= self.limit {
            return Duration::ZERO;
        }

        let stop = (used / self.limit - wall).max(0.0);
        self.samples.clear();
        Duration::from_secs_f64(stop)
    }
}
