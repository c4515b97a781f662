//! Fixed-window admission sampler.
//!
//! Bounds how many verdicts per second may carry the forced-keep marker.
//! The window counter is deterministic: with a rate of R, exactly R calls
//! in a window are admitted and the rest are not, which keeps sampling
//! behavior reproducible in tests and across restarts.

use std::time::Instant;

use parking_lot::Mutex;

/// Default admissions per one-second window.
pub const DEFAULT_RATE: u32 = 100;

#[derive(Debug)]
struct Window {
    started: Instant,
    admitted: u32,
}

/// Thread-safe N-per-second admission counter.
///
/// `allow()` holds the internal lock only for a compare-and-bump; it is
/// never held across I/O.
#[derive(Debug)]
pub struct RateLimiter {
    rate: u32,
    window: Mutex<Window>,
}

impl RateLimiter {
    /// Create a limiter admitting `rate` calls per second. A rate of 0
    /// admits everything (sampling disabled).
    pub fn new(rate: u32) -> Self {
        Self {
            rate,
            window: Mutex::new(Window {
                started: Instant::now(),
                admitted: 0,
            }),
        }
    }

    /// Whether this call is admitted within the current window.
    pub fn allow(&self) -> bool {
        if self.rate == 0 {
            return true;
        }

        let now = Instant::now();
        let mut window = self.window.lock();

        if now.duration_since(window.started).as_secs() >= 1 {
            window.started = now;
            window.admitted = 0;
        }

        if window.admitted < self.rate {
            window.admitted += 1;
            true
        } else {
            false
        }
    }

    /// Configured rate, admissions per second.
    pub fn rate(&self) -> u32 {
        self.rate
    }
}
