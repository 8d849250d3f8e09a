//! Process-wide backpressure coordinator.
//!
//! A single monotonically non-decreasing "paused until" instant, set whenever
//! the upstream tells us (via `Retry-After` or similar) to back off globally.
//! Every in-flight request consults it before making local admission
//! decisions, so one connection's upstream rejection throttles all of them.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::clock::Instant;

/// Shared, lock-free pause gate. Stored as raw `f64` bits behind an atomic so
/// reads never block a hot admission path.
#[derive(Debug, Default)]
pub struct Backpressure {
    paused_until_bits: AtomicU64,
}

impl Backpressure {
    pub fn new() -> Self {
        Self { paused_until_bits: AtomicU64::new(0) }
    }

    fn load(&self) -> f64 {
        f64::from_bits(self.paused_until_bits.load(Ordering::SeqCst))
    }

    /// Seconds remaining until the pause lifts, `0.0` if none is in effect.
    pub fn remaining(&self, now: Instant) -> f64 {
        (self.load() - now.0).max(0.0)
    }

    pub fn paused_until(&self) -> Instant {
        Instant(self.load())
    }

    /// Extend the global pause to `now + max(0, seconds)`. Implemented as a
    /// CAS loop taking the max of the current and candidate deadlines, so
    /// concurrent callers racing to set a pause can never move it backwards.
    pub fn pause(&self, seconds: f64, now: Instant) {
        if seconds <= 0.0 {
            return;
        }
        let candidate = now.0 + seconds;
        loop {
            let current_bits = self.paused_until_bits.load(Ordering::SeqCst);
            let current = f64::from_bits(current_bits);
            if candidate <= current {
                return;
            }
            let candidate_bits = candidate.to_bits();
            if self
                .paused_until_bits
                .compare_exchange(current_bits, candidate_bits, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return;
            }
            // Lost the race — retry with a fresh read of `current`.
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_pause_reports_zero_remaining() {
        let bp = Backpressure::new();
        assert_eq!(bp.remaining(Instant(100.0)), 0.0);
    }

    #[test]
    fn pause_reports_remaining_seconds() {
        let bp = Backpressure::new();
        bp.pause(5.0, Instant(10.0));
        assert!((bp.remaining(Instant(10.0)) - 5.0).abs() < 1e-9);
        assert!((bp.remaining(Instant(13.0)) - 2.0).abs() < 1e-9);
    }

    #[test]
    fn remaining_floors_at_zero_once_elapsed() {
        let bp = Backpressure::new();
        bp.pause(5.0, Instant(0.0));
        assert_eq!(bp.remaining(Instant(100.0)), 0.0);
    }

    #[test]
    fn pause_is_monotonic_non_decreasing() {
        let bp = Backpressure::new();
        bp.pause(10.0, Instant(0.0)); // paused_until = 10
        bp.pause(2.0, Instant(5.0)); // candidate = 7, shorter — ignored
        assert_eq!(bp.paused_until().0, 10.0);

        bp.pause(20.0, Instant(5.0)); // candidate = 25, longer — applied
        assert_eq!(bp.paused_until().0, 25.0);
    }

    #[test]
    fn non_positive_pause_is_a_no_op() {
        let bp = Backpressure::new();
        bp.pause(0.0, Instant(0.0));
        bp.pause(-5.0, Instant(0.0));
        assert_eq!(bp.paused_until().0, 0.0);
    }
}
