//! Monotonic time source used by every timing decision in the core.
//!
//! All admission, backoff, and pause math reads time through a [`Clock`]
//! rather than calling [`std::time::Instant::now`] directly. Production runs
//! on [`SystemClock`]; tests swap in [`FakeClock`] so deadline and backoff
//! behavior can be checked deterministically, without real sleeps.
//!
//! Wall-clock time is read nowhere in this module — only
//! [`crate::headers::parse_retry_seconds`] touches [`std::time::SystemTime`],
//! for `Retry-After` HTTP-date headers.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant as StdInstant};

/// A point in monotonic time, seconds since an arbitrary origin.
///
/// Stored as `f64` so bucket refill math (spec: "all math in double-precision
/// floats; times in seconds from a monotonic origin") never has to convert
/// back and forth between integer durations and fractional seconds.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct Instant(pub f64);

impl Instant {
    pub fn seconds_since(self, earlier: Instant) -> f64 {
        self.0 - earlier.0
    }

    pub fn add_secs(self, secs: f64) -> Instant {
        Instant(self.0 + secs)
    }
}

impl std::ops::Add<Duration> for Instant {
    type Output = Instant;
    fn add(self, rhs: Duration) -> Instant {
        Instant(self.0 + rhs.as_secs_f64())
    }
}

/// Monotonic time source + cancellable sleep primitive.
///
/// Object-safe so it can be held as `Arc<dyn Clock>` in shared state.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;

    /// Sleep for `secs` seconds, or return immediately for `secs <= 0`.
    ///
    /// Must be cancel-safe: dropping the returned future before it resolves
    /// must not leave any core state mutated.
    fn sleep<'a>(&'a self, secs: f64) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>>;
}

/// Production clock backed by `tokio::time`.
#[derive(Debug, Default)]
pub struct SystemClock {
    origin: StdInstant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self { origin: StdInstant::now() }
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant(self.origin.elapsed().as_secs_f64())
    }

    fn sleep<'a>(&'a self, secs: f64) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            if secs > 0.0 {
                tokio::time::sleep(Duration::from_secs_f64(secs)).await;
            }
        })
    }
}

/// Test clock advanced explicitly by the test driving it.
///
/// `sleep` does not actually suspend — it records the requested duration and
/// returns immediately, so property tests can simulate hours of elapsed time
/// in microseconds. Callers that need overlapping in-flight sleeps to
/// interleave should advance the clock between polls rather than relying on
/// real scheduling.
#[derive(Debug)]
pub struct FakeClock {
    now_bits: AtomicU64,
}

impl FakeClock {
    pub fn new() -> Self {
        Self { now_bits: AtomicU64::new(0) }
    }

    pub fn advance(&self, secs: f64) {
        let current = f64::from_bits(self.now_bits.load(Ordering::SeqCst));
        self.now_bits
            .store((current + secs).to_bits(), Ordering::SeqCst);
    }

    pub fn set(&self, secs: f64) {
        self.now_bits.store(secs.to_bits(), Ordering::SeqCst);
    }
}

impl Default for FakeClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for FakeClock {
    fn now(&self) -> Instant {
        Instant(f64::from_bits(self.now_bits.load(Ordering::SeqCst)))
    }

    fn sleep<'a>(&'a self, secs: f64) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            if secs > 0.0 {
                self.advance(secs);
            }
        })
    }
}
