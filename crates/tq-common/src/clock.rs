//! Wall-clock abstraction.
//!
//! All timestamps in telq are Unix epoch milliseconds. Components never call
//! `Utc::now()` directly; they read time through a shared [`Clock`] so tests
//! can drive TTL expiry and retry backoff deterministically.

use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

/// Unix epoch milliseconds.
pub type Millis = i64;

/// Source of wall-clock time.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Current time in epoch milliseconds.
    fn now_ms(&self) -> Millis;
}

/// System wall clock that never runs backwards.
///
/// If the OS clock steps back (NTP correction, manual change) the last
/// observed value is returned instead, so event timestamps stay monotonic.
#[derive(Debug, Default)]
pub struct SystemClock {
    last: AtomicI64,
}

impl SystemClock {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> Millis {
        let now = Utc::now().timestamp_millis();
        let prev = self.last.fetch_max(now, Ordering::SeqCst);
        prev.max(now)
    }
}

/// Shared handle to a fresh system clock.
pub fn system_clock() -> Arc<dyn Clock> {
    Arc::new(SystemClock::new())
}

/// Manually driven clock for tests and simulations.
#[derive(Debug)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(start_ms: Millis) -> Self {
        ManualClock {
            now: AtomicI64::new(start_ms),
        }
    }

    /// Jump to an absolute time.
    pub fn set(&self, now_ms: Millis) {
        self.now.store(now_ms, Ordering::SeqCst);
    }

    /// Move time forward by `ms` milliseconds.
    pub fn advance_ms(&self, ms: i64) {
        self.now.fetch_add(ms, Ordering::SeqCst);
    }

    /// Move time forward by a std duration.
    pub fn advance(&self, by: Duration) {
        self.advance_ms(by.as_millis() as i64);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        // 2026-01-01T00:00:00Z, far enough from zero that age math never underflows.
        ManualClock::new(1_767_225_600_000)
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> Millis {
        self.now.load(Ordering::SeqCst)
    }
}
