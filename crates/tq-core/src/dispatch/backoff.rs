//! Exponential backoff between failed dispatch cycles.

use tq_common::Millis;

/// Retry window owned by the dispatcher.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackoffState {
    /// Consecutive failed cycles since the last success.
    pub attempt_count: u32,
    /// No opportunistic dispatch starts before this instant.
    pub next_retry_at: Option<Millis>,
}

impl BackoffState {
    /// Delay for the `attempt`-th consecutive failure:
    /// `min(base * 2^(attempt-1), cap)`.
    pub fn delay_for(attempt: u32, base_ms: u64, cap_ms: u64) -> u64 {
        let exponent = attempt.saturating_sub(1).min(63);
        base_ms
            .checked_mul(1u64 << exponent)
            .unwrap_or(u64::MAX)
            .min(cap_ms)
    }

    /// Record a failure at `now` and return the delay applied.
    pub fn advance(&mut self, now: Millis, base_ms: u64, cap_ms: u64) -> u64 {
        self.attempt_count = self.attempt_count.saturating_add(1);
        let delay = Self::delay_for(self.attempt_count, base_ms, cap_ms);
        let delay_ms = i64::try_from(delay).unwrap_or(i64::MAX);
        self.next_retry_at = Some(now.saturating_add(delay_ms));
        delay
    }

    pub fn reset(&mut self) {
        *self = BackoffState::default();
    }

    /// True while `now` is inside the retry window.
    pub fn is_blocking(&self, now: Millis) -> bool {
        self.next_retry_at.is_some_and(|at| now < at)
    }
}
