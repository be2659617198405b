//! Retry policy for queued operations.
//!
//! Exponential backoff keyed by an operation's retry count, with an attempt
//! cap after which the operation is given up on. The delay itself is
//! deterministic so "is this op due?" gives the same answer every time it is
//! asked; jitter is only added to the wake-up timer the caller schedules.

use std::time::Duration;

use crate::queue::PendingOperation;

/// Backoff and attempt-cap settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Delay after the first failed flush attempt.
    pub base_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
    /// Failed flush attempts before an operation is permanently failed.
    pub max_attempts: u32,
    /// Upper bound on the random jitter added to retry timers.
    pub jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            max_attempts: 5,
            jitter: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    /// Backoff before the next attempt of an operation that has already
    /// failed `retry_count` times.
    ///
    /// Formula: 0 for a fresh operation, otherwise
    /// min(max_delay, base_delay * 2^(retry_count - 1)).
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        if retry_count == 0 {
            return Duration::ZERO;
        }
        let factor = 2u32.saturating_pow((retry_count - 1).min(20));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Unix milliseconds at which the operation becomes due again.
    pub fn next_attempt_at(&self, op: &PendingOperation) -> u64 {
        match op.last_attempt_at {
            Some(last) if op.retry_count > 0 => {
                last.saturating_add(self.delay_for(op.retry_count).as_millis() as u64)
            }
            _ => 0,
        }
    }

    /// Whether the operation may be attempted at `now_ms`.
    pub fn is_due(&self, op: &PendingOperation, now_ms: u64) -> bool {
        now_ms >= self.next_attempt_at(op)
    }

    /// Time left until the operation is due (zero if already due).
    pub fn remaining(&self, op: &PendingOperation, now_ms: u64) -> Duration {
        Duration::from_millis(self.next_attempt_at(op).saturating_sub(now_ms))
    }

    /// Whether `retry_count` failures exhaust the attempt budget.
    pub fn exhausted(&self, retry_count: u32) -> bool {
        retry_count >= self.max_attempts
    }

    /// Add random jitter in `0..=jitter` to a timer delay.
    pub fn jittered(&self, delay: Duration) -> Duration {
        let jitter_ms = self.jitter.as_millis() as u64;
        if jitter_ms == 0 {
            return delay;
        }
        delay.saturating_add(Duration::from_millis(
            random_u64() % jitter_ms.saturating_add(1),
        ))
    }
}

fn random_u64() -> u64 {
    let mut bytes = [0u8; 8];
    getrandom::getrandom(&mut bytes).expect("getrandom failed");
    u64::from_le_bytes(bytes)
}
