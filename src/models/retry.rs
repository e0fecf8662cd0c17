use std::time::Duration;

use chrono::{DateTime, Utc};

/// In-process retries for infrastructure writes (ledger settles).
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: u64,
}

/// Requeue policy for messages whose send failed transiently.
///
/// `delay(n) = min(base * 2^n, max) + uniform(0, jitter)`. The non-jittered
/// part only depends on `n`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_ms: u64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            jitter_ms: 1_000,
        }
    }
}

impl BackoffPolicy {
    pub fn base_delay(&self, retry_count: u32) -> Duration {
        let factor = 2u64.checked_pow(retry_count).unwrap_or(u64::MAX);
        let delay_ms = self
            .base_delay_ms
            .saturating_mul(factor)
            .min(self.max_delay_ms);

        Duration::from_millis(delay_ms)
    }

    /// Delay with an explicit jitter sample, clamped to the jitter window.
    pub fn delay_with_jitter(&self, retry_count: u32, jitter_ms: u64) -> Duration {
        self.base_delay(retry_count) + Duration::from_millis(jitter_ms.min(self.jitter_ms))
    }

    pub fn delay(&self, retry_count: u32) -> Duration {
        let jitter = if self.jitter_ms == 0 {
            0
        } else {
            rand::random_range(0..=self.jitter_ms)
        };

        self.delay_with_jitter(retry_count, jitter)
    }

    pub fn is_exhausted(&self, retry_count: u32) -> bool {
        retry_count >= self.max_retries
    }
}

/// When the next attempt of a requeued message becomes eligible.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetrySchedule {
    Immediate,
    DelayedUntil(DateTime<Utc>),
}

impl RetrySchedule {
    pub fn plan(now: DateTime<Utc>, delay: Duration, delayed: bool) -> Self {
        if !delayed || delay.is_zero() {
            return RetrySchedule::Immediate;
        }

        match chrono::Duration::from_std(delay) {
            Ok(delay) => RetrySchedule::DelayedUntil(now + delay),
            Err(_) => RetrySchedule::Immediate,
        }
    }

    pub fn not_before(&self) -> Option<DateTime<Utc>> {
        match self {
            RetrySchedule::Immediate => None,
            RetrySchedule::DelayedUntil(at) => Some(*at),
        }
    }

    /// Time left until the schedule is due, zero when already due.
    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        self.not_before()
            .and_then(|at| (at - now).to_std().ok())
            .unwrap_or(Duration::ZERO)
    }
}
