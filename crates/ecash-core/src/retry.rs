//! Exponential backoff bookkeeping for retryable tasks.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::constants::{
    RETRY_BACKOFF_FACTOR, RETRY_BASE_DELAY_MS, RETRY_MAX_DELAY_MS, RETRY_MAX_JITTER,
};
use crate::types::Timestamp;

/// Backoff schedule: `min(cap, base * factor^counter * (1 + jitter))`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    pub base_delay_ms: u64,
    pub backoff_factor: f64,
    pub max_jitter: f64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: RETRY_BASE_DELAY_MS,
            backoff_factor: RETRY_BACKOFF_FACTOR,
            max_jitter: RETRY_MAX_JITTER,
            max_delay_ms: RETRY_MAX_DELAY_MS,
        }
    }
}

impl RetryPolicy {
    /// Jitter bound actually applied.
    ///
    /// Kept below `factor - 1` so that a jittered delay never reaches the
    /// un-jittered delay of the next counter value.
    pub fn effective_max_jitter(&self) -> f64 {
        let headroom = (self.backoff_factor - 1.0).max(0.0);
        self.max_jitter.clamp(0.0, headroom * 0.99)
    }

    /// Delay before attempt number `retry_counter + 1`, for a jitter sample
    /// in `[0, 1)` scaled to the effective bound.
    pub fn delay_with_jitter(&self, retry_counter: u32, jitter_sample: f64) -> Duration {
        let jitter = jitter_sample.clamp(0.0, 1.0) * self.effective_max_jitter();
        let exp = i32::try_from(retry_counter).unwrap_or(i32::MAX);
        let raw = self.base_delay_ms as f64 * self.backoff_factor.max(1.0).powi(exp) * (1.0 + jitter);
        let capped = raw.min(self.max_delay_ms as f64);
        Duration::from_millis(capped as u64)
    }

    pub fn delay(&self, retry_counter: u32) -> Duration {
        let sample = rand::thread_rng().gen_range(0.0..1.0);
        self.delay_with_jitter(retry_counter, sample)
    }
}

/// Retry state persisted with every non-terminal task.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct RetryInfo {
    pub first_try: Timestamp,
    pub next_retry: Timestamp,
    pub retry_counter: u32,
}

impl RetryInfo {
    /// Fresh retry state, due immediately.
    pub fn initial(now: Timestamp) -> Self {
        Self {
            first_try: now,
            next_retry: now,
            retry_counter: 0,
        }
    }

    /// Record one more failure and schedule the next attempt.
    pub fn increment(&mut self, policy: &RetryPolicy, now: Timestamp) {
        self.retry_counter = self.retry_counter.saturating_add(1);
        self.next_retry = now.saturating_add(policy.delay(self.retry_counter));
    }

    pub fn is_due(&self, now: Timestamp) -> bool {
        self.next_retry <= now
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_delay_without_jitter() {
        let p = RetryPolicy::default();
        assert_eq!(p.delay_with_jitter(0, 0.0), Duration::from_millis(200));
        assert_eq!(p.delay_with_jitter(1, 0.0), Duration::from_millis(300));
        assert_eq!(p.delay_with_jitter(2, 0.0), Duration::from_millis(450));
    }

    #[test]
    fn worst_case_jitter_stays_below_next_step() {
        let p = RetryPolicy::default();
        for c in 0..20 {
            let hi = p.delay_with_jitter(c, 0.999_999);
            let next_lo = p.delay_with_jitter(c + 1, 0.0);
            assert!(hi < next_lo || next_lo.as_millis() as u64 == p.max_delay_ms);
        }
    }

    #[test]
    fn delay_is_capped() {
        let p = RetryPolicy::default();
        assert_eq!(p.delay_with_jitter(200, 0.5), Duration::from_millis(p.max_delay_ms));
        assert_eq!(p.delay(u32::MAX), Duration::from_millis(p.max_delay_ms));
    }

    #[test]
    fn jitter_bound_respects_factor() {
        let p = RetryPolicy { backoff_factor: 1.1, max_jitter: 0.5, ..RetryPolicy::default() };
        assert!(p.effective_max_jitter() < 0.1);
    }

    #[test]
    fn increment_schedules_in_future() {
        let p = RetryPolicy::default();
        let now = Timestamp::from_millis(10_000);
        let mut info = RetryInfo::initial(now);
        assert!(info.is_due(now));
        info.increment(&p, now);
        assert_eq!(info.retry_counter, 1);
        assert!(info.next_retry > now);
        assert!(!info.is_due(now));
        assert_eq!(info.first_try, now);
    }
}
