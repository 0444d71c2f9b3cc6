use std::time::Duration;

use rand::Rng;

use crate::jobs::error_codes::{ErrorClass, JobError};
use crate::jobs::model::Job;

/// Backoff applied between a Failed attempt and the next Processing one.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub base: Duration,
    pub max: Duration,
    pub jitter_pct: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(2),
            max: Duration::from_secs(15 * 60),
            jitter_pct: 0.20,
        }
    }
}

impl RetryConfig {
    /// No delay at all; handy for tests.
    pub fn immediate() -> Self {
        Self {
            base: Duration::ZERO,
            max: Duration::ZERO,
            jitter_pct: 0.0,
        }
    }
}

/// A failed job goes back to the queue only for a transient error and
/// while its attempt budget lasts.
pub fn should_retry(job: &Job, err: &JobError) -> bool {
    err.class() == ErrorClass::Retryable && job.attempts_left()
}

pub fn next_delay(attempt_no: i32, cfg: &RetryConfig, rng: &mut impl Rng) -> Duration {
    let exp = (attempt_no.max(1) as u32).saturating_sub(1);
    let pow2 = 1_u64.checked_shl(exp).unwrap_or(u64::MAX);

    let base_ms = cfg.base.as_millis() as u64;
    let max_ms = cfg.max.as_millis() as u64;
    let delay_ms = base_ms.saturating_mul(pow2).min(max_ms);

    if delay_ms == 0 || cfg.jitter_pct <= 0.0 {
        return Duration::from_millis(delay_ms);
    }

    let jitter_range = (delay_ms as f64) * cfg.jitter_pct;
    let jitter = rng.gen_range(-jitter_range..=jitter_range);
    let jittered = (delay_ms as f64 + jitter).round().max(0.0) as u64;
    Duration::from_millis(jittered.min(max_ms))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::model::NewJob;
    use rand::{rngs::StdRng, SeedableRng};
    use serde_json::json;

    fn cfg(base_ms: u64, max_ms: u64) -> RetryConfig {
        RetryConfig {
            base: Duration::from_millis(base_ms),
            max: Duration::from_millis(max_ms),
            jitter_pct: 0.0,
        }
    }

    #[test]
    fn delay_doubles_then_caps() {
        let mut rng = StdRng::seed_from_u64(7);
        let c = cfg(100, 1_000);
        assert_eq!(next_delay(1, &c, &mut rng), Duration::from_millis(100));
        assert_eq!(next_delay(2, &c, &mut rng), Duration::from_millis(200));
        assert_eq!(next_delay(4, &c, &mut rng), Duration::from_millis(800));
        assert_eq!(next_delay(5, &c, &mut rng), Duration::from_millis(1_000));
        assert_eq!(next_delay(200, &c, &mut rng), Duration::from_millis(1_000));
    }

    #[test]
    fn jitter_stays_within_cap() {
        let mut rng = StdRng::seed_from_u64(42);
        let c = RetryConfig {
            base: Duration::from_millis(500),
            max: Duration::from_millis(600),
            jitter_pct: 0.5,
        };
        for attempt in 1..10 {
            assert!(next_delay(attempt, &c, &mut rng) <= Duration::from_millis(600));
        }
    }

    #[test]
    fn retry_needs_budget_and_transient_error() {
        let mut job = Job::pending(NewJob::new("echo", json!({})).max_attempts(3));
        job.attempts = 1;
        assert!(should_retry(&job, &JobError::msg("flaky")));
        assert!(!should_retry(&job, &JobError::bad_payload("nope")));

        job.attempts = 3;
        assert!(!should_retry(&job, &JobError::msg("flaky")));
    }
}
