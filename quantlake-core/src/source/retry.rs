//! Retry policy: bounded attempts with exponential backoff and jitter.

use super::{FetchError, FetchErrorKind};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::thread;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    /// Fraction of the delay added as random jitter (0.0 disables it).
    pub jitter: f64,
    pub retry_on: Vec<FetchErrorKind>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
            multiplier: 2.0,
            jitter: 0.25,
            retry_on: vec![FetchErrorKind::Transient, FetchErrorKind::Timeout],
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no sleeping.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn is_retryable(&self, error: &FetchError) -> bool {
        self.retry_on.contains(&error.kind())
    }

    /// Backoff before attempt `attempt` (1-based retry count), without jitter.
    pub fn base_backoff(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(attempt.saturating_sub(1) as i32);
        let ms = (self.base_delay_ms as f64 * factor).min(self.max_delay_ms as f64);
        Duration::from_millis(ms as u64)
    }

    fn backoff_with_jitter(&self, attempt: u32) -> Duration {
        let base = self.base_backoff(attempt);
        if self.jitter <= 0.0 || base.is_zero() {
            return base;
        }
        let extra = rand::thread_rng().gen_range(0.0..=self.jitter) * base.as_millis() as f64;
        (base + Duration::from_millis(extra as u64)).min(Duration::from_millis(self.max_delay_ms))
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// attempts are exhausted. The last error is returned.
    pub fn run<T>(
        &self,
        mut op: impl FnMut(u32) -> Result<T, FetchError>,
    ) -> Result<T, FetchError> {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            if attempt > 0 {
                thread::sleep(self.backoff_with_jitter(attempt));
            }
            match op(attempt) {
                Ok(value) => return Ok(value),
                Err(e) if self.is_retryable(&e) && attempt + 1 < attempts => {
                    tracing::debug!(attempt = attempt + 1, error = %e, "retrying fetch");
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn fast() -> RetryPolicy {
        RetryPolicy {
            base_delay_ms: 1,
            max_delay_ms: 2,
            jitter: 0.0,
            ..RetryPolicy::default()
        }
    }

    #[test]
    fn backoff_grows_and_caps() {
        let policy = RetryPolicy {
            base_delay_ms: 100,
            max_delay_ms: 350,
            multiplier: 2.0,
            ..RetryPolicy::default()
        };
        assert_eq!(policy.base_backoff(1), Duration::from_millis(100));
        assert_eq!(policy.base_backoff(2), Duration::from_millis(200));
        assert_eq!(policy.base_backoff(3), Duration::from_millis(350));
    }

    #[test]
    fn transient_errors_are_retried_until_success() {
        let calls = Cell::new(0);
        let result = fast().run(|_| {
            calls.set(calls.get() + 1);
            if calls.get() < 3 {
                Err(FetchError::Transient("503".into()))
            } else {
                Ok(7)
            }
        });
        assert_eq!(result, Ok(7));
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn not_found_is_not_retried() {
        let calls = Cell::new(0);
        let result: Result<(), _> = fast().run(|_| {
            calls.set(calls.get() + 1);
            Err(FetchError::NotFound("gone".into()))
        });
        assert!(matches!(result, Err(FetchError::NotFound(_))));
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn attempts_are_bounded() {
        let calls = Cell::new(0);
        let result: Result<(), _> = fast().run(|_| {
            calls.set(calls.get() + 1);
            Err(FetchError::Transient("503".into()))
        });
        assert!(result.is_err());
        assert_eq!(calls.get(), 4);
    }

    #[test]
    fn policy_deserializes_with_defaults() {
        let policy: RetryPolicy = toml::from_str("max_attempts = 2\nretry_on = [\"transient\"]").unwrap();
        assert_eq!(policy.max_attempts, 2);
        assert_eq!(policy.retry_on, vec![FetchErrorKind::Transient]);
        assert_eq!(policy.base_delay_ms, 500);
    }
}
