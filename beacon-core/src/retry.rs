//! Retry engine with exponential backoff.
//!
//! An operation reports each attempt as [`Attempt::Success`],
//! [`Attempt::Retryable`] or [`Attempt::Fatal`]. Retryable failures are
//! retried after `base_delay * 2^attempt` (capped at `max_delay`), or after the
//! server-supplied wait when the error carries one. Every attempt is bounded
//! by `timeout`; an attempt that overruns counts as a retryable network
//! timeout. When attempts run out the last error is returned.

use beacon_common::{Error, HttpPolicyConfig, Result, MAX_RETRY_DELAY_S};
use std::future::Future;
use std::time::Duration;

/// Retry settings for one transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Bound on a single attempt.
    pub timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            timeout: Duration::from_secs(20),
        }
    }
}

impl From<&HttpPolicyConfig> for RetryPolicy {
    fn from(config: &HttpPolicyConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: delay_from_secs(config.base_delay_s),
            max_delay: delay_from_secs(config.max_delay_s),
            timeout: Duration::from_secs(config.timeout_s),
        }
    }
}

/// Seconds clamped into `0..=MAX_RETRY_DELAY_S`; NaN counts as zero.
fn delay_from_secs(seconds: f64) -> Duration {
    let seconds = if seconds.is_nan() { 0.0 } else { seconds.clamp(0.0, MAX_RETRY_DELAY_S) };
    Duration::from_secs_f64(seconds)
}

impl RetryPolicy {
    /// Policy that never retries.
    pub fn once(timeout: Duration) -> Self {
        Self {
            max_attempts: 1,
            timeout,
            ..Self::default()
        }
    }

    /// Wait after the zero-based failed `attempt`.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = 2_u32.saturating_pow(attempt);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Outcome of one attempt.
#[derive(Debug)]
pub enum Attempt<T> {
    Success(T),
    Retryable(Error),
    Fatal(Error),
}

impl<T> Attempt<T> {
    /// Classify a result using [`Error::is_retryable`].
    pub fn from_result(result: Result<T>) -> Self {
        match result {
            Ok(value) => Attempt::Success(value),
            Err(e) if e.is_retryable() => Attempt::Retryable(e),
            Err(e) => Attempt::Fatal(e),
        }
    }
}

impl<T> From<Result<T>> for Attempt<T> {
    fn from(result: Result<T>) -> Self {
        Self::from_result(result)
    }
}

/// Run `operation` under `policy`.
///
/// The closure receives the zero-based attempt number.
pub async fn execute<T, F, Fut>(policy: &RetryPolicy, mut operation: F) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Attempt<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        let outcome = match tokio::time::timeout(policy.timeout, operation(attempt)).await {
            Ok(outcome) => outcome,
            Err(_) => Attempt::Retryable(Error::NetworkTimeout(format!(
                "attempt {} exceeded {:?}",
                attempt + 1,
                policy.timeout
            ))),
        };

        match outcome {
            Attempt::Success(value) => {
                if attempt > 0 {
                    tracing::info!(attempt = attempt + 1, "Operation recovered after retries");
                }
                return Ok(value);
            }
            Attempt::Fatal(e) => return Err(e),
            Attempt::Retryable(e) => {
                if attempt + 1 >= max_attempts {
                    tracing::warn!(
                        attempts = max_attempts,
                        error = %e,
                        "Retries exhausted"
                    );
                    return Err(e);
                }
                let delay = e.retry_after().unwrap_or_else(|| policy.backoff_delay(attempt));
                tracing::warn!(
                    attempt = attempt + 1,
                    max_attempts = max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Attempt failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tokio::time::Instant;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            timeout: Duration::from_secs(20),
        }
    }

    #[test]
    fn test_policy_from_config_clamps_delays() {
        let config = HttpPolicyConfig {
            base_delay_s: f64::NAN,
            max_delay_s: 1e300,
            ..HttpPolicyConfig::default()
        };
        let policy = RetryPolicy::from(&config);
        assert_eq!(policy.base_delay, Duration::ZERO);
        assert_eq!(policy.max_delay, Duration::from_secs(86_400));
    }

    fn unavailable() -> Error {
        Error::Server {
            status: 503,
            message: "unavailable".into(),
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_delay: Duration::from_secs(5),
            ..policy()
        };
        assert_eq!(policy.backoff_delay(0), Duration::from_secs(1));
        assert_eq!(policy.backoff_delay(1), Duration::from_secs(2));
        assert_eq!(policy.backoff_delay(2), Duration::from_secs(4));
        assert_eq!(policy.backoff_delay(3), Duration::from_secs(5));
        assert_eq!(policy.backoff_delay(40), Duration::from_secs(5));
    }

    #[test]
    fn test_policy_from_config() {
        let config = HttpPolicyConfig::default();
        let policy = RetryPolicy::from(&config);
        assert_eq!(policy.max_attempts, config.max_attempts);
        assert_eq!(policy.timeout, Duration::from_secs(config.timeout_s));
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_on_third_attempt() {
        let calls = Arc::new(AtomicU32::new(0));
        let start = Instant::now();

        let result = execute(&policy(), |_| {
            let calls = Arc::clone(&calls);
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Attempt::Retryable(unavailable())
                } else {
                    Attempt::Success("ok")
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), "ok");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // 1s after the first failure, 2s after the second.
        assert_eq!(start.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_returns_last_error() {
        let calls = Arc::new(AtomicU32::new(0));
        let result: Result<()> = execute(&policy(), |_| {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Attempt::Retryable(unavailable())
            }
        })
        .await;

        assert!(matches!(result, Err(Error::Server { status: 503, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_overrides_backoff() {
        let policy = RetryPolicy {
            base_delay: Duration::from_secs(10),
            ..policy()
        };
        let start = Instant::now();
        let result = execute(&policy, |attempt| async move {
            if attempt == 0 {
                Attempt::Retryable(Error::RateLimitedRemotely {
                    retry_after: Some(Duration::from_secs(2)),
                    message: "slow down".into(),
                })
            } else {
                Attempt::Success(attempt)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 1);
        assert_eq!(start.elapsed(), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_is_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let result: Result<()> = execute(&policy(), |_| {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Attempt::Fatal(Error::NotFound("video".into()))
            }
        })
        .await;

        assert!(matches!(result, Err(Error::NotFound(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_attempt_times_out_and_retries() {
        let policy = RetryPolicy {
            timeout: Duration::from_secs(5),
            ..policy()
        };
        let result = execute(&policy, |attempt| async move {
            if attempt == 0 {
                tokio::time::sleep(Duration::from_secs(30)).await;
            }
            Attempt::Success(attempt)
        })
        .await;
        assert_eq!(result.unwrap(), 1);
    }

    #[test]
    fn test_attempt_classification() {
        assert!(matches!(Attempt::from_result(Ok(1)), Attempt::Success(1)));
        assert!(matches!(
            Attempt::<()>::from_result(Err(unavailable())),
            Attempt::Retryable(_)
        ));
        assert!(matches!(
            Attempt::<()>::from_result(Err(Error::Validation("x".into()))),
            Attempt::Fatal(_)
        ));
    }
}
