//! Exponential backoff for transient substrate failures.
//!
//! Only transient outcomes are retried; conflicts and permanent failures
//! are returned immediately. Each call is bounded by the configured driver
//! timeout, and a timeout counts as a transient outcome.

use std::future::Future;
use std::time::Duration;

use tracing::debug;

use super::{Applied, DriverError};
use crate::config::ReconcileConfig;

/// Backoff parameters for driver calls.
#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    /// Total attempts, including the first.
    pub max_attempts: u32,

    /// Delay before the first retry.
    pub initial_delay: Duration,

    /// Cap for exponential growth.
    pub max_delay: Duration,
}

impl RetryConfig {
    pub fn new(max_attempts: u32, initial_delay: Duration, max_delay: Duration) -> Self {
        RetryConfig {
            max_attempts,
            initial_delay,
            max_delay,
        }
    }

    /// Delay after the given failed attempt (0-indexed): doubles each
    /// time, capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        (self.initial_delay * factor).min(self.max_delay)
    }
}

impl From<&ReconcileConfig> for RetryConfig {
    fn from(config: &ReconcileConfig) -> Self {
        RetryConfig::new(config.max_attempts, config.initial_backoff, config.max_backoff)
    }
}

/// Terminal result of a retried driver call.
#[derive(Debug)]
pub enum RetryOutcome {
    /// The call succeeded on some attempt.
    Success {
        applied: Applied,
        attempts: u32,
    },

    /// Every attempt hit a transient failure.
    Exhausted {
        last_error: DriverError,
        attempts: u32,
    },

    /// A non-transient failure ended the retry loop early.
    Fatal {
        error: DriverError,
        attempts: u32,
    },
}

/// Runs `operation` with exponential backoff on transient failures.
///
/// The closure receives the 1-based attempt number so callers can emit a
/// structured record per attempt.
pub async fn retry_with_backoff<F, Fut>(config: RetryConfig, mut operation: F) -> RetryOutcome
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<Applied, DriverError>>,
{
    let max_attempts = config.max_attempts.max(1);

    for attempt in 1..=max_attempts {
        match operation(attempt).await {
            Ok(applied) => {
                return RetryOutcome::Success { applied, attempts: attempt };
            }
            Err(error) if error.is_transient() => {
                if attempt == max_attempts {
                    return RetryOutcome::Exhausted {
                        last_error: error,
                        attempts: attempt,
                    };
                }
                let delay = config.delay_for_attempt(attempt - 1);
                debug!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Transient failure, backing off"
                );
                tokio::time::sleep(delay).await;
            }
            Err(error) => {
                return RetryOutcome::Fatal { error, attempts: attempt };
            }
        }
    }

    unreachable!("loop returns on the final attempt")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::DriverResponse;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_config(max_attempts: u32) -> RetryConfig {
        RetryConfig::new(max_attempts, Duration::from_millis(1), Duration::from_millis(4))
    }

    #[test]
    fn delay_doubles_and_caps() {
        let config = RetryConfig::new(5, Duration::from_millis(100), Duration::from_millis(350));
        assert_eq!(config.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(config.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(config.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(config.delay_for_attempt(10), Duration::from_millis(350));
    }

    #[tokio::test]
    async fn success_on_first_attempt() {
        let outcome = retry_with_backoff(fast_config(3), |_| async {
            Ok(Applied::Ok(DriverResponse::Deleted))
        })
        .await;
        match outcome {
            RetryOutcome::Success { attempts, .. } => assert_eq!(attempts, 1),
            other => panic!("expected success, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn transient_then_success() {
        let calls = AtomicU32::new(0);
        let outcome = retry_with_backoff(fast_config(3), |_| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(DriverError::Transient("rate limited".into()))
                } else {
                    Ok(Applied::Ok(DriverResponse::Deleted))
                }
            }
        })
        .await;
        match outcome {
            RetryOutcome::Success { attempts, .. } => assert_eq!(attempts, 2),
            other => panic!("expected success, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn transient_exhausts_budget() {
        let calls = AtomicU32::new(0);
        let outcome = retry_with_backoff(fast_config(3), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(DriverError::Transient("still down".into())) }
        })
        .await;
        match outcome {
            RetryOutcome::Exhausted { attempts, .. } => {
                assert_eq!(attempts, 3);
                assert_eq!(calls.load(Ordering::SeqCst), 3);
            }
            other => panic!("expected exhaustion, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn conflict_is_not_retried() {
        let calls = AtomicU32::new(0);
        let outcome = retry_with_backoff(fast_config(5), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(DriverError::Conflict("name taken".into())) }
        })
        .await;
        match outcome {
            RetryOutcome::Fatal { error, attempts } => {
                assert_eq!(attempts, 1);
                assert_eq!(calls.load(Ordering::SeqCst), 1);
                assert!(matches!(error, DriverError::Conflict(_)));
            }
            other => panic!("expected fatal, got {other:?}"),
        }
    }
}
