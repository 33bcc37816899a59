//! Retry with exponential backoff for provider calls.

use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::RetrySettings;
use crate::error::ApiError;

/// Backoff policy derived from [`RetrySettings`].
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    max_attempts: u32,
    initial: Duration,
    max: Duration,
    multiplier: f64,
}

/// Result of a retried call.
#[derive(Debug)]
pub struct RetryOutcome<T> {
    /// Final result.
    pub result: Result<T, ApiError>,
    /// Number of attempts made.
    pub attempts: u32,
    /// Whether retrying stopped because of cancellation.
    pub cancelled: bool,
}

impl RetryPolicy {
    /// Creates a policy from engine settings.
    #[must_use]
    pub fn from_settings(settings: &RetrySettings) -> Self {
        Self {
            max_attempts: settings.max_attempts.max(1),
            initial: settings.initial_backoff(),
            max: settings.max_backoff(),
            multiplier: settings.multiplier.max(1.0),
        }
    }

    /// Returns the maximum number of attempts.
    #[must_use]
    pub const fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay after failed attempt number `attempt` (1-based).
    ///
    /// `initial * multiplier^(attempt - 1)`, capped at the maximum. A
    /// throttling hint from the provider replaces the computed delay.
    #[must_use]
    pub fn delay_for(&self, attempt: u32, hint: Option<Duration>) -> Duration {
        if let Some(hint) = hint {
            return hint;
        }
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let scaled = self.initial.as_secs_f64() * self.multiplier.powi(exponent);
        if !scaled.is_finite() || scaled >= self.max.as_secs_f64() {
            return self.max;
        }
        Duration::from_secs_f64(scaled)
    }

    /// Runs `call` until it succeeds, fails permanently, runs out of
    /// attempts, or `cancel` fires during a backoff sleep.
    pub async fn run<T, F, Fut>(&self, label: &str, cancel: &CancellationToken, mut call: F) -> RetryOutcome<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ApiError>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let err = match call().await {
                Ok(value) => {
                    return RetryOutcome {
                        result: Ok(value),
                        attempts: attempt,
                        cancelled: false,
                    };
                }
                Err(e) => e,
            };

            if !err.is_transient() || attempt >= self.max_attempts {
                return RetryOutcome {
                    result: Err(err),
                    attempts: attempt,
                    cancelled: false,
                };
            }

            let delay = self.delay_for(attempt, err.retry_after_ms().map(Duration::from_millis));
            warn!(
                "{label}: attempt {attempt}/{} failed ({err}), retrying in {}ms",
                self.max_attempts,
                delay.as_millis()
            );

            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = cancel.cancelled() => {
                    debug!("{label}: cancelled during backoff");
                    return RetryOutcome {
                        result: Err(err),
                        attempts: attempt,
                        cancelled: true,
                    };
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_settings(&RetrySettings::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio_test::{assert_err, assert_ok};

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::from_settings(&RetrySettings {
            max_attempts,
            initial_backoff_ms: 1,
            max_backoff_ms: 5,
            multiplier: 2.0,
        })
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let p = RetryPolicy::from_settings(&RetrySettings {
            max_attempts: 10,
            initial_backoff_ms: 100,
            max_backoff_ms: 1000,
            multiplier: 2.0,
        });
        assert_eq!(p.delay_for(1, None), Duration::from_millis(100));
        assert_eq!(p.delay_for(2, None), Duration::from_millis(200));
        assert_eq!(p.delay_for(4, None), Duration::from_millis(800));
        assert_eq!(p.delay_for(5, None), Duration::from_millis(1000));
        assert_eq!(p.delay_for(60, None), Duration::from_millis(1000));
        assert_eq!(
            p.delay_for(1, Some(Duration::from_millis(3000))),
            Duration::from_millis(3000)
        );
    }

    #[tokio::test]
    async fn test_transient_then_success() {
        let calls = AtomicU32::new(0);
        let outcome = policy(5)
            .run("test", &CancellationToken::new(), || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(ApiError::network("reset"))
                } else {
                    Ok(42)
                }
            })
            .await;

        assert_eq!(assert_ok!(outcome.result), 42);
        assert_eq!(outcome.attempts, 3);
    }

    #[tokio::test]
    async fn test_permanent_is_not_retried() {
        let outcome: RetryOutcome<()> = policy(5)
            .run("test", &CancellationToken::new(), || async {
                Err(ApiError::permanent("bad request"))
            })
            .await;
        assert_eq!(outcome.attempts, 1);
        assert!(matches!(outcome.result, Err(ApiError::Permanent { .. })));
    }

    #[tokio::test]
    async fn test_attempts_are_bounded() {
        let outcome: RetryOutcome<()> = policy(3)
            .run("test", &CancellationToken::new(), || async {
                Err(ApiError::network("reset"))
            })
            .await;
        assert_eq!(outcome.attempts, 3);
        assert!(assert_err!(outcome.result).is_transient());
    }

    #[tokio::test]
    async fn test_cancel_during_backoff() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome: RetryOutcome<()> = policy(5)
            .run("test", &cancel, || async { Err(ApiError::network("reset")) })
            .await;
        assert!(outcome.cancelled);
        assert_eq!(outcome.attempts, 1);
    }
}
