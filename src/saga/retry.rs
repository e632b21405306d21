// Bounded retries for saga steps and compensations, exponential backoff with
// jitter. Each attempt runs under its own timeout; an attempt that times out
// is dropped, so the action's future never outlives it.

use serde_json::Value;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::time::timeout;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;
use tracing::{debug, warn};

use crate::config::SagaSettings;
use crate::observability::metrics;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptError {
    pub message: String,
    pub timed_out: bool,
    pub retryable: bool,
}

impl AttemptError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            timed_out: false,
            retryable: true,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            timed_out: false,
            retryable: false,
        }
    }

    fn timeout(after: Duration) -> Self {
        Self {
            message: format!("timed out after {}ms", after.as_millis()),
            timed_out: true,
            retryable: true,
        }
    }
}

/// Outcome after the last attempt failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryFailure {
    pub attempts: u32,
    pub error: AttemptError,
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub base_delay_ms: u64,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_settings(&SagaSettings::default())
    }
}

impl RetryPolicy {
    pub fn from_settings(settings: &SagaSettings) -> Self {
        Self {
            base_delay_ms: settings.backoff_base_ms,
            max_delay: Duration::from_millis(settings.backoff_max_ms),
            jitter: settings.jitter,
        }
    }

    /// Delays before each retry: base, 2*base, 4*base... capped at `max_delay`.
    pub fn delays(&self, retries: u32) -> Vec<Duration> {
        let use_jitter = self.jitter;
        ExponentialBackoff::from_millis(2)
            .factor((self.base_delay_ms / 2).max(1))
            .max_delay(self.max_delay)
            .take(retries as usize)
            .map(|delay| if use_jitter { jitter(delay) } else { delay })
            .collect()
    }

    /// Run `op` once plus up to `retries` more times while it fails with a
    /// retryable error. Returns the value and the number of attempts made.
    pub async fn run<F, Fut>(
        &self,
        label: &str,
        retries: u32,
        attempt_timeout: Duration,
        mut op: F,
    ) -> Result<(Value, u32), RetryFailure>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<Value, AttemptError>>,
    {
        let attempts = AtomicU32::new(0);
        let counter = &attempts;

        let result = RetryIf::start(
            self.delays(retries),
            || {
                let attempt = counter.fetch_add(1, Ordering::SeqCst) + 1;
                if attempt > 1 {
                    metrics().record_step_retry();
                    debug!(label = %label, attempt, "Retrying");
                }
                let fut = op(attempt);
                async move {
                    match timeout(attempt_timeout, fut).await {
                        Ok(result) => result,
                        Err(_) => Err(AttemptError::timeout(attempt_timeout)),
                    }
                }
            },
            |error: &AttemptError| {
                if error.retryable {
                    warn!(label = %label, error = %error.message, "Attempt failed");
                }
                error.retryable
            },
        )
        .await;

        let attempts = attempts.load(Ordering::SeqCst);
        result
            .map(|value| (value, attempts))
            .map_err(|error| RetryFailure { attempts, error })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicU32;
    use std::sync::Arc;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            base_delay_ms: 100,
            max_delay: Duration::from_millis(1_000),
            jitter: false,
        }
    }

    #[test]
    fn test_delays_double_and_cap() {
        let delays = policy().delays(5);
        let millis: Vec<u128> = delays.iter().map(|d| d.as_millis()).collect();
        assert_eq!(millis, [100, 200, 400, 800, 1_000]);
        assert!(policy().delays(0).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let seen = Arc::clone(&calls);
        let result = policy()
            .run("flaky", 3, Duration::from_secs(1), move |_attempt| {
                let n = seen.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(AttemptError::retryable("carrier busy"))
                    } else {
                        Ok(json!({"ok": true}))
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), (json!({"ok": true}), 3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausts_retries() {
        let result = policy()
            .run("broken", 2, Duration::from_secs(1), |_attempt| async {
                Err::<Value, _>(AttemptError::retryable("down"))
            })
            .await;

        let failure = result.unwrap_err();
        assert_eq!(failure.attempts, 3);
        assert_eq!(failure.error.message, "down");
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_error_stops_immediately() {
        let result = policy()
            .run("invalid", 5, Duration::from_secs(1), |_attempt| async {
                Err::<Value, _>(AttemptError::permanent("bad input"))
            })
            .await;

        assert_eq!(result.unwrap_err().attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_timeout_is_a_failure() {
        let result = policy()
            .run("slow", 0, Duration::from_millis(50), |_attempt| async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok::<_, AttemptError>(json!(null))
            })
            .await;

        let failure = result.unwrap_err();
        assert_eq!(failure.attempts, 1);
        assert!(failure.error.timed_out);
    }
}
