//! Retrying remote operations with bounded exponential backoff.
//!
//! Every wait in the provider goes through here so that it honours the
//! operation's cancellation token.

use std::future::Future;
use std::time::Duration;

use backoff::ExponentialBackoff;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{ProviderError, Result};

/// Shape of a retry loop.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub initial_interval: Duration,
    pub max_interval: Duration,
    /// Total time budget; the last error is returned once it is spent.
    pub max_elapsed: Duration,
    pub multiplier: f64,
    pub randomization_factor: f64,
}

impl RetryPolicy {
    /// Pool join convergence and ejects: intervals capped at 10s, 5 minutes overall.
    pub const fn convergence() -> Self {
        Self {
            initial_interval: Duration::from_millis(500),
            max_interval: Duration::from_secs(10),
            max_elapsed: Duration::from_secs(5 * 60),
            multiplier: 1.5,
            randomization_factor: 0.5,
        }
    }

    /// Constant `interval` between attempts, giving up after roughly `retries` retries.
    pub fn fixed(interval: Duration, retries: u32) -> Self {
        Self {
            initial_interval: interval,
            max_interval: interval,
            max_elapsed: interval * retries,
            multiplier: 1.0,
            randomization_factor: 0.0,
        }
    }

    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            current_interval: self.initial_interval,
            initial_interval: self.initial_interval,
            randomization_factor: self.randomization_factor,
            multiplier: self.multiplier,
            max_interval: self.max_interval,
            max_elapsed_time: Some(self.max_elapsed),
            ..ExponentialBackoff::default()
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::convergence()
    }
}

/// Retry `op` until it succeeds or the policy's budget is spent.
///
/// Only [`ProviderError::Cancelled`] stops the loop early.
pub async fn retry<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    what: &str,
    op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    retry_if(policy, cancel, what, |_| true, op).await
}

/// Retry `op` while `is_transient` accepts its error.
pub async fn retry_if<T, F, Fut, P>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    what: &str,
    is_transient: P,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
    P: Fn(&ProviderError) -> bool,
{
    let classify = &is_transient;
    let operation = || {
        let attempt = op();
        async move {
            attempt.await.map_err(|e| {
                if !matches!(e, ProviderError::Cancelled(_)) && classify(&e) {
                    backoff::Error::transient(e)
                } else {
                    backoff::Error::permanent(e)
                }
            })
        }
    };
    let notify = |err: ProviderError, delay: Duration| {
        debug!(what, error = %err, delay_ms = delay.as_millis() as u64, "retrying");
    };

    tokio::select! {
        _ = cancel.cancelled() => Err(ProviderError::Cancelled(what.to_string())),
        result = backoff::future::retry_notify(policy.backoff(), operation, notify) => result,
    }
}

/// Sleep for `delay` unless the operation is cancelled first.
pub async fn pause(cancel: &CancellationToken, delay: Duration, what: &str) -> Result<()> {
    tokio::select! {
        _ = cancel.cancelled() => Err(ProviderError::Cancelled(what.to_string())),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast() -> RetryPolicy {
        RetryPolicy {
            initial_interval: Duration::from_millis(5),
            max_interval: Duration::from_millis(10),
            max_elapsed: Duration::from_millis(200),
            multiplier: 1.5,
            randomization_factor: 0.0,
        }
    }

    fn flaky(what: &str) -> ProviderError {
        ProviderError::NotFound {
            what: "host",
            detail: what.to_string(),
        }
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let attempts = AtomicU32::new(0);
        let value = retry(&fast(), &CancellationToken::new(), "flaky", || async {
            if attempts.fetch_add(1, Ordering::SeqCst) < 3 {
                Err(flaky("not yet"))
            } else {
                Ok(7)
            }
        })
        .await
        .unwrap();
        assert_eq!(value, 7);
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn returns_last_error_when_budget_is_spent() {
        let attempts = AtomicU32::new(0);
        let err = retry(&fast(), &CancellationToken::new(), "never", || async {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(flaky(&format!("attempt {n}")))
        })
        .await
        .unwrap_err();
        let n = attempts.load(Ordering::SeqCst);
        assert!(n > 1);
        assert!(err.to_string().contains(&format!("attempt {}", n - 1)));
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let attempts = AtomicU32::new(0);
        let err = retry_if(
            &fast(),
            &CancellationToken::new(),
            "permanent",
            |_| false,
            || async {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(flaky("boom"))
            },
        )
        .await
        .unwrap_err();
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert!(matches!(err, ProviderError::NotFound { .. }));
    }

    #[tokio::test]
    async fn cancellation_interrupts_the_loop() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let slow = RetryPolicy {
            initial_interval: Duration::from_secs(30),
            max_interval: Duration::from_secs(30),
            max_elapsed: Duration::from_secs(600),
            ..fast()
        };
        let err = retry(&slow, &cancel, "slow wait", || async {
            Err::<(), _>(flaky("later"))
        })
        .await
        .unwrap_err();
        assert!(matches!(err, ProviderError::Cancelled(w) if w == "slow wait"));
    }

    #[tokio::test]
    async fn pause_honours_cancellation() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = pause(&cancel, Duration::from_secs(60), "settle")
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Cancelled(_)));
    }
}
