//! Retry utility with exponential backoff

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Backoff schedule for consecutive failures.
///
/// Delays: `initial_delay`, `2 * initial_delay`, `4 * initial_delay`, ... capped at `max_delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Backoff {
    /// Attempts before giving up (at least 1)
    pub max_attempts: u32,

    /// Delay after the first failure, in milliseconds
    pub initial_delay_ms: u64,

    /// Upper bound for any single delay, in milliseconds
    pub max_delay_ms: u64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay_ms: 200,
            max_delay_ms: 30_000,
        }
    }
}

impl Backoff {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    /// Delay to wait after the given (1-based) failed attempt
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.saturating_sub(1)).unwrap_or(u64::MAX);
        let millis = self.initial_delay_ms.saturating_mul(factor);
        Duration::from_millis(millis).min(self.max_delay())
    }
}

/// Why [`retry_with_backoff`] gave up
#[derive(Debug, PartialEq, Eq)]
pub enum RetryError<E> {
    /// Every attempt failed; carries the last error
    Exhausted { attempts: u32, last: E },
    /// Cancelled while waiting between attempts
    Cancelled,
}

/// Retry an async operation with exponential backoff.
///
/// Returns `Ok` on first success, or the last `Err` after all attempts are exhausted.
/// Waiting between attempts stops early when `cancel` fires.
pub async fn retry_with_backoff<F, Fut, T, E>(
    operation_name: &str,
    backoff: &Backoff,
    cancel: &CancellationToken,
    mut f: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let max_attempts = backoff.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match f().await {
            Ok(val) => return Ok(val),
            Err(e) => {
                warn!(
                    "{} failed (attempt {}/{}): {}",
                    operation_name, attempt, max_attempts, e
                );
                if attempt >= max_attempts {
                    return Err(RetryError::Exhausted {
                        attempts: attempt,
                        last: e,
                    });
                }
                tokio::select! {
                    _ = cancel.cancelled() => return Err(RetryError::Cancelled),
                    _ = tokio::time::sleep(backoff.delay_after(attempt)) => {}
                }
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

    fn fast(max_attempts: u32) -> Backoff {
        Backoff {
            max_attempts,
            initial_delay_ms: 1,
            max_delay_ms: 5,
        }
    }

    #[tokio::test]
    async fn test_succeeds_first_try() {
        let cancel = CancellationToken::new();
        let result: Result<&str, RetryError<String>> =
            retry_with_backoff("test", &fast(3), &cancel, || async { Ok("done") }).await;
        assert_eq!(result.unwrap(), "done");
    }

    #[tokio::test]
    async fn test_succeeds_after_retries() {
        let cancel = CancellationToken::new();
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();
        let result: Result<&str, RetryError<String>> =
            retry_with_backoff("test", &fast(3), &cancel, move || {
                let counter = counter_clone.clone();
                async move {
                    let n = counter.fetch_add(1, Ordering::Relaxed);
                    if n < 2 {
                        Err(format!("fail #{}", n))
                    } else {
                        Ok("done")
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), "done");
        assert_eq!(counter.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn test_all_attempts_fail() {
        let cancel = CancellationToken::new();
        let result: Result<(), RetryError<String>> =
            retry_with_backoff("test", &fast(2), &cancel, || async {
                Err("always fails".to_string())
            })
            .await;
        assert_eq!(
            result.unwrap_err(),
            RetryError::Exhausted {
                attempts: 2,
                last: "always fails".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_cancel_stops_waiting() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let slow = Backoff {
            max_attempts: 10,
            initial_delay_ms: 60_000,
            max_delay_ms: 60_000,
        };
        let result: Result<(), RetryError<String>> =
            retry_with_backoff("test", &slow, &cancel, || async { Err("down".to_string()) }).await;
        assert_eq!(result.unwrap_err(), RetryError::Cancelled);
    }

    #[test]
    fn test_delay_schedule_is_capped() {
        let backoff = Backoff {
            max_attempts: 10,
            initial_delay_ms: 100,
            max_delay_ms: 1_000,
        };
        assert_eq!(backoff.delay_after(1), Duration::from_millis(100));
        assert_eq!(backoff.delay_after(2), Duration::from_millis(200));
        assert_eq!(backoff.delay_after(4), Duration::from_millis(800));
        assert_eq!(backoff.delay_after(5), Duration::from_millis(1_000));
        assert_eq!(backoff.delay_after(80), Duration::from_millis(1_000));
    }
}
