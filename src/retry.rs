/// Retry with exponential backoff.
///
/// Transient failures are retried at the layer that detected them. The async
/// [`retry`] is used by the backup and batch layers; [`retry_blocking`] covers
/// the synchronous journal writes in the store.
use crate::error::{WeaveError, WeaveResult};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::{info, warn};

/// Bounded exponential backoff policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: usize,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 100,
            max_delay_ms: 5_000,
            factor: 2.0,
        }
    }
}

impl RetryPolicy {
    /// No retries at all.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Fast retry with minimal delays, for tests and tight loops.
    pub fn immediate(max_retries: usize) -> Self {
        Self {
            max_retries,
            initial_delay_ms: 1,
            max_delay_ms: 5,
            factor: 2.0,
        }
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: usize) -> Duration {
        let exp = self.factor.max(1.0).powi(attempt.saturating_sub(1) as i32);
        let millis = (self.initial_delay_ms as f64 * exp).min(self.max_delay_ms as f64);
        Duration::from_millis(millis as u64)
    }
}

/// Run `operation` until it succeeds, a non-transient error occurs, or the
/// policy's retries are used up.
///
/// Returns the value and the number of retries it took. Exhaustion surfaces
/// `RetryExhausted`; non-transient errors are returned unchanged.
pub async fn retry<F, Fut, T>(
    operation_name: &str,
    policy: &RetryPolicy,
    mut operation: F,
) -> Result<(T, usize), WeaveError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = WeaveResult<T>>,
{
    let mut retries = 0;
    loop {
        match operation().await {
            Ok(value) => {
                if retries > 0 {
                    info!("Operation '{}' succeeded after {} retries", operation_name, retries);
                }
                return Ok((value, retries));
            }
            Err(err) if !err.is_transient() => return Err(err),
            Err(err) => {
                if retries >= policy.max_retries {
                    return Err(WeaveError::RetryExhausted {
                        operation: operation_name.to_string(),
                        attempts: retries + 1,
                        last_error: err.to_string(),
                    });
                }
                retries += 1;
                let delay = policy.delay_for(retries);
                warn!(
                    "Operation '{}' failed (attempt {}/{}): {}. Retrying in {:?}",
                    operation_name,
                    retries,
                    policy.max_retries + 1,
                    err,
                    delay
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Blocking variant of [`retry`] for synchronous I/O paths.
pub fn retry_blocking<F, T>(operation_name: &str, policy: &RetryPolicy, mut operation: F) -> WeaveResult<T>
where
    F: FnMut() -> WeaveResult<T>,
{
    let mut retries = 0;
    loop {
        match operation() {
            Ok(value) => return Ok(value),
            Err(err) if !err.is_transient() => return Err(err),
            Err(err) => {
                if retries >= policy.max_retries {
                    return Err(WeaveError::RetryExhausted {
                        operation: operation_name.to_string(),
                        attempts: retries + 1,
                        last_error: err.to_string(),
                    });
                }
                retries += 1;
                warn!("Operation '{}' failed (attempt {}): {}", operation_name, retries, err);
                std::thread::sleep(policy.delay_for(retries));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_delay_grows_and_caps() {
        let policy = RetryPolicy {
            max_retries: 10,
            initial_delay_ms: 100,
            max_delay_ms: 1_000,
            factor: 2.0,
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for(10), Duration::from_millis(1_000));
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_transient_failures() {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&calls);
        let (value, retries) = retry("flaky", &RetryPolicy::immediate(5), move || {
            let c = Arc::clone(&c);
            async move {
                if c.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(WeaveError::Storage("busy".into()))
                } else {
                    Ok(7)
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(value, 7);
        assert_eq!(retries, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_exhausts() {
        let err = retry("always", &RetryPolicy::immediate(2), || async {
            Err::<(), _>(WeaveError::Storage("down".into()))
        })
        .await
        .unwrap_err();
        match err {
            WeaveError::RetryExhausted { attempts, .. } => assert_eq!(attempts, 3),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_structural_errors_not_retried() {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&calls);
        let err = retry("schema", &RetryPolicy::immediate(5), move || {
            c.fetch_add(1, Ordering::SeqCst);
            async {
                Err::<(), _>(WeaveError::InvalidRecipe {
                    recipe: "r".into(),
                    reason: "cycle".into(),
                })
            }
        })
        .await
        .unwrap_err();
        assert!(matches!(err, WeaveError::InvalidRecipe { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_retry_blocking() {
        let mut calls = 0;
        let value = retry_blocking("append", &RetryPolicy::immediate(3), || {
            calls += 1;
            if calls < 2 {
                Err(WeaveError::Storage("eagain".into()))
            } else {
                Ok(calls)
            }
        })
        .unwrap();
        assert_eq!(value, 2);
    }
}
