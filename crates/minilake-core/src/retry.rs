//! Retry logic with exponential backoff
//!
//! Transient storage failures (connection resets, 5xx responses from the object
//! store, a storage write that failed before the commit landed) are retried a
//! bounded number of times. Which error kinds are eligible is part of the
//! policy itself, so callers pass an explicit [`RetryPolicy`] into the
//! ingestion and query services instead of relying on retries hidden in a
//! storage client.
//!
//! Schema errors, conflicts, configuration errors and query errors are never
//! retried, whatever the policy lists: retrying them either cannot succeed or
//! would act on stale state.
//!
//! # Example
//!
//! ```rust,ignore
//! use minilake_core::retry::{retry_async, RetryPolicy};
//!
//! let policy = RetryPolicy::default();
//! let table = retry_async(&policy, "open table", || async {
//!     open_latest_snapshot(&uri).await
//! })
//! .await?;
//! ```

use crate::error::{Error, ErrorCode, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

/// Retry policy configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts (0 disables retries)
    pub max_retries: usize,

    /// Initial backoff delay
    #[serde(with = "duration_ms")]
    pub initial_delay: Duration,

    /// Maximum backoff delay (caps exponential growth)
    #[serde(with = "duration_ms")]
    pub max_delay: Duration,

    /// Multiplier for exponential backoff (typically 2.0)
    pub backoff_multiplier: f64,

    /// Random jitter applied to each delay (0.0-1.0)
    pub jitter_factor: f64,

    /// Error kinds eligible for retry
    pub retry_on: Vec<ErrorCode>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
            retry_on: vec![ErrorCode::ConnectionError, ErrorCode::StorageWriteError],
        }
    }
}

impl RetryPolicy {
    /// Aggressive retry policy for flaky networks
    pub fn aggressive() -> Self {
        Self {
            max_retries: 5,
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            jitter_factor: 0.2,
            ..Self::default()
        }
    }

    /// Conservative retry policy for interactive callers
    pub fn conservative() -> Self {
        Self {
            max_retries: 2,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
            ..Self::default()
        }
    }

    /// Never retry
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            retry_on: Vec::new(),
            ..Self::default()
        }
    }

    /// Calculate backoff delay for a given attempt
    pub fn backoff_delay(&self, attempt: usize) -> Duration {
        let base_delay =
            self.initial_delay.as_millis() as f64 * self.backoff_multiplier.powi(attempt as i32);

        let capped_delay = base_delay.min(self.max_delay.as_millis() as f64);

        // Jitter: random value between (1 - jitter) and (1 + jitter)
        let jitter = 1.0 + (rand::random::<f64>() * 2.0 - 1.0) * self.jitter_factor;
        let final_delay = (capped_delay * jitter) as u64;

        Duration::from_millis(final_delay)
    }

    /// Whether `error` may be retried under this policy
    pub fn should_retry(&self, error: &Error) -> bool {
        error.is_retryable() && self.retry_on.contains(&error.code())
    }
}

/// Retry an async operation with exponential backoff
///
/// Returns the first success, or the last error once the policy declines to
/// retry (ineligible error kind or attempts exhausted). The error kind is
/// never rewritten, so callers can still match on it.
pub async fn retry_async<F, Fut, T>(
    policy: &RetryPolicy,
    operation_name: &str,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut attempts = 0;
    let mut total_delay = Duration::from_secs(0);

    loop {
        attempts += 1;

        match operation().await {
            Ok(result) => {
                if attempts > 1 {
                    debug!(
                        "{} succeeded after {} attempts (total delay: {:?})",
                        operation_name, attempts, total_delay
                    );
                }
                return Ok(result);
            }
            Err(error) => {
                if !policy.should_retry(&error) {
                    return Err(error);
                }

                if attempts > policy.max_retries {
                    warn!(
                        "{} failed after {} attempts (total delay: {:?}): {}",
                        operation_name, attempts, total_delay, error
                    );
                    return Err(error);
                }

                let delay = policy.backoff_delay(attempts - 1);
                total_delay += delay;

                debug!(
                    "{} failed (attempt {}/{}), retrying after {:?}: {}",
                    operation_name,
                    attempts,
                    policy.max_retries + 1,
                    delay,
                    error
                );

                tokio::time::sleep(delay).await;
            }
        }
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn fast_policy(max_retries: usize) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_secs(1),
            jitter_factor: 0.0,
            ..RetryPolicy::default()
        }
    }

    #[test]
    fn test_retry_policy_default() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_retries, 3);
        assert_eq!(policy.initial_delay, Duration::from_millis(100));
        assert!(policy.retry_on.contains(&ErrorCode::ConnectionError));
    }

    #[test]
    fn test_retry_policy_aggressive() {
        let policy = RetryPolicy::aggressive();
        assert_eq!(policy.max_retries, 5);
        assert_eq!(policy.initial_delay, Duration::from_millis(50));
    }

    #[test]
    fn test_backoff_delay_exponential() {
        let policy = RetryPolicy {
            max_retries: 5,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            jitter_factor: 0.0,
            ..RetryPolicy::default()
        };

        // With multiplier 2.0: 100ms, 200ms, 400ms
        assert_eq!(policy.backoff_delay(0), Duration::from_millis(100));
        assert_eq!(policy.backoff_delay(1), Duration::from_millis(200));
        assert_eq!(policy.backoff_delay(2), Duration::from_millis(400));
    }

    #[test]
    fn test_backoff_delay_capped() {
        let policy = RetryPolicy {
            max_retries: 10,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
            jitter_factor: 0.0,
            ..RetryPolicy::default()
        };

        assert_eq!(policy.backoff_delay(10), Duration::from_secs(5));
    }

    #[test]
    fn test_should_retry_respects_eligible_kinds() {
        let policy = RetryPolicy {
            retry_on: vec![ErrorCode::ConnectionError],
            ..RetryPolicy::default()
        };
        assert!(policy.should_retry(&Error::connection("reset by peer")));
        assert!(!policy.should_retry(&Error::StorageWrite("503".into())));

        // Listing a non-retryable kind does not make it retryable
        let policy = RetryPolicy {
            retry_on: vec![ErrorCode::WriteConflict, ErrorCode::SchemaMismatch],
            ..RetryPolicy::default()
        };
        assert!(!policy.should_retry(&Error::WriteConflict("lost".into())));
        assert!(!policy.should_retry(&Error::schema_mismatch("narrowing")));

        assert!(!RetryPolicy::none().should_retry(&Error::connection("refused")));
    }

    #[tokio::test]
    async fn test_retry_async_succeeds_first_try() {
        let policy = RetryPolicy::default();
        let counter = Arc::new(Mutex::new(0));
        let counter_clone = Arc::clone(&counter);

        let result = retry_async(&policy, "reachability", || {
            let counter = Arc::clone(&counter_clone);
            async move {
                *counter.lock().unwrap() += 1;
                Ok::<i32, Error>(42)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(*counter.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_retry_async_succeeds_after_retries() {
        let policy = fast_policy(3);
        let counter = Arc::new(Mutex::new(0));
        let counter_clone = Arc::clone(&counter);

        let result = retry_async(&policy, "reachability", || {
            let counter = Arc::clone(&counter_clone);
            async move {
                let mut count = counter.lock().unwrap();
                *count += 1;
                if *count < 3 {
                    Err(Error::connection("connection reset"))
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(*counter.lock().unwrap(), 3);
    }

    #[tokio::test]
    async fn test_retry_async_exhausts_retries() {
        let policy = fast_policy(2);
        let counter = Arc::new(Mutex::new(0));
        let counter_clone = Arc::clone(&counter);

        let result = retry_async(&policy, "reachability", || {
            let counter = Arc::clone(&counter_clone);
            async move {
                *counter.lock().unwrap() += 1;
                Err::<i32, Error>(Error::connection("endpoint unreachable"))
            }
        })
        .await;

        assert!(matches!(result, Err(Error::Connection(_))));
        assert_eq!(*counter.lock().unwrap(), 3); // max_retries + 1
    }

    #[tokio::test]
    async fn test_retry_async_never_retries_conflicts() {
        let policy = fast_policy(5);
        let counter = Arc::new(Mutex::new(0));
        let counter_clone = Arc::clone(&counter);

        let result = retry_async(&policy, "commit", || {
            let counter = Arc::clone(&counter_clone);
            async move {
                *counter.lock().unwrap() += 1;
                Err::<i32, Error>(Error::WriteConflict("version moved".into()))
            }
        })
        .await;

        assert!(matches!(result, Err(Error::WriteConflict(_))));
        assert_eq!(*counter.lock().unwrap(), 1);
    }

    #[test]
    fn test_policy_deserializes_with_defaults() {
        let policy: RetryPolicy =
            serde_json::from_str(r#"{"max_retries": 1, "initial_delay": 250}"#).unwrap();
        assert_eq!(policy.max_retries, 1);
        assert_eq!(policy.initial_delay, Duration::from_millis(250));
        assert_eq!(policy.max_delay, Duration::from_secs(30));
        assert_eq!(policy.retry_on.len(), 2);
    }
}
