use std::{future::Future, time::Duration};

use log::warn;
use tokio::time::sleep;

use crate::errors::Result;

/// Bounded retry with a fixed delay between attempts.
/// Transient failures observed from cloud APIs (rate limits, connection
/// resets) usually clear within a few ticks, so the defaults stay small.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 6,
            delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Tighter bound for secondary lookups (e.g., resolving an instance id
    /// that a fulfillment poll just reported).
    pub fn quick() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_secs(2),
        }
    }
}

/// Runs "f" until it succeeds, the error is not retryable, or the attempt
/// bound is reached. The last error propagates unmodified.
pub async fn with_retries<T, F, Fut>(op: &str, policy: RetryPolicy, mut f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        match f().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_retryable() && attempt < policy.max_attempts => {
                warn!(
                    "'{}' failed ({}), retrying in {:?} [attempt {}/{}]",
                    op,
                    e.message(),
                    policy.delay,
                    attempt,
                    policy.max_attempts
                );
                sleep(policy.delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// RUST_LOG=debug cargo test --package hailstorm --lib -- retry::test_retries_until_success --exact --show-output
#[tokio::test]
async fn test_retries_until_success() {
    use crate::errors::Error;

    let _ = env_logger::builder().is_test(true).try_init();

    let policy = RetryPolicy {
        max_attempts: 5,
        delay: Duration::from_millis(1),
    };

    let mut calls: u32 = 0;
    let fetched = with_retries("flaky describe", policy, || {
        calls += 1;
        let n = calls;
        async move {
            if n < 3 {
                Err(Error::API {
                    message: String::from("request limit exceeded"),
                    is_retryable: true,
                })
            } else {
                Ok(n)
            }
        }
    })
    .await;
    assert_eq!(fetched.unwrap(), 3);
    assert_eq!(calls, 3);
}

/// RUST_LOG=debug cargo test --package hailstorm --lib -- retry::test_fatal_error_not_retried --exact --show-output
#[tokio::test]
async fn test_fatal_error_not_retried() {
    use crate::errors::Error;

    let _ = env_logger::builder().is_test(true).try_init();

    let mut calls: u32 = 0;
    let ret: Result<u32> = with_retries("bad params", RetryPolicy::default(), || {
        calls += 1;
        async move {
            Err(Error::API {
                message: String::from("InvalidParameterValue"),
                is_retryable: false,
            })
        }
    })
    .await;
    assert!(!ret.unwrap_err().is_retryable());
    assert_eq!(calls, 1);
}

/// RUST_LOG=debug cargo test --package hailstorm --lib -- retry::test_attempt_bound_exhausted --exact --show-output
#[tokio::test]
async fn test_attempt_bound_exhausted() {
    use crate::errors::Error;

    let _ = env_logger::builder().is_test(true).try_init();

    let policy = RetryPolicy {
        max_attempts: 3,
        delay: Duration::from_millis(1),
    };

    let mut calls: u32 = 0;
    let ret: Result<u32> = with_retries("always throttled", policy, || {
        calls += 1;
        async move {
            Err(Error::API {
                message: String::from("throttled"),
                is_retryable: true,
            })
        }
    })
    .await;
    assert!(ret.unwrap_err().is_retryable());
    assert_eq!(calls, 3);
}
