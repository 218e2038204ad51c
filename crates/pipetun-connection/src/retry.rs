//! Bounded retries with a fixed backoff

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::debug;

/// How often and how patiently an operation is retried
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total number of attempts, the first one included
    pub attempts: usize,
    /// Pause between two attempts
    pub backoff: Duration,
}

impl RetryPolicy {
    /// Policy for `retries` additional attempts after the first one
    pub fn retries(retries: usize, backoff: Duration) -> Self {
        Self {
            attempts: retries + 1,
            backoff,
        }
    }

    /// A single attempt, no retries
    pub fn once() -> Self {
        Self {
            attempts: 1,
            backoff: Duration::ZERO,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::retries(10, Duration::from_secs(1))
    }
}

/// Run `op` until it succeeds or the policy is exhausted
///
/// `op` receives the 1-based attempt number. The error of the last attempt
/// is returned.
pub async fn with_retry<T, E, F, Fut>(policy: RetryPolicy, mut op: F) -> Result<T, E>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let attempts = policy.attempts.max(1);
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < attempts => {
                debug!(
                    "Attempt {}/{} failed: {}. Retrying in {}ms",
                    attempt,
                    attempts,
                    e,
                    policy.backoff.as_millis()
                );
                sleep(policy.backoff).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
