use std::future::Future;
use std::time::Duration;

use tracing::warn;

use super::failure::OperationError;
use crate::storage::StorageError;

/// Exponential backoff for throttled and transient storage failures.
///
/// Auth and not-found failures are returned on the first attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Attempts including the first one
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
}

impl RetryPolicy {
    /// Delay after the `attempt`-th failure (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let factor = self.multiplier.max(1.0).powi(exponent);
        let max_secs = self.max_backoff.as_secs_f64();
        let delay = (self.initial_backoff.as_secs_f64() * factor).min(max_secs);
        Duration::from_secs_f64(delay)
    }

    /// Run `operation` until it succeeds, fails permanently or runs out of attempts.
    pub async fn run<T, F, Fut>(&self, key: &str, mut operation: F) -> Result<T, OperationError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StorageError>>,
    {
        let mut attempt = 1;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(err) if !err.is_retryable() => return Err(OperationError::Storage(err)),
                Err(err) if attempt >= self.max_attempts => {
                    return Err(OperationError::RetriesExhausted {
                        attempts: attempt,
                        last: err,
                    })
                }
                Err(err) => {
                    let delay = self.backoff(attempt);
                    warn!(
                        "Attempt {}/{} for {} failed: {}; retrying in {:?}",
                        attempt, self.max_attempts, key, err, delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(5),
            multiplier: 2.0,
        }
    }
}
