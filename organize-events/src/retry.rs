//! Bounded retries with exponential backoff.
//!
//! Used by background workers for writes that may fail transiently, such as
//! persisting an audit record while the store is briefly unreachable.
//!
//! # Example
//!
//! ```rust,no_run
//! use organize_events::retry::{retry_if, RetryPolicy};
//!
//! async fn example() -> Result<(), String> {
//!     retry_if(
//!         &RetryPolicy::default(),
//!         || async { Err("offline".to_string()) },
//!         |err: &String| err == "offline",
//!     )
//!     .await
//! }
//! ```

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

/// How often and how patiently to retry.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub max_attempts: u32,

    /// Pause before the second attempt
    pub initial_delay: Duration,

    /// Upper bound for any single pause
    pub max_delay: Duration,

    /// Growth factor applied to the pause after every failure
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Pause to take after `failures` consecutive failures.
    ///
    /// Never panics: a negative product means no pause and NaN means the cap.
    pub fn delay_after(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(32) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        Duration::try_from_secs_f64(secs.min(self.max_delay.as_secs_f64()).max(0.0))
            .unwrap_or(Duration::ZERO)
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or runs
/// out of attempts. The last error is returned.
pub async fn retry_if<F, Fut, T, E, P>(policy: &RetryPolicy, mut op: F, mut retryable: P) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: FnMut(&E) -> bool,
{
    let mut failures = 0;

    loop {
        match op().await {
            Ok(value) => {
                if failures > 0 {
                    tracing::info!(attempts = failures + 1, "Operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(e) if !retryable(&e) => {
                tracing::debug!(error = %e, "Error is not retryable");
                return Err(e);
            }
            Err(e) => {
                failures += 1;
                if failures >= policy.max_attempts {
                    tracing::error!(attempts = failures, error = %e, "Retry attempts exhausted");
                    return Err(e);
                }

                let delay = policy.delay_after(failures);
                tracing::warn!(
                    attempt = failures,
                    max_attempts = policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Attempt failed, retrying"
                );
                sleep(delay).await;
            }
        }
    }
}
