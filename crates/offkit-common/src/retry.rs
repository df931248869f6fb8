//! Retry and timeout utilities for network work.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::OffkitError;

/// Retry configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of attempts (1 = no retries).
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub initial_delay: Duration,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
    /// Backoff multiplier (2.0 doubles each time).
    pub backoff_multiplier: f64,
    /// Add up to 25% random jitter to delays.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// A single attempt.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Calculate delay for a given attempt (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }

        let base = self.initial_delay.as_secs_f64()
            * self.backoff_multiplier.powi((attempt - 2) as i32);
        let delay = Duration::from_secs_f64(base.min(self.max_delay.as_secs_f64()));

        if self.jitter {
            let factor: f64 = rand::thread_rng().gen_range(0.0..0.25);
            delay + delay.mul_f64(factor)
        } else {
            delay
        }
    }
}

/// Retry a fallible async operation with exponential backoff.
///
/// Returns the last error once `max_attempts` is exhausted. A config with
/// `max_attempts == 0` still runs the operation once.
pub async fn retry_with_backoff<T, E, F, Fut>(config: &RetryConfig, mut operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let attempts = config.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(attempt, "Operation succeeded after retries");
                }
                return Ok(value);
            }
            Err(e) if attempt >= attempts => {
                warn!(attempt, max_attempts = attempts, error = %e, "Giving up");
                return Err(e);
            }
            Err(e) => {
                warn!(attempt, max_attempts = attempts, error = %e, "Operation failed");
                attempt += 1;
                let delay = config.delay_for_attempt(attempt);
                debug!(attempt, ?delay, "Retrying after delay");
                sleep(delay).await;
            }
        }
    }
}

/// Run a future with a deadline.
pub async fn with_timeout<T, Fut>(timeout: Duration, operation: Fut) -> Result<T, OffkitError>
where
    Fut: Future<Output = T>,
{
    tokio::time::timeout(timeout, operation)
        .await
        .map_err(|_| OffkitError::Timeout(timeout))
}
