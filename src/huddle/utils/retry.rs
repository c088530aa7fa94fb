use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;

/// Backoff stops growing once the delay reaches this.
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(60);

/// Bounded retry policy for writes that carry user-authored content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryConfig {
    /// Total attempts including the first one. Values below 1 are treated as 1.
    pub max_attempts: u32,

    /// Delay before the second attempt.
    pub initial_delay: Duration,

    /// Multiplier applied to the delay after every failed attempt. 0 keeps it constant.
    pub backoff_factor: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(200),
            backoff_factor: 2,
        }
    }
}

impl RetryConfig {
    /// A policy that makes exactly one attempt.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            backoff_factor: 0,
        }
    }
}

/// Errors that know whether another attempt could succeed.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

#[derive(Debug)]
pub enum GeneralRetryError<E: std::fmt::Display> {
    MaxRetriesExceeded {
        last_error: E,
        operation_description: String,
        attempts_made: u32,
    },
    NotRetryable {
        error: E,
        operation_description: String,
        attempts_made: u32,
    },
}

impl<E: std::fmt::Display> std::fmt::Display for GeneralRetryError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GeneralRetryError::MaxRetriesExceeded {
                last_error,
                operation_description,
                attempts_made,
            } => write!(
                f,
                "Operation '{}' failed after {} attempts. Last error: {}",
                operation_description, attempts_made, last_error
            ),
            GeneralRetryError::NotRetryable {
                error,
                operation_description,
                attempts_made,
            } => write!(
                f,
                "Operation '{}' failed permanently on attempt {}: {}",
                operation_description, attempts_made, error
            ),
        }
    }
}

pub async fn execute_with_retry<F, Fut, T, E>(
    operation_description: &str,
    config: &RetryConfig,
    mut attempt_fn: F,
    mut progress_fn: impl FnMut(u32, u32, Duration, &E),
) -> Result<T, GeneralRetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display + Retryable,
{
    let max_attempts = config.max_attempts.max(1);
    let mut current_delay_for_next_sleep = config.initial_delay;
    let mut attempt_num = 1;
    loop {
        match attempt_fn().await {
            Ok(result) => return Ok(result),
            Err(e) if !e.is_retryable() => {
                return Err(GeneralRetryError::NotRetryable {
                    error: e,
                    operation_description: operation_description.to_string(),
                    attempts_made: attempt_num,
                });
            }
            Err(e) if attempt_num >= max_attempts => {
                return Err(GeneralRetryError::MaxRetriesExceeded {
                    last_error: e,
                    operation_description: operation_description.to_string(),
                    attempts_made: attempt_num,
                });
            }
            Err(e) => {
                progress_fn(attempt_num, max_attempts, current_delay_for_next_sleep, &e);
                sleep(current_delay_for_next_sleep).await;
                if config.backoff_factor > 0 {
                    current_delay_for_next_sleep = current_delay_for_next_sleep
                        .checked_mul(config.backoff_factor)
                        .map_or(MAX_RETRY_DELAY, |delay| delay.min(MAX_RETRY_DELAY));
                }
                attempt_num += 1;
            }
        }
    }
}
