//! Bounded exponential backoff for calls to unreliable remote collaborators
//!
//! Unlike [`retry_on_lock`](super::retry_on_lock) this is attempt-bounded and
//! deadline-aware: the caller's deadline always wins over the retry schedule.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

/// Attempt count and delay schedule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl BackoffPolicy {
    pub fn new(max_attempts: u32, initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay,
            max_delay,
        }
    }

    /// Delay after the given failed attempt (1-based): initial * 2^(attempt-1), capped
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.initial_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Result of a retried operation
#[derive(Debug)]
pub enum RetryOutcome<T, E> {
    Success(T),
    /// Non-retryable error; returned on the attempt it occurred
    Fatal(E),
    /// Every attempt failed with a retryable error
    Exhausted { last_error: E, attempts: u32 },
    /// The caller's deadline expired before an attempt succeeded
    DeadlineExceeded { attempts: u32 },
}

/// Run `operation` until it succeeds, fails fatally, runs out of attempts,
/// or `deadline` passes.
pub async fn retry_with_backoff<F, Fut, T, E, R>(
    operation_name: &str,
    policy: BackoffPolicy,
    deadline: Option<Instant>,
    is_retryable: R,
    mut operation: F,
) -> RetryOutcome<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
    R: Fn(&E) -> bool,
{
    let mut attempt = 0u32;

    loop {
        attempt += 1;

        let result = match deadline {
            Some(deadline) => match tokio::time::timeout_at(deadline, operation()).await {
                Ok(result) => result,
                Err(_) => {
                    tracing::warn!(operation = operation_name, attempt, "Deadline expired during attempt");
                    return RetryOutcome::DeadlineExceeded { attempts: attempt };
                }
            },
            None => operation().await,
        };

        let err = match result {
            Ok(value) => {
                if attempt > 1 {
                    tracing::debug!(operation = operation_name, attempt, "Succeeded after retry");
                }
                return RetryOutcome::Success(value);
            }
            Err(err) => err,
        };

        if !is_retryable(&err) {
            tracing::warn!(operation = operation_name, attempt, error = %err, "Non-retryable failure");
            return RetryOutcome::Fatal(err);
        }

        if attempt >= policy.max_attempts {
            tracing::error!(
                operation = operation_name,
                attempts = attempt,
                error = %err,
                "Retry attempts exhausted"
            );
            return RetryOutcome::Exhausted {
                last_error: err,
                attempts: attempt,
            };
        }

        let delay = policy.delay_after(attempt);
        if let Some(deadline) = deadline {
            if Instant::now() + delay >= deadline {
                tracing::warn!(operation = operation_name, attempt, "Deadline leaves no room for another attempt");
                return RetryOutcome::DeadlineExceeded { attempts: attempt };
            }
        }

        tracing::warn!(
            operation = operation_name,
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "Retryable failure, backing off"
        );
        tokio::time::sleep(delay).await;
    }
}
