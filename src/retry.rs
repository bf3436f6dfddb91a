//! Bounded retry with optional exponential backoff
//!
//! Every operation that talks to a native radio runs through [`run_with`]. The policy
//! counts attempts, not retries: `max_attempts = N` means at most N attempts and N-1
//! sleeps.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::ble::AggregateError;

/// Retry policy shared by all native operations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Maximum number of attempts (0 behaves like 1)
    pub max_attempts: u32,
    /// Delay before the first retry, in milliseconds
    pub delay_ms: u64,
    /// Double the delay after every retry
    pub exponential: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay_ms: 250,
            exponential: false,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay: Duration, exponential: bool) -> Self {
        Self {
            max_attempts,
            delay_ms: delay.as_millis() as u64,
            exponential,
        }
    }

    /// Single attempt, no delay
    pub fn once() -> Self {
        Self::new(1, Duration::ZERO, false)
    }

    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }

    /// Delay slept after failed attempt number `attempt` (1-based)
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let base = self.base_delay();
        if !self.exponential {
            return base;
        }
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        base.saturating_mul(factor)
    }
}

/// Why a retried operation gave up
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RetryError<E>
where
    E: std::fmt::Debug + std::fmt::Display,
{
    /// Every attempt failed
    #[error("{0}")]
    Exhausted(AggregateError<E>),

    /// A non-retryable error stopped the run; the last cause is the fatal one
    #[error("aborted after {} attempt(s)", causes.len())]
    Aborted { causes: Vec<E> },

    /// The cancellation signal fired between attempts
    #[error("cancelled after {attempts} attempt(s)")]
    Cancelled { attempts: u32, causes: Vec<E> },
}

impl<E: std::fmt::Debug + std::fmt::Display> RetryError<E> {
    pub fn causes(&self) -> &[E] {
        match self {
            RetryError::Exhausted(aggregate) => aggregate.causes(),
            RetryError::Aborted { causes } | RetryError::Cancelled { causes, .. } => causes,
        }
    }
}

/// Run `operation` under `policy`, retrying every failure
pub async fn run<T, E, F, Fut>(
    policy: &RetryPolicy,
    cancel: Option<&CancellationToken>,
    operation: F,
) -> Result<T, RetryError<E>>
where
    E: std::fmt::Debug + std::fmt::Display,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    run_with(policy, cancel, |_| true, operation).await
}

/// Run `operation` under `policy`, retrying only errors accepted by `is_retryable`
///
/// The closure receives the 1-based attempt number. No delay follows the final attempt,
/// and the cancellation signal is checked before every delay.
pub async fn run_with<T, E, F, Fut, P>(
    policy: &RetryPolicy,
    cancel: Option<&CancellationToken>,
    is_retryable: P,
    mut operation: F,
) -> Result<T, RetryError<E>>
where
    E: std::fmt::Debug + std::fmt::Display,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
{
    let attempts = policy.attempts();
    let mut causes = Vec::new();

    for attempt in 1..=attempts {
        let error = match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };

        let retryable = is_retryable(&error);
        tracing::debug!(attempt, attempts, retryable, "Attempt failed: {}", error);
        causes.push(error);

        if !retryable {
            return Err(RetryError::Aborted { causes });
        }
        if attempt == attempts {
            break;
        }

        if let Some(token) = cancel {
            if token.is_cancelled() {
                return Err(RetryError::Cancelled { attempts: attempt, causes });
            }
        }

        let delay = policy.delay_after(attempt);
        match cancel {
            Some(token) => {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = token.cancelled() => {
                        return Err(RetryError::Cancelled { attempts: attempt, causes });
                    }
                }
            }
            None => tokio::time::sleep(delay).await,
        }
    }

    tracing::warn!("Giving up after {} attempt(s)", causes.len());
    Err(RetryError::Exhausted(AggregateError::new(causes)))
}
