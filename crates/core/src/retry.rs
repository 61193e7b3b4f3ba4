use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::RetryConfig;
use crate::{Error, Result};

/// Bounded-attempt exponential backoff, without jitter.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_backoff: Duration::from_millis(config.base_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
        }
    }

    /// Delay to wait after the given failed attempt (1-based):
    /// `min(base * 2^(attempt-1), max)`.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = 1u32
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.base_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

/// Runs `operation` until it succeeds, fails with a non-retryable error, or
/// `max_attempts` is reached. Exhaustion is reported as
/// [`Error::RetriesExhausted`] carrying `context` and the last error.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    context: &str,
    cancel: Option<&CancellationToken>,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        if let Some(cancel) = cancel
            && cancel.is_cancelled()
        {
            return Err(Error::Cancelled);
        }

        let err = match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if !e.is_retryable() => return Err(e),
            Err(e) => e,
        };

        warn!(
            event = "retry.attempt_failed",
            context,
            attempt,
            max_attempts,
            error = %err,
            "retry.attempt_failed"
        );

        if attempt >= max_attempts {
            return Err(Error::RetriesExhausted {
                context: context.to_string(),
                attempts: attempt,
                message: err.to_string(),
            });
        }

        let delay = policy.backoff_delay(attempt);
        match cancel {
            Some(cancel) => {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(Error::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            None => tokio::time::sleep(delay).await,
        }
    }
}
