//! Executor error classification and retry with backoff
//!
//! The download manager treats every executor failure as retryable up to the
//! task's retry budget and re-queues without delay. Backoff and the
//! retryable/fatal split live here, on the executor side:
//! - [`ExecutorError`] tells transient failures from permanent ones
//! - [`RetryPolicy`] computes exponential backoff with optional jitter
//! - [`RetryingExecutor`] wraps any [`SubItemExecutor`] with that policy

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::core::executor::{ExecutionContext, SubItemExecutor};
use crate::core::models::{Item, SubItem};

/// Default base delay for exponential backoff
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(5);

/// Maximum delay cap for exponential backoff
pub const MAX_DELAY_CAP: Duration = Duration::from_secs(60);

/// Executor output fragments that mean retrying cannot help
pub const NON_RETRYABLE_PATTERNS: &[&str] = &[
    "Video unavailable",
    "Private video",
    "Deleted video",
    "This video is not available",
    "requested format not available",
    "Unsupported URL",
];

/// Failure reported by a [`SubItemExecutor`]
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutorError {
    #[error("{0}")]
    Retryable(String),

    #[error("{0}")]
    Fatal(String),

    #[error("Download cancelled")]
    Cancelled,
}

impl ExecutorError {
    /// Classify a raw failure message against [`NON_RETRYABLE_PATTERNS`]
    pub fn classify(message: impl Into<String>) -> Self {
        let message = message.into();
        if is_non_retryable_message(&message) {
            ExecutorError::Fatal(message)
        } else {
            ExecutorError::Retryable(message)
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, ExecutorError::Retryable(_))
    }
}

impl From<std::io::Error> for ExecutorError {
    fn from(err: std::io::Error) -> Self {
        ExecutorError::Retryable(err.to_string())
    }
}

impl From<anyhow::Error> for ExecutorError {
    fn from(err: anyhow::Error) -> Self {
        ExecutorError::classify(format!("{:#}", err))
    }
}

pub fn is_non_retryable_message(message: &str) -> bool {
    NON_RETRYABLE_PATTERNS
        .iter()
        .any(|pattern| message.contains(pattern))
}

/// Retry strategy configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    /// Base delay for exponential backoff
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    /// Backoff multiplier (typically 2.0 for exponential)
    pub backoff_multiplier: f64,
    /// Add random jitter to prevent thundering herd
    pub jitter_enabled: bool,
    /// Jitter factor (0.0 to 1.0)
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: MAX_DELAY_CAP,
            backoff_multiplier: 2.0,
            jitter_enabled: true,
            jitter_factor: 0.1,
        }
    }
}

impl RetryPolicy {
    /// Policy allowing `max_retries` attempts after the first
    pub fn with_max_retries(max_retries: u32) -> Self {
        Self {
            max_attempts: max_retries.saturating_add(1),
            ..Default::default()
        }
    }

    /// Delay to wait after failed attempt number `attempt` (1-based)
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let delay_ms =
            self.base_delay.as_millis() as f64 * self.backoff_multiplier.powi(exponent);
        let mut delay = Duration::from_millis(delay_ms.min(u64::MAX as f64) as u64);

        // Apply maximum delay cap
        if delay > self.max_delay {
            delay = self.max_delay;
        }

        if self.jitter_enabled {
            let jitter =
                delay.as_millis() as f64 * self.jitter_factor * (rand::random::<f64>() - 0.5);
            let jittered_delay = delay.as_millis() as i64 + jitter as i64;
            delay = Duration::from_millis(jittered_delay.max(0) as u64);
        }

        delay
    }
}

/// Wraps an executor and retries retryable failures with backoff
#[derive(Debug, Clone)]
pub struct RetryingExecutor<E> {
    inner: E,
    policy: RetryPolicy,
}

impl<E> RetryingExecutor<E> {
    pub fn new(inner: E, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn inner(&self) -> &E {
        &self.inner
    }
}

#[async_trait]
impl<E: SubItemExecutor> SubItemExecutor for RetryingExecutor<E> {
    async fn execute_sub_item(
        &self,
        ctx: &ExecutionContext,
        item: &Item,
        sub_item: &SubItem,
        output_dir: &Path,
    ) -> Result<(), ExecutorError> {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            if ctx.is_cancelled() {
                return Err(ExecutorError::Cancelled);
            }

            debug!(item_id = item.id, seq = sub_item.seq, attempt, "Executing sub-item");

            let err = match self
                .inner
                .execute_sub_item(ctx, item, sub_item, output_dir)
                .await
            {
                Ok(()) => {
                    if attempt > 1 {
                        info!(
                            item_id = item.id,
                            seq = sub_item.seq,
                            attempt,
                            "✅ Sub-item succeeded after retry"
                        );
                    }
                    return Ok(());
                }
                Err(err) => err,
            };

            if !err.is_retryable() {
                warn!(item_id = item.id, seq = sub_item.seq, error = %err, "Non-retryable executor error");
                return Err(err);
            }

            if attempt >= max_attempts {
                warn!(
                    item_id = item.id,
                    seq = sub_item.seq,
                    error = %err,
                    "All {} attempts exhausted",
                    max_attempts
                );
                return Err(err);
            }

            let delay = self.policy.calculate_delay(attempt);
            info!(
                item_id = item.id,
                seq = sub_item.seq,
                error = %err,
                "🔄 Retrying in {:?} (attempt {}/{})",
                delay,
                attempt + 1,
                max_attempts
            );

            tokio::select! {
                _ = ctx.cancel.cancelled() => return Err(ExecutorError::Cancelled),
                _ = sleep(delay) => {}
            }

            attempt += 1;
        }
    }
}
