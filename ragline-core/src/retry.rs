use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Checkpoint, CheckpointMetadata, CheckpointStore, FailureMark, StoreError};

/// Bounded exponential backoff.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub multiplier: f64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 50,
            multiplier: 2.0,
            max_backoff_ms: 2_000,
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_initial_backoff(mut self, backoff: Duration) -> Self {
        self.initial_backoff_ms = backoff.as_millis() as u64;
        self
    }

    /// Delay before the attempt following failed attempt number `attempt` (1-based).
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let factor = self.multiplier.max(1.0).powi(exponent);
        let millis = (self.initial_backoff_ms as f64 * factor).min(self.max_backoff_ms as f64);
        Duration::from_millis(millis as u64)
    }

    fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

#[derive(Debug)]
pub struct Exhausted<E> {
    pub error: E,
    pub attempts: u32,
    pub retryable: bool,
}

/// Runs `operation` until it succeeds, fails with a non-retryable error, or the
/// policy's attempt budget is spent.
pub async fn retry_with_backoff<T, E, F, Fut>(
    policy: &RetryPolicy,
    label: &str,
    is_retryable: impl Fn(&E) -> bool,
    mut operation: F,
) -> Result<T, Exhausted<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let max = policy.attempts();
    let mut attempt = 1;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(error) => {
                let retryable = is_retryable(&error);
                if !retryable || attempt >= max {
                    return Err(Exhausted {
                        error,
                        attempts: attempt,
                        retryable,
                    });
                }
                let delay = policy.backoff_for(attempt);
                tracing::warn!(
                    operation = label,
                    attempt,
                    max_attempts = max,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "transient failure, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

/// Wraps a store so transient failures are retried with backoff before they surface.
pub struct RetryingStore<S> {
    inner: S,
    policy: RetryPolicy,
}

impl<S> RetryingStore<S> {
    pub fn new(inner: S, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }
}

fn surface(exhausted: Exhausted<StoreError>) -> StoreError {
    if exhausted.retryable {
        StoreError::RetriesExhausted {
            attempts: exhausted.attempts,
            last: exhausted.error.to_string(),
        }
    } else {
        exhausted.error
    }
}

#[async_trait::async_trait]
impl<S: CheckpointStore> CheckpointStore for RetryingStore<S> {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), StoreError> {
        retry_with_backoff(&self.policy, "checkpoint.save", StoreError::is_transient, || {
            self.inner.save(checkpoint)
        })
        .await
        .map_err(surface)
    }

    async fn load_latest(&self, run_id: &str) -> Result<Option<Checkpoint>, StoreError> {
        retry_with_backoff(
            &self.policy,
            "checkpoint.load_latest",
            StoreError::is_transient,
            || self.inner.load_latest(run_id),
        )
        .await
        .map_err(surface)
    }

    async fn load_at(&self, run_id: &str, step: u64) -> Result<Option<Checkpoint>, StoreError> {
        retry_with_backoff(&self.policy, "checkpoint.load_at", StoreError::is_transient, || {
            self.inner.load_at(run_id, step)
        })
        .await
        .map_err(surface)
    }

    async fn latest_for_conversation(
        &self,
        conversation_id: &str,
    ) -> Result<Option<Checkpoint>, StoreError> {
        retry_with_backoff(
            &self.policy,
            "checkpoint.latest_for_conversation",
            StoreError::is_transient,
            || self.inner.latest_for_conversation(conversation_id),
        )
        .await
        .map_err(surface)
    }

    async fn history(&self, run_id: &str) -> Result<Vec<CheckpointMetadata>, StoreError> {
        retry_with_backoff(&self.policy, "checkpoint.history", StoreError::is_transient, || {
            self.inner.history(run_id)
        })
        .await
        .map_err(surface)
    }

    async fn mark_failed(&self, mark: &FailureMark) -> Result<(), StoreError> {
        retry_with_backoff(&self.policy, "checkpoint.mark_failed", StoreError::is_transient, || {
            self.inner.mark_failed(mark)
        })
        .await
        .map_err(surface)
    }

    async fn failure(&self, run_id: &str) -> Result<Option<FailureMark>, StoreError> {
        retry_with_backoff(&self.policy, "checkpoint.failure", StoreError::is_transient, || {
            self.inner.failure(run_id)
        })
        .await
        .map_err(surface)
    }

    async fn clear_failure(&self, run_id: &str) -> Result<(), StoreError> {
        retry_with_backoff(
            &self.policy,
            "checkpoint.clear_failure",
            StoreError::is_transient,
            || self.inner.clear_failure(run_id),
        )
        .await
        .map_err(surface)
    }
}
