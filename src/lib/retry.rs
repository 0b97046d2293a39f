use std::{ops::RangeInclusive, time::Duration};

use metrics::counter;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::StoreError;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_BACKOFF_MS: u64 = 50;

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

fn default_backoff_ms() -> u64 {
    DEFAULT_BACKOFF_MS
}

/// Budget for re-read-and-retry loops around conditional writes.
///
/// Callers drive the loop themselves:
///
/// ```ignore
/// for attempt in retry.attempts() {
///     match write_once().await {
///         Err(err) if err.is_precondition_failed() => retry.backoff(attempt, path).await,
///         other => return other,
///     }
/// }
/// Err(retry.exhausted(path))
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Linear backoff step; attempt `n` waits `n * backoff_ms`.
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff_ms: DEFAULT_BACKOFF_MS,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff_ms: u64) -> Self {
        Self {
            max_attempts,
            backoff_ms,
        }
    }

    /// Policy without sleeps, for tests and offline tools.
    pub fn immediate(max_attempts: u32) -> Self {
        Self::new(max_attempts, 0)
    }

    pub fn attempts(&self) -> RangeInclusive<u32> {
        1..=self.max_attempts.max(1)
    }

    /// Records a lost race and waits before the next attempt. No wait after
    /// the final attempt.
    pub async fn backoff(&self, attempt: u32, path: &str) {
        counter!("bucketdb_conditional_retries_total", 1);
        debug!(path, attempt, "conditional write lost a race; re-reading");
        if attempt >= self.max_attempts || self.backoff_ms == 0 {
            return;
        }
        let delay = self.backoff_ms.saturating_mul(u64::from(attempt));
        tokio::time::sleep(Duration::from_millis(delay)).await;
    }

    pub fn exhausted(&self, path: &str) -> StoreError {
        StoreError::Conflict {
            path: path.to_string(),
            attempts: self.max_attempts.max(1),
        }
    }
}
