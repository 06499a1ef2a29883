//! Rate-limit aware retry for gateway calls.
//!
//! Flood-control errors carry the server's wait, which is honoured exactly;
//! transient failures back off for a fixed span. Other errors are returned at once.

use crate::config::EngineTuning;
use crate::gateway::GatewayError;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Retry ceiling and backoff for gateway calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts before giving up.
    pub max_attempts: u32,
    /// Sleep after a transient failure.
    pub transient_backoff: Duration,
}

impl RetryPolicy {
    /// Policy from the engine tunables.
    #[must_use]
    pub const fn from_tuning(tuning: &EngineTuning) -> Self {
        Self {
            max_attempts: tuning.max_retries,
            transient_backoff: tuning.transient_backoff,
        }
    }

    /// Run `operation` until it succeeds, fails permanently or the ceiling is hit.
    ///
    /// # Errors
    ///
    /// Returns the last error when it is not retryable or attempts ran out.
    pub async fn run<T, F, Fut>(&self, label: &str, mut operation: F) -> Result<T, GatewayError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, GatewayError>>,
    {
        let mut attempt = 0;
        loop {
            let err = match operation().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            let wait = match &err {
                GatewayError::RateLimited { wait } => *wait,
                GatewayError::Transient(_) => self.transient_backoff,
                _ => return Err(err),
            };
            attempt += 1;
            warn!(
                operation = label,
                attempt,
                max_attempts = self.max_attempts,
                wait_ms = wait.as_millis(),
                error = %err,
                "Gateway call failed, backing off"
            );
            tokio::time::sleep(wait).await;
            if attempt >= self.max_attempts {
                debug!(operation = label, "Retry ceiling reached");
                return Err(err);
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_tuning(&EngineTuning::default())
    }
}
