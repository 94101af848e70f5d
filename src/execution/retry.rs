use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Attempt budget and backoff for transient task failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: usize,
    pub base: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn new(attempts: usize, base: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            base,
        }
    }

    /// Wait after the `attempt`-th (1-based) failure: base, 2×base, 4×base, …
    pub fn delay(&self, attempt: usize) -> Duration {
        let shift = (attempt.max(1) - 1).min(16) as u32;
        self.base.saturating_mul(1u32 << shift)
    }

    pub fn has_next(&self, attempt: usize) -> bool {
        attempt < self.attempts
    }

    /// Sleeps out the backoff. Returns `false` if cancelled first.
    pub async fn backoff(&self, attempt: usize, cancel: &CancellationToken) -> bool {
        let wait = self.delay(attempt);
        debug!(attempt, wait_ms = wait.as_millis() as u64, "backing off before retry");
        tokio::select! {
            biased;
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(wait) => true,
        }
    }
}
