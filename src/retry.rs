//! Attempt-bounded exponential backoff for transient infrastructure calls.

use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Backoff schedule: `initial * 2^attempt`, capped, for `max_attempts` tries.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub initial: Duration,
    pub max_attempts: u32,
    pub cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            initial: Duration::from_millis(100),
            max_attempts: 5,
            cap: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(16);
        let delay = self.initial.saturating_mul(1u32 << exponent);
        delay.min(self.cap)
    }
}

/// Run `operation` until it succeeds or the policy's attempts are exhausted,
/// returning the final error.
pub async fn retry_with_backoff<T, E, F, Fut>(
    policy: RetryPolicy,
    what: &str,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt: u32 = 0;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                attempt += 1;
                if attempt >= policy.max_attempts {
                    warn!(what, attempts = attempt, error = %e, "Giving up after final attempt");
                    return Err(e);
                }
                let delay = policy.delay_for(attempt - 1);
                warn!(
                    what,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Transient failure, backing off"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}
