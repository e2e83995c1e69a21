//! Retry policy: exponential backoff over transient errors only.
//!
//! Each attempt is a whole operation (connection bring-up included), so a
//! retried upload or download re-handshakes and picks up its resume offset.

use crate::error::ClientError;
use std::future::Future;
use std::time::Duration;

/// Retry policy for whole operations.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts (first try included)
    pub attempts: u32,
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Ceiling on the backoff
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Policy with the given attempt count and default backoff.
    #[must_use]
    pub fn with_attempts(attempts: u32) -> Self {
        Self {
            attempts: attempts.max(1),
            ..Self::default()
        }
    }

    /// Delay before retry number `retry` (0-based), doubling from
    /// `base_delay` up to `max_delay`.
    #[must_use]
    pub fn delay(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Run `op` up to `policy.attempts` times, backing off between attempts.
/// Permanent errors propagate immediately.
///
/// # Errors
///
/// The last error once attempts are exhausted, or the first permanent one.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, mut op: F) -> Result<T, ClientError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, ClientError>>,
{
    let mut attempt = 0;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt + 1 < policy.attempts => {
                let delay = policy.delay(attempt);
                tracing::debug!(
                    attempt = attempt + 1,
                    attempts = policy.attempts,
                    ?delay,
                    %err,
                    "transient failure, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
