//! Convergence polling and transient-error backoff for backend calls.
//!
//! Both loops are plain futures: dropping them (for example because the
//! calling request was cancelled) stops them at the next await point.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use super::CloudError;

/// How often and for how long to wait for backend state to converge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            timeout: Duration::from_secs(300),
        }
    }
}

/// Bounded exponential backoff for transient backend failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(8),
        }
    }
}

/// Run `probe` every `policy.interval` until it reports `true`.
///
/// Errors from `probe` end the loop immediately.  If the predicate still
/// does not hold after `policy.timeout`, returns [`CloudError::Timeout`]
/// naming `what`.
pub async fn poll_until<F, Fut>(what: &str, policy: PollPolicy, mut probe: F) -> Result<(), CloudError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool, CloudError>>,
{
    let start = Instant::now();
    let deadline = start + policy.timeout;
    loop {
        if probe().await? {
            debug!(what, elapsed = ?start.elapsed(), "backend state converged");
            return Ok(());
        }
        let now = Instant::now();
        if now >= deadline {
            return Err(CloudError::Timeout {
                what: what.to_owned(),
                elapsed: now - start,
            });
        }
        tokio::time::sleep(policy.interval.min(deadline - now)).await;
    }
}

/// Run `op`, retrying transient failures with exponential backoff.
pub async fn with_backoff<T, F, Fut>(what: &str, policy: RetryPolicy, mut op: F) -> Result<T, CloudError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, CloudError>>,
{
    let mut backoff = policy.initial_backoff;
    let mut attempt = 1;
    loop {
        match op().await {
            Err(e) if e.is_transient() && attempt < policy.max_attempts => {
                warn!(what, attempt, error = %e, ?backoff, "transient backend failure, retrying");
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(policy.max_backoff);
                attempt += 1;
            }
            other => return other,
        }
    }
}
