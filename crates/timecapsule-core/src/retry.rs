//! Bounded fixed-delay retry, used by the requeue and destroy paths.

use std::future::Future;
use std::time::Duration;

/// A fixed retry count with a fixed delay between attempts. No backoff
/// growth — both retried operations in the protocol use a flat schedule.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Maximum number of attempts. Treated as at least one.
    pub attempts: u32,
    /// Delay between consecutive attempts.
    pub delay: Duration,
}

impl RetryPolicy {
    pub const fn new(attempts: u32, delay: Duration) -> Self {
        Self { attempts, delay }
    }
}

impl Default for RetryPolicy {
    /// The requeue default: up to 100 attempts, 10 ms apart.
    fn default() -> Self {
        Self::new(100, Duration::from_millis(10))
    }
}

/// Run `op` until it succeeds or the policy is exhausted, sleeping
/// `policy.delay` between attempts. Returns the last error on exhaustion.
pub async fn retry_fixed<T, E, F, Fut>(policy: RetryPolicy, mut op: F) -> std::result::Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
{
    let attempts = policy.attempts.max(1);
    let mut last = None;

    for attempt in 0..attempts {
        if attempt > 0 {
            tokio::time::sleep(policy.delay).await;
        }
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) => last = Some(e),
        }
    }

    // `attempts >= 1`, so at least one Err was recorded.
    Err(last.expect("retry ran zero attempts"))
}
