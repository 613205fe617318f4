use std::future::Future;
use std::time::Duration;

use rand::Rng;

use crate::errors::{ProviderError, RemoteError, Retryable};

/// Exponential backoff applied to provider and remote-store calls
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub max_retries: u32,
    /// Upper bound for a single attempt
    pub call_timeout: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            max_retries: 3,
            call_timeout: Duration::from_secs(30),
        }
    }
}

impl BackoffPolicy {
    /// Policy without waits, for callers that already run under a scheduler retry
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            multiplier: 1.0,
            max_retries,
            call_timeout: Duration::from_secs(30),
        }
    }

    /// Delay before retry number `attempt` (zero based), without jitter
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt as i32);
        let millis = (self.initial_delay.as_millis() as f64 * factor).min(self.max_delay.as_millis() as f64);
        Duration::from_millis(millis as u64)
    }

    fn jittered(&self, attempt: u32) -> Duration {
        let base = self.delay_for(attempt);
        if base.is_zero() {
            return base;
        }
        // Up to 10% jitter so parallel partitions do not retry in lockstep
        let spread = (base.as_millis() as u64 / 10).max(1);
        base + Duration::from_millis(rand::rng().random_range(0..spread))
    }
}

/// Errors that can stand in for an attempt that exceeded the call timeout
pub trait CallError: Retryable + std::fmt::Display + Sized {
    fn timed_out(after: Duration) -> Self;
}

impl CallError for ProviderError {
    fn timed_out(after: Duration) -> Self {
        ProviderError::Timeout(after.as_secs())
    }
}

impl CallError for RemoteError {
    fn timed_out(after: Duration) -> Self {
        RemoteError::Timeout(after.as_secs())
    }
}

/// Run `call` until it succeeds, fails with a non-retryable error, or the
/// retry budget is spent. Each attempt is bounded by the policy timeout.
pub async fn retry_with_backoff<T, E, F, Fut>(
    operation_name: &str,
    policy: &BackoffPolicy,
    mut call: F,
) -> Result<T, E>
where
    E: CallError,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 0u32;
    loop {
        let result = match tokio::time::timeout(policy.call_timeout, call()).await {
            Ok(result) => result,
            Err(_) => Err(E::timed_out(policy.call_timeout)),
        };

        match result {
            Ok(value) => {
                if attempt > 0 {
                    log::info!("{} succeeded after {} retries", operation_name, attempt);
                }
                return Ok(value);
            }
            Err(err) if err.is_retryable() && attempt < policy.max_retries => {
                let delay = policy.jittered(attempt);
                log::warn!(
                    "{} failed (attempt {}/{}): {}. Retrying in {:?}",
                    operation_name,
                    attempt + 1,
                    policy.max_retries + 1,
                    err,
                    delay
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => {
                if err.is_retryable() {
                    log::error!("{} giving up after {} attempts: {}", operation_name, attempt + 1, err);
                }
                return Err(err);
            }
        }
    }
}
