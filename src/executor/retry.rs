use std::future::Future;
use std::time::Duration;

use crate::providers::ProviderError;
use crate::resource::ResourceId;

/// Bounded retry with exponential backoff for transient provider errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub timeout: Option<Duration>,
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based).
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.saturating_sub(1));
        self.initial_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }

    /// Delay before retrying after `error`. A wait requested by the remote
    /// side is honored when it exceeds the backoff, up to `max_backoff`.
    pub fn delay(&self, retry: u32, error: &ProviderError) -> Duration {
        let backoff = self.backoff(retry);
        error
            .retry_after()
            .map_or(backoff, |requested| requested.max(backoff))
            .min(self.max_backoff)
    }

    /// Runs `call` until it succeeds, fails permanently or runs out of retries.
    ///
    /// Returns the final result and the number of attempts made. A timed-out
    /// attempt is not retried.
    pub async fn run<T, F, Fut>(&self, resource: &ResourceId, mut call: F) -> (Result<T, ProviderError>, u32)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = match self.timeout {
                Some(limit) => tokio::time::timeout(limit, call())
                    .await
                    .unwrap_or_else(|_| Err(ProviderError::Timeout(limit))),
                None => call().await,
            };

            match result {
                Err(e) if e.is_retryable() && attempt <= self.max_retries => {
                    let delay = self.delay(attempt, &e);
                    tracing::warn!(
                        resource = %resource,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transient provider error, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                other => return (other, attempt),
            }
        }
    }
}
