//! Origin Module
//!
//! Wraps a blob-store handle with bounded retries and backoff. Only
//! transport errors are retried; a negative lookup is a definitive answer
//! and is returned immediately. Range and conditional predicates pass
//! through untouched, so the origin decides 206 and 304 semantics.

use crate::stores::{BlobFetch, BlobStore, FetchOptions};
use crate::{GatewayError, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Retry policy for origin fetches
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_retries: u32,
    /// Base delay between attempts
    pub retry_delay: Duration,
    /// Double the delay after each failed attempt
    pub exponential_backoff: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: Duration::from_millis(100),
            exponential_backoff: true,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-indexed)
    fn delay_for(&self, retry: u32) -> Duration {
        if self.exponential_backoff {
            self.retry_delay * 2u32.saturating_pow(retry - 1)
        } else {
            self.retry_delay
        }
    }
}

/// Origin client: a blob-store handle plus a retry policy
pub struct OriginClient {
    store: Arc<dyn BlobStore>,
    policy: RetryPolicy,
}

impl OriginClient {
    pub fn new(store: Arc<dyn BlobStore>, policy: RetryPolicy) -> Self {
        Self { store, policy }
    }

    /// Fetch `key` from the origin, retrying transport errors with backoff
    pub async fn fetch(&self, key: &str, opts: FetchOptions) -> Result<BlobFetch> {
        let mut last_error = GatewayError::OriginTransport("no attempts made".to_string());

        for attempt in 1..=self.policy.max_retries {
            match self.store.fetch(key, opts.clone()).await {
                Ok(result) => {
                    if attempt > 1 {
                        debug!(key, attempt, "origin fetch succeeded after retry");
                    }
                    return Ok(result);
                }
                Err(e) => {
                    warn!(key, attempt, error = %e, "origin fetch failed");
                    last_error = e;
                    if attempt < self.policy.max_retries {
                        tokio::time::sleep(self.policy.delay_for(attempt)).await;
                    }
                }
            }
        }

        Err(GatewayError::OriginTransport(last_error.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn exponential_delays_double() {
        let policy = RetryPolicy {
            max_retries: 4,
            retry_delay: Duration::from_millis(100),
            exponential_backoff: true,
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(400));
    }

    #[test]
    fn constant_delays_stay_flat() {
        let policy = RetryPolicy {
            max_retries: 4,
            retry_delay: Duration::from_millis(50),
            exponential_backoff: false,
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(50));
        assert_eq!(policy.delay_for(3), Duration::from_millis(50));
    }
}
