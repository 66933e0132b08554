//! Truncated exponential backoff for transient RPC failures.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::storage::transport::TransportError;

/// Backoff curve parameters. The exact curve is deliberately configuration;
/// the defaults are a starting point, not a contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct RetryOptions {
    /// Delay before the first retry, in milliseconds.
    pub initial_delay_ms: u64,
    /// Multiplier applied to the delay after each failed attempt.
    pub multiplier: f64,
    /// Ceiling for any single delay, in milliseconds.
    pub max_delay_ms: u64,
    /// Total attempts, including the first.
    pub max_attempts: u32,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            initial_delay_ms: 250,
            multiplier: 2.0,
            max_delay_ms: 10_000,
            max_attempts: 6,
        }
    }
}

impl RetryOptions {
    /// Delay to sleep after the given zero-based failed attempt.
    pub fn delay_for(&self, failed_attempt: u32) -> Duration {
        let exp = self.multiplier.powi(failed_attempt as i32);
        let millis = (self.initial_delay_ms as f64 * exp) as u64;
        Duration::from_millis(millis.min(self.max_delay_ms))
    }
}

/// Run `operation`, retrying on transient transport failures until the
/// attempt budget runs out. Non-transient failures return immediately; the
/// caller maps them into the storage taxonomy.
pub async fn with_backoff<T, F, Fut>(
    options: &RetryOptions,
    what: &str,
    mut operation: F,
) -> Result<T, TransportError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, TransportError>>,
{
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt + 1 < options.max_attempts => {
                let delay = options.delay_for(attempt);
                debug!(%err, what, attempt, ?delay, "transient failure, backing off");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => {
                if err.is_transient() {
                    warn!(%err, what, attempts = options.max_attempts, "retries exhausted");
                }
                return Err(err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_is_truncated() {
        let options = RetryOptions {
            initial_delay_ms: 100,
            multiplier: 10.0,
            max_delay_ms: 2_000,
            max_attempts: 6,
        };
        assert_eq!(options.delay_for(0), Duration::from_millis(100));
        assert_eq!(options.delay_for(1), Duration::from_millis(1_000));
        assert_eq!(options.delay_for(2), Duration::from_millis(2_000));
        assert_eq!(options.delay_for(5), Duration::from_millis(2_000));
    }

    #[tokio::test]
    async fn retries_transient_then_succeeds() {
        let options = RetryOptions {
            initial_delay_ms: 1,
            ..RetryOptions::default()
        };
        let mut calls = 0;
        let result: Result<u32, _> = with_backoff(&options, "test", || {
            calls += 1;
            let fail = calls < 3;
            async move {
                if fail {
                    Err(TransportError::Timeout)
                } else {
                    Ok(7)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls, 3);
    }

    #[tokio::test]
    async fn fatal_errors_return_immediately() {
        let options = RetryOptions::default();
        let mut calls = 0;
        let result: Result<(), _> = with_backoff(&options, "test", || {
            calls += 1;
            async { Err(TransportError::Malformed("bad json".into())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }
}
