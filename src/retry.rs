// Retry wrapper for provider calls: exponential backoff with jitter on
// transient failures, immediate surfacing of everything else.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::time::sleep;
use tracing::warn;

use crate::config::Settings;
use crate::error::Result;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, first call included.
    pub max_attempts: u32,
    pub backoff_base: f64,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 3,
            backoff_base: 2.0,
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    pub fn from_settings(settings: &Settings) -> Self {
        RetryPolicy {
            max_attempts: settings.max_retries.max(1),
            backoff_base: settings.backoff_base,
            max_delay: Duration::from_secs(settings.max_backoff_secs),
        }
    }

    /// Run `op`, repeating it only on retryable failures (rate-limited or
    /// transient), up to the attempt bound. The last error surfaces once
    /// the bound is exhausted.
    pub async fn run<T, F, Fut>(&self, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if attempt < self.max_attempts && err.is_retryable() => {
                    let delay = self.backoff_delay(attempt);
                    warn!(
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retryable provider failure, backing off"
                    );
                    sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = self.backoff_base.powi(attempt.saturating_sub(1) as i32);
        let capped = exp.min(self.max_delay.as_secs_f64());
        // Uniform jitter up to half the delay keeps concurrent retries
        // from landing in lockstep.
        let jitter = rand::thread_rng().gen_range(0.0..=capped * 0.5);
        Duration::from_secs_f64(capped + jitter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Error, ProviderError, ProviderErrorKind};
    use crate::types::Provider;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn failure(kind: ProviderErrorKind) -> Error {
        Error::Provider(ProviderError::new(
            Provider::OpenAi,
            "gpt-5-mini",
            kind,
            "scripted",
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_retry_up_to_the_bound() {
        let policy = RetryPolicy::default();
        let calls = AtomicU32::new(0);

        let result: Result<()> = policy
            .run(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(failure(ProviderErrorKind::Transient)) }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_then_success_stops_retrying() {
        let policy = RetryPolicy::default();
        let calls = AtomicU32::new(0);

        let result = policy
            .run(|| {
                let attempt = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt == 0 {
                        Err(failure(ProviderErrorKind::RateLimited))
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn unauthorized_is_never_retried() {
        let policy = RetryPolicy::default();
        let calls = AtomicU32::new(0);

        let result: Result<()> = policy
            .run(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(failure(ProviderErrorKind::Unauthorized)) }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn invalid_request_is_never_retried() {
        let policy = RetryPolicy::default();
        let calls = AtomicU32::new(0);

        let result: Result<()> = policy
            .run(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(failure(ProviderErrorKind::InvalidRequest)) }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn backoff_grows_and_stays_bounded() {
        let policy = RetryPolicy {
            max_attempts: 5,
            backoff_base: 2.0,
            max_delay: Duration::from_secs(8),
        };
        for attempt in 1..=6 {
            let delay = policy.backoff_delay(attempt);
            // capped at 8 s plus at most 50% jitter
            assert!(delay <= Duration::from_secs(12));
            assert!(delay >= Duration::from_secs_f64(2f64.powi(attempt as i32 - 1).min(8.0)));
        }
    }
}
