// Sliding-window admission control, one limiter per provider.
//
// Timestamps use the monotonic tokio clock, immune to wall-clock changes
// (and pausable in tests). A waiter sleeps outside the lock and records
// its slot only once admitted, so a cancelled waiter leaves the window
// untouched for everyone else. No fairness guarantee.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info};

use crate::config::Settings;
use crate::error::{Error, Result, TimeoutKind};
use crate::types::Provider;

const WINDOW: Duration = Duration::from_secs(60);
// Wake slightly after the oldest slot leaves the window.
const WAKE_MARGIN: Duration = Duration::from_millis(100);

pub struct SlidingWindowLimiter {
    max_requests: usize,
    window: Duration,
    started: Mutex<VecDeque<Instant>>,
}

impl SlidingWindowLimiter {
    pub fn new(max_requests: usize, window: Duration) -> Self {
        SlidingWindowLimiter {
            max_requests: max_requests.max(1),
            window,
            started: Mutex::new(VecDeque::new()),
        }
    }

    /// Requests-per-minute limiter over the standard 60 s window.
    pub fn per_minute(rpm: usize) -> Self {
        SlidingWindowLimiter::new(rpm, WINDOW)
    }

    /// Block until fewer than `max_requests` have started within the
    /// trailing window, then record this request's start.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut started = self.started.lock().await;
                let now = Instant::now();
                while started
                    .front()
                    .is_some_and(|t| now.duration_since(*t) >= self.window)
                {
                    started.pop_front();
                }

                if started.len() < self.max_requests {
                    started.push_back(now);
                    return;
                }

                match started.front() {
                    Some(oldest) => {
                        self.window.saturating_sub(now.duration_since(*oldest)) + WAKE_MARGIN
                    }
                    None => WAKE_MARGIN,
                }
            };

            info!(
                wait_ms = wait.as_millis() as u64,
                max = self.max_requests,
                "rate limit reached, waiting for the window to free up"
            );
            sleep(wait).await;
        }
    }

    /// Like `acquire`, but give up after `limit` with a timeout error the
    /// batch reporter can tell apart from an unresponsive provider.
    pub async fn acquire_timeout(&self, limit: Duration) -> Result<()> {
        timeout(limit, self.acquire()).await.map_err(|_| {
            debug!(limit_secs = limit.as_secs(), "rate limiter acquisition timed out");
            Error::Timeout {
                kind: TimeoutKind::RateLimit,
                limit,
            }
        })
    }

    /// Requests currently counted in the window. Monitoring only.
    pub async fn in_window(&self) -> usize {
        let started = self.started.lock().await;
        let now = Instant::now();
        started
            .iter()
            .filter(|t| now.duration_since(**t) < self.window)
            .count()
    }
}

/// One shared limiter per provider, built from configured RPM values and
/// injected where needed rather than living in module-level state.
#[derive(Clone)]
pub struct RateLimiterSet {
    openai: Arc<SlidingWindowLimiter>,
    anthropic: Arc<SlidingWindowLimiter>,
    mistral: Arc<SlidingWindowLimiter>,
}

impl RateLimiterSet {
    pub fn from_settings(settings: &Settings) -> Self {
        RateLimiterSet {
            openai: Arc::new(SlidingWindowLimiter::per_minute(settings.openai_rpm)),
            anthropic: Arc::new(SlidingWindowLimiter::per_minute(settings.anthropic_rpm)),
            mistral: Arc::new(SlidingWindowLimiter::per_minute(settings.mistral_rpm)),
        }
    }

    pub fn limiter(&self, provider: Provider) -> Arc<SlidingWindowLimiter> {
        match provider {
            Provider::OpenAi => self.openai.clone(),
            Provider::Anthropic => self.anthropic.clone(),
            Provider::Mistral => self.mistral.clone(),
        }
    }
}
