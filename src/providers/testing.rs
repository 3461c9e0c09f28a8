// Test support: a scriptable transport with no network behind it.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{ProviderError, ProviderErrorKind};
use crate::providers::transport::ProviderTransport;
use crate::types::{Provider, ProviderRequest, RawCompletion};

type ScriptedReply = Result<RawCompletion, ProviderError>;

/// Replays a scripted sequence of replies; the last entry repeats once the
/// script runs out. Counts every call it receives.
pub struct MockTransport {
    provider: Provider,
    script: Mutex<VecDeque<ScriptedReply>>,
    delay: Option<Duration>,
    calls: AtomicUsize,
}

impl MockTransport {
    pub fn new(provider: Provider) -> Self {
        MockTransport {
            provider,
            script: Mutex::new(VecDeque::new()),
            delay: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_reply(self, text: &str) -> Self {
        self.push(Ok(RawCompletion {
            text: text.to_string(),
            model: "mock-model".to_string(),
            prompt_tokens: 100,
            completion_tokens: 50,
        }));
        self
    }

    pub fn with_failure(self, kind: ProviderErrorKind) -> Self {
        let provider = self.provider;
        self.push(Err(ProviderError::new(
            provider,
            "mock-model",
            kind,
            "scripted failure",
        )));
        self
    }

    /// Sleep before answering, to exercise timeout paths under a paused
    /// tokio clock.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn push(&self, reply: ScriptedReply) {
        self.script.lock().unwrap().push_back(reply);
    }
}

#[async_trait]
impl ProviderTransport for MockTransport {
    fn provider(&self) -> Provider {
        self.provider
    }

    async fn send(
        &self,
        _request: &ProviderRequest,
    ) -> Result<RawCompletion, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let mut script = self.script.lock().unwrap();
        if script.len() > 1 {
            script.pop_front().unwrap_or_else(|| unreachable!())
        } else {
            script.front().cloned().unwrap_or_else(|| {
                Err(ProviderError::new(
                    self.provider,
                    "mock-model",
                    ProviderErrorKind::Unknown,
                    "mock transport has no scripted reply",
                ))
            })
        }
    }
}
