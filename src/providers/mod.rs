// Provider clients: one transport per external provider, wrapped by a
// shared template that times, bounds and prices every call.

pub mod anthropic;
pub mod mistral;
pub mod openai;
pub mod pricing;
pub mod testing;
pub mod transport;

pub use anthropic::AnthropicTransport;
pub use mistral::MistralTransport;
pub use openai::OpenAiTransport;
pub use pricing::PricingCalculator;
pub use transport::ProviderTransport;

use std::time::Duration;

use tokio::time::timeout;
use tracing::debug;

use crate::config::Settings;
use crate::error::{Error, Result, TimeoutKind};
use crate::types::{Provider, ProviderRequest, ProviderResponse};

pub fn build_transport(
    provider: Provider,
    settings: &Settings,
) -> Result<Box<dyn ProviderTransport>> {
    match provider {
        Provider::OpenAi => Ok(Box::new(OpenAiTransport::new(settings)?)),
        Provider::Anthropic => Ok(Box::new(AnthropicTransport::new(settings)?)),
        Provider::Mistral => Ok(Box::new(MistralTransport::new(settings)?)),
    }
}

/// Shared call template around every transport: start the timer, enforce
/// the invocation timeout, delegate, price the token usage, stop the timer.
/// Error mapping onto the shared taxonomy happens inside the transport.
pub struct ProviderClient {
    transport: Box<dyn ProviderTransport>,
    pricing: PricingCalculator,
    invoke_timeout: Duration,
}

impl ProviderClient {
    pub fn new(
        transport: Box<dyn ProviderTransport>,
        pricing: PricingCalculator,
        invoke_timeout: Duration,
    ) -> Self {
        ProviderClient {
            transport,
            pricing,
            invoke_timeout,
        }
    }

    /// Fails with a configuration error if the provider has no credential,
    /// before any call is attempted.
    pub fn from_settings(provider: Provider, settings: &Settings) -> Result<Self> {
        Ok(ProviderClient::new(
            build_transport(provider, settings)?,
            PricingCalculator::from_settings(provider, settings),
            Duration::from_secs(settings.provider_timeout_secs),
        ))
    }

    pub fn provider(&self) -> Provider {
        self.transport.provider()
    }

    pub async fn invoke(&self, request: &ProviderRequest) -> Result<ProviderResponse> {
        let started = std::time::Instant::now();

        let raw = timeout(self.invoke_timeout, self.transport.send(request))
            .await
            .map_err(|_| Error::Timeout {
                kind: TimeoutKind::Provider,
                limit: self.invoke_timeout,
            })??;

        let latency = started.elapsed();
        let cost_usd = self
            .pricing
            .calculate(&raw.model, raw.prompt_tokens, raw.completion_tokens);

        debug!(
            provider = %self.provider(),
            model = %raw.model,
            latency_ms = latency.as_millis() as u64,
            prompt_tokens = raw.prompt_tokens,
            completion_tokens = raw.completion_tokens,
            cost_usd,
            "provider call complete"
        );

        Ok(ProviderResponse {
            total_tokens: raw.prompt_tokens + raw.completion_tokens,
            text: raw.text,
            model: raw.model,
            prompt_tokens: raw.prompt_tokens,
            completion_tokens: raw.completion_tokens,
            latency,
            cost_usd,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProviderErrorKind;
    use crate::providers::testing::MockTransport;
    use crate::types::ChatMessage;
    use std::collections::HashMap;

    fn request() -> ProviderRequest {
        ProviderRequest {
            provider: Provider::OpenAi,
            model: "gpt-5-mini".to_string(),
            messages: vec![ChatMessage::user("hello")],
            temperature: Some(0.0),
            max_tokens: 100,
            json_mode: false,
        }
    }

    #[tokio::test]
    async fn invoke_prices_and_times_the_call() {
        let transport = MockTransport::new(Provider::OpenAi).with_reply("fine");
        let pricing = PricingCalculator::new(
            Provider::OpenAi,
            HashMap::from([("mock-model".to_string(), (1.0, 2.0))]),
        );
        let client =
            ProviderClient::new(Box::new(transport), pricing, Duration::from_secs(5));

        let response = client.invoke(&request()).await.unwrap();
        assert_eq!(response.text, "fine");
        assert_eq!(response.total_tokens, 150);
        // 100 prompt at $1/M + 50 completion at $2/M
        assert_eq!(response.cost_usd, 0.0002);
    }

    #[tokio::test]
    async fn transport_failures_surface_typed() {
        let transport =
            MockTransport::new(Provider::OpenAi).with_failure(ProviderErrorKind::Unauthorized);
        let pricing = PricingCalculator::new(Provider::OpenAi, HashMap::new());
        let client =
            ProviderClient::new(Box::new(transport), pricing, Duration::from_secs(5));

        let err = client.invoke(&request()).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Provider(p) if p.kind == ProviderErrorKind::Unauthorized
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_transport_hits_the_invocation_timeout() {
        let transport =
            MockTransport::new(Provider::OpenAi).with_delay(Duration::from_secs(60));
        let pricing = PricingCalculator::new(Provider::OpenAi, HashMap::new());
        let client =
            ProviderClient::new(Box::new(transport), pricing, Duration::from_secs(5));

        let err = client.invoke(&request()).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Timeout {
                kind: TimeoutKind::Provider,
                ..
            }
        ));
    }
}
