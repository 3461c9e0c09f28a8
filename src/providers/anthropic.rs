// Anthropic messages transport

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;

use crate::config::Settings;
use crate::error::{ProviderError, Result};
use crate::providers::transport::{
    error_for_request, error_for_status, malformed_reply, ProviderTransport,
};
use crate::types::{Provider, ProviderRequest, RawCompletion, Role};

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";

pub struct AnthropicTransport {
    client: Client,
    api_key: String,
    base_url: String,
}

impl AnthropicTransport {
    pub fn new(settings: &Settings) -> Result<Self> {
        let api_key = settings.api_key(Provider::Anthropic)?.to_string();
        let client = Client::builder()
            .timeout(Duration::from_secs(settings.provider_timeout_secs))
            .connect_timeout(Duration::from_secs(15))
            .build()
            .expect("Failed to create HTTP client");
        Ok(AnthropicTransport {
            client,
            api_key,
            base_url: DEFAULT_BASE_URL.to_string(),
        })
    }

    // The messages endpoint takes the system prompt out-of-band; system
    // messages are concatenated into the top-level field. Anthropic has no
    // response_format, so json_mode rides on the prompt alone.
    fn build_body(&self, request: &ProviderRequest) -> Value {
        let mut system = String::new();
        let mut messages = Vec::new();
        for message in &request.messages {
            match message.role {
                Role::System => {
                    if !system.is_empty() {
                        system.push_str("\n\n");
                    }
                    system.push_str(&message.content);
                }
                _ => messages.push(json!({
                    "role": message.role.as_str(),
                    "content": message.content,
                })),
            }
        }

        let mut body = json!({
            "model": request.model,
            "max_tokens": request.max_tokens,
            "messages": messages,
        });
        if !system.is_empty() {
            body["system"] = json!(system);
        }
        if let Some(temperature) = request.temperature {
            body["temperature"] = json!(temperature);
        }
        body
    }
}

#[async_trait]
impl ProviderTransport for AnthropicTransport {
    fn provider(&self) -> Provider {
        Provider::Anthropic
    }

    async fn send(
        &self,
        request: &ProviderRequest,
    ) -> std::result::Result<RawCompletion, ProviderError> {
        let url = format!("{}/v1/messages", self.base_url.trim_end_matches('/'));
        let body = self.build_body(request);

        let response = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(|e| error_for_request(Provider::Anthropic, &request.model, &e))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(error_for_status(
                Provider::Anthropic,
                &request.model,
                status.as_u16(),
                &text,
            ));
        }

        let payload: Value = response
            .json()
            .await
            .map_err(|e| error_for_request(Provider::Anthropic, &request.model, &e))?;

        let text = payload["content"]
            .as_array()
            .and_then(|blocks| blocks.first())
            .and_then(|block| block.get("text"))
            .and_then(|t| t.as_str())
            .ok_or_else(|| {
                malformed_reply(Provider::Anthropic, &request.model, "no content block")
            })?;

        Ok(RawCompletion {
            text: text.to_string(),
            model: payload["model"]
                .as_str()
                .unwrap_or(&request.model)
                .to_string(),
            prompt_tokens: payload["usage"]["input_tokens"].as_u64().unwrap_or(0) as u32,
            completion_tokens: payload["usage"]["output_tokens"].as_u64().unwrap_or(0) as u32,
        })
    }
}
