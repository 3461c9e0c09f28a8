// OpenAI chat-completions transport

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;

use crate::config::Settings;
use crate::error::{ProviderError, Result};
use crate::providers::transport::{
    error_for_request, error_for_status, malformed_reply, ProviderTransport,
};
use crate::types::{Provider, ProviderRequest, RawCompletion};

const DEFAULT_BASE_URL: &str = "https://api.openai.com";

pub struct OpenAiTransport {
    client: Client,
    api_key: String,
    base_url: String,
}

impl OpenAiTransport {
    pub fn new(settings: &Settings) -> Result<Self> {
        let api_key = settings.api_key(Provider::OpenAi)?.to_string();
        let client = Client::builder()
            .timeout(Duration::from_secs(settings.provider_timeout_secs))
            .connect_timeout(Duration::from_secs(15))
            .build()
            .expect("Failed to create HTTP client");
        Ok(OpenAiTransport {
            client,
            api_key,
            base_url: DEFAULT_BASE_URL.to_string(),
        })
    }

    fn build_body(&self, request: &ProviderRequest) -> Value {
        let messages: Vec<Value> = request
            .messages
            .iter()
            .map(|m| json!({"role": m.role.as_str(), "content": m.content}))
            .collect();

        let mut body = json!({
            "model": request.model,
            "messages": messages,
        });

        // gpt-5 models take max_completion_tokens (with a floor for
        // internal reasoning tokens) and only run at default temperature.
        if request.model.starts_with("gpt-5") {
            body["max_completion_tokens"] = json!(request.max_tokens.max(16000));
        } else {
            body["max_tokens"] = json!(request.max_tokens);
            if let Some(temperature) = request.temperature {
                body["temperature"] = json!(temperature);
            }
        }

        if request.json_mode {
            body["response_format"] = json!({"type": "json_object"});
        }

        body
    }
}

#[async_trait]
impl ProviderTransport for OpenAiTransport {
    fn provider(&self) -> Provider {
        Provider::OpenAi
    }

    async fn send(
        &self,
        request: &ProviderRequest,
    ) -> std::result::Result<RawCompletion, ProviderError> {
        let url = format!(
            "{}/v1/chat/completions",
            self.base_url.trim_end_matches('/')
        );
        let body = self.build_body(request);

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| error_for_request(Provider::OpenAi, &request.model, &e))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(error_for_status(
                Provider::OpenAi,
                &request.model,
                status.as_u16(),
                &text,
            ));
        }

        let payload: Value = response
            .json()
            .await
            .map_err(|e| error_for_request(Provider::OpenAi, &request.model, &e))?;

        let text = payload["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| {
                malformed_reply(Provider::OpenAi, &request.model, "no message content")
            })?;

        Ok(RawCompletion {
            text: text.to_string(),
            model: payload["model"]
                .as_str()
                .unwrap_or(&request.model)
                .to_string(),
            prompt_tokens: payload["usage"]["prompt_tokens"].as_u64().unwrap_or(0) as u32,
            completion_tokens: payload["usage"]["completion_tokens"].as_u64().unwrap_or(0) as u32,
        })
    }
}
