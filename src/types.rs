// Type definitions shared across the pipeline

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Closed set of supported external text-generation providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    OpenAi,
    Anthropic,
    Mistral,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::OpenAi => "openai",
            Provider::Anthropic => "anthropic",
            Provider::Mistral => "mistral",
        }
    }

    pub const ALL: [Provider; 3] = [Provider::OpenAi, Provider::Anthropic, Provider::Mistral];
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Provider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "openai" => Ok(Provider::OpenAi),
            "anthropic" => Ok(Provider::Anthropic),
            "mistral" => Ok(Provider::Mistral),
            other => Err(format!(
                "unknown provider '{other}', supported: openai, anthropic, mistral"
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        ChatMessage {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        ChatMessage {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        ChatMessage {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Normalized request handed to a provider transport.
#[derive(Debug, Clone)]
pub struct ProviderRequest {
    pub provider: Provider,
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: Option<f64>,
    pub max_tokens: u32,
    /// Ask the provider for a guaranteed-JSON body where supported.
    pub json_mode: bool,
}

/// What a transport extracts from a successful provider reply, before the
/// shared client template prices and times it.
#[derive(Debug, Clone)]
pub struct RawCompletion {
    pub text: String,
    pub model: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

/// Normalized provider reply.
#[derive(Debug, Clone)]
pub struct ProviderResponse {
    pub text: String,
    pub model: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
    pub latency: Duration,
    pub cost_usd: f64,
}

/// A real-name mapping owned by the identity registry. Never serialized
/// into anything that crosses the external boundary.
#[derive(Debug, Clone)]
pub struct Identity {
    pub pseudonym_id: String,
    pub scope_id: String,
    pub given_name: String,
    pub family_name: String,
    pub given_norm: String,
    pub family_norm: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordSection {
    pub label: String,
    pub body: String,
}

/// Structured record consumed from collaborators: identifying name fields
/// to register plus free-text sections to redact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceRecord {
    pub record_id: String,
    pub given_name: String,
    pub family_name: String,
    #[serde(default)]
    pub attributes: Vec<(String, String)>,
    #[serde(default)]
    pub sections: Vec<RecordSection>,
}

/// Previously validated output reused as a few-shot exemplar. Stored
/// depseudonymized, so both fields are re-redacted at use time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibrationExample {
    pub record_summary: String,
    pub validated_output: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Urgent,
    Watch,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub topic: String,
    pub note: String,
    pub severity: Severity,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Strength {
    pub topic: String,
    pub note: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Attitude {
    Active,
    Passive,
    Disruptive,
    Mixed,
}

/// Structured generation result. Deserialization fails on any missing
/// required field; nothing is silently defaulted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratedReport {
    pub report_text: String,
    pub alerts: Vec<Alert>,
    pub strengths: Vec<Strength>,
    pub overall_attitude: Attitude,
    pub focus_areas: Vec<String>,
}

/// Per-request progression through the pipeline. Step order is strict and
/// never reordered; the current state is carried through logs and failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Idle,
    Pseudonymizing,
    Prompting,
    AwaitingProvider,
    Depseudonymizing,
    Done,
    Failed,
}

impl std::fmt::Display for RequestState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RequestState::Idle => "idle",
            RequestState::Pseudonymizing => "pseudonymizing",
            RequestState::Prompting => "prompting",
            RequestState::AwaitingProvider => "awaiting_provider",
            RequestState::Depseudonymizing => "depseudonymizing",
            RequestState::Done => "done",
            RequestState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Token usage, latency and cost metadata for one completed call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallUsage {
    pub provider: Provider,
    pub model: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
    pub latency_ms: u64,
    pub cost_usd: f64,
}

impl CallUsage {
    pub fn from_response(provider: Provider, response: &ProviderResponse) -> Self {
        CallUsage {
            provider,
            model: response.model.clone(),
            prompt_tokens: response.prompt_tokens,
            completion_tokens: response.completion_tokens,
            total_tokens: response.total_tokens,
            latency_ms: response.latency.as_millis() as u64,
            cost_usd: response.cost_usd,
        }
    }
}
