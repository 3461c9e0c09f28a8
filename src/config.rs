// Pipeline configuration: credentials, models, rate limits, pricing,
// fuzzy-matching thresholds. Loaded from the environment, overridable
// programmatically.

use std::collections::HashMap;
use std::env;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::Provider;

/// Default system template. Domain-specific scoring guidance is expected to
/// come from the operator; this default only pins the response contract the
/// parser expects.
pub const DEFAULT_SYSTEM_TEMPLATE: &str = "\
You are an assistant that writes term reports from structured student records.
Match the tone and style of the examples provided. Never quote exact marks.
Identify strengths and areas needing attention, and keep the report to a few
concise sentences.

Respond ONLY with a valid JSON object of this shape:
```json
{
  \"report_text\": \"The written report...\",
  \"alerts\": [
    {\"topic\": \"Subject\", \"note\": \"Short description\", \"severity\": \"urgent|watch\"}
  ],
  \"strengths\": [
    {\"topic\": \"Subject\", \"note\": \"Short description\"}
  ],
  \"overall_attitude\": \"active|passive|disruptive|mixed\",
  \"focus_areas\": [\"Area 1\", \"Area 2\"]
}
```";

/// Similarity thresholds for the fuzzy redaction passes, on a 0.0..=1.0
/// normalized edit-distance scale. Length-adaptive: very short words match
/// exactly or not at all, short words need a near-perfect score, longer
/// words tolerate typos. The residual pass has no model evidence behind it,
/// so its thresholds are stricter than the model-assisted ones.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FuzzyThresholds {
    pub assisted_short: f64,
    pub assisted_long: f64,
    pub residual_short: f64,
    pub residual_long: f64,
}

impl Default for FuzzyThresholds {
    fn default() -> Self {
        FuzzyThresholds {
            assisted_short: 0.92,
            assisted_long: 0.83,
            residual_short: 0.94,
            residual_long: 0.85,
        }
    }
}

impl FuzzyThresholds {
    /// Threshold for the model-assisted pass, None for words too short to
    /// fuzzy-match safely (exact comparison only).
    pub fn assisted(&self, word_len: usize) -> Option<f64> {
        match word_len {
            0..=3 => None,
            4..=5 => Some(self.assisted_short),
            _ => Some(self.assisted_long),
        }
    }

    /// Threshold for the residual pass.
    pub fn residual(&self, word_len: usize) -> Option<f64> {
        match word_len {
            0..=3 => None,
            4..=5 => Some(self.residual_short),
            _ => Some(self.residual_long),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    // Credentials (optional so the crate can be used with a subset of
    // providers; a missing key fails at client construction, before any
    // network call).
    pub openai_api_key: Option<String>,
    pub anthropic_api_key: Option<String>,
    pub mistral_api_key: Option<String>,

    // Default provider and per-provider default models
    pub default_provider: Provider,
    pub openai_model: String,
    pub anthropic_model: String,
    pub mistral_model: String,

    // Retry
    pub max_retries: u32,
    pub backoff_base: f64,
    pub max_backoff_secs: u64,

    // Rate limits (requests per minute, sliding window)
    pub openai_rpm: usize,
    pub anthropic_rpm: usize,
    pub mistral_rpm: usize,

    // Timeouts (seconds)
    pub provider_timeout_secs: u64,
    pub acquire_timeout_secs: u64,

    // Generation parameters
    pub default_temperature: f64,
    pub report_max_tokens: u32,

    // Calibration examples
    pub max_calibration_examples: usize,
    pub max_example_chars: usize,

    // Identity retention window (days); expired mappings are purged at
    // registry open, before any other operation.
    pub retention_days: i64,

    // Fuzzy redaction thresholds
    pub fuzzy: FuzzyThresholds,

    // System prompt template consumed by the prompt builder
    pub system_template: String,

    // Pricing (USD per million tokens), input/output per model
    pub openai_pricing: HashMap<String, (f64, f64)>,
    pub anthropic_pricing: HashMap<String, (f64, f64)>,
    pub mistral_pricing: HashMap<String, (f64, f64)>,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            openai_api_key: None,
            anthropic_api_key: None,
            mistral_api_key: None,
            default_provider: Provider::OpenAi,
            openai_model: "gpt-5-mini".to_string(),
            anthropic_model: "claude-sonnet-4-5".to_string(),
            mistral_model: "mistral-large-latest".to_string(),
            max_retries: 3,
            backoff_base: 2.0,
            max_backoff_secs: 60,
            openai_rpm: 500,
            anthropic_rpm: 50,
            mistral_rpm: 100,
            provider_timeout_secs: 120,
            acquire_timeout_secs: 120,
            default_temperature: 0.0,
            report_max_tokens: 5000,
            max_calibration_examples: 3,
            max_example_chars: 1200,
            retention_days: 30,
            fuzzy: FuzzyThresholds::default(),
            system_template: DEFAULT_SYSTEM_TEMPLATE.to_string(),
            openai_pricing: HashMap::from([
                ("gpt-5.2".to_string(), (1.75, 14.00)),
                ("gpt-5-mini".to_string(), (0.25, 2.00)),
                ("gpt-5-nano".to_string(), (0.05, 0.40)),
            ]),
            anthropic_pricing: HashMap::from([
                ("claude-sonnet-4-5".to_string(), (3.00, 15.00)),
                ("claude-haiku-4-5".to_string(), (1.00, 5.00)),
            ]),
            mistral_pricing: HashMap::from([
                ("mistral-large-latest".to_string(), (2.00, 6.00)),
                ("mistral-medium-latest".to_string(), (2.00, 5.00)),
                ("mistral-small-latest".to_string(), (0.50, 1.50)),
            ]),
        }
    }
}

impl Settings {
    /// Load settings from the environment on top of the defaults.
    pub fn from_env() -> Self {
        let mut settings = Settings::default();

        settings.openai_api_key = read_env("OPENAI_API_KEY");
        settings.anthropic_api_key = read_env("ANTHROPIC_API_KEY");
        settings.mistral_api_key = read_env("MISTRAL_API_KEY");

        if let Some(provider) = read_env("VEILGEN_PROVIDER") {
            if let Ok(parsed) = provider.parse() {
                settings.default_provider = parsed;
            }
        }
        if let Some(model) = read_env("VEILGEN_OPENAI_MODEL") {
            settings.openai_model = model;
        }
        if let Some(model) = read_env("VEILGEN_ANTHROPIC_MODEL") {
            settings.anthropic_model = model;
        }
        if let Some(model) = read_env("VEILGEN_MISTRAL_MODEL") {
            settings.mistral_model = model;
        }
        if let Some(days) = read_env("VEILGEN_RETENTION_DAYS").and_then(|v| v.parse().ok()) {
            settings.retention_days = days;
        }
        if let Some(retries) = read_env("VEILGEN_MAX_RETRIES").and_then(|v| v.parse().ok()) {
            settings.max_retries = retries;
        }
        if let Some(template) = read_env("VEILGEN_SYSTEM_TEMPLATE") {
            settings.system_template = template;
        }

        settings
    }

    /// Credential for a provider, or an actionable configuration error.
    pub fn api_key(&self, provider: Provider) -> Result<&str> {
        let (key, var) = match provider {
            Provider::OpenAi => (&self.openai_api_key, "OPENAI_API_KEY"),
            Provider::Anthropic => (&self.anthropic_api_key, "ANTHROPIC_API_KEY"),
            Provider::Mistral => (&self.mistral_api_key, "MISTRAL_API_KEY"),
        };
        match key.as_deref() {
            Some(k) if !k.trim().is_empty() => Ok(k),
            _ => Err(Error::Configuration(format!(
                "no API key configured for provider '{provider}': set {var} or provide \
                 it in Settings before building the client"
            ))),
        }
    }

    pub fn has_api_key(&self, provider: Provider) -> bool {
        self.api_key(provider).is_ok()
    }

    pub fn default_model(&self, provider: Provider) -> &str {
        match provider {
            Provider::OpenAi => &self.openai_model,
            Provider::Anthropic => &self.anthropic_model,
            Provider::Mistral => &self.mistral_model,
        }
    }

    pub fn rpm(&self, provider: Provider) -> usize {
        match provider {
            Provider::OpenAi => self.openai_rpm,
            Provider::Anthropic => self.anthropic_rpm,
            Provider::Mistral => self.mistral_rpm,
        }
    }

    pub fn pricing(&self, provider: Provider) -> &HashMap<String, (f64, f64)> {
        match provider {
            Provider::OpenAi => &self.openai_pricing,
            Provider::Anthropic => &self.anthropic_pricing,
            Provider::Mistral => &self.mistral_pricing,
        }
    }
}

fn read_env(var: &str) -> Option<String> {
    env::var(var).ok().filter(|v| !v.trim().is_empty())
}
