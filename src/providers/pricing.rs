// Token-usage pricing per provider and model.
//
// Unknown models cost $0.00 with a warning, never an error: a pricing gap
// must not fail a generation that already succeeded.

use std::collections::HashMap;

use regex::Regex;
use tracing::{debug, warn};

use crate::config::Settings;
use crate::types::Provider;

pub struct PricingCalculator {
    provider: Provider,
    table: HashMap<String, (f64, f64)>,
    date_suffix: Regex,
}

impl PricingCalculator {
    pub fn new(provider: Provider, table: HashMap<String, (f64, f64)>) -> Self {
        PricingCalculator {
            provider,
            table,
            date_suffix: Regex::new(r"-\d{8}$").unwrap(),
        }
    }

    pub fn from_settings(provider: Provider, settings: &Settings) -> Self {
        PricingCalculator::new(provider, settings.pricing(provider).clone())
    }

    /// Cost in USD for one call, rounded to 6 decimals.
    pub fn calculate(&self, model: &str, prompt_tokens: u32, completion_tokens: u32) -> f64 {
        let Some((input_price, output_price)) = self.find_price(model) else {
            warn!(
                provider = %self.provider,
                model,
                "unknown model pricing, cost reported as $0.00"
            );
            return 0.0;
        };
        let cost = f64::from(prompt_tokens) * input_price / 1_000_000.0
            + f64::from(completion_tokens) * output_price / 1_000_000.0;
        (cost * 1_000_000.0).round() / 1_000_000.0
    }

    // Model names come back from providers with dates and variants baked
    // in. Anthropic appends -YYYYMMDD; OpenAI names resolve from full name
    // down to the base family; Mistral names are stable.
    fn find_price(&self, model: &str) -> Option<(f64, f64)> {
        match self.provider {
            Provider::Anthropic => {
                let base = self.date_suffix.replace(model, "");
                self.table.get(base.as_ref()).copied()
            }
            Provider::OpenAi => {
                let segments: Vec<&str> = model.split('-').collect();
                let mut candidates = vec![model.to_string()];
                if segments.len() >= 2 {
                    candidates.push(segments[..2].join("-"));
                }
                if segments.len() >= 3 {
                    candidates.push(segments[..3].join("-"));
                }
                candidates
                    .iter()
                    .find_map(|candidate| self.table.get(candidate).copied())
            }
            Provider::Mistral => self.table.get(model).copied(),
        }
    }
}

/// Rough batch cost from aggregate token counts per provider, using the
/// typical 40/60 input/output split. Rounded to cents.
pub fn estimate_batch_cost(
    tokens_by_provider: &HashMap<Provider, u64>,
    model_overrides: &HashMap<Provider, String>,
    settings: &Settings,
) -> f64 {
    let mut total = 0.0;
    for (&provider, &token_count) in tokens_by_provider {
        if token_count == 0 {
            continue;
        }
        let model = model_overrides
            .get(&provider)
            .map(String::as_str)
            .unwrap_or_else(|| settings.default_model(provider));

        let calculator = PricingCalculator::from_settings(provider, settings);
        let input_tokens = (token_count as f64 * 0.4) as u32;
        let output_tokens = (token_count as f64 * 0.6) as u32;
        let cost = calculator.calculate(model, input_tokens, output_tokens);
        debug!(provider = %provider, token_count, model, cost, "batch cost slice");
        total += cost;
    }
    (total * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn calculator(provider: Provider) -> PricingCalculator {
        PricingCalculator::from_settings(provider, &Settings::default())
    }

    #[test]
    fn anthropic_strips_date_suffix() {
        let pricing = calculator(Provider::Anthropic);
        let dated = pricing.calculate("claude-haiku-4-5-20251001", 1_000_000, 0);
        let plain = pricing.calculate("claude-haiku-4-5", 1_000_000, 0);
        assert_eq!(dated, plain);
        assert_eq!(plain, 1.00);
    }

    #[test]
    fn openai_resolves_name_variants() {
        let pricing = calculator(Provider::OpenAi);
        assert_eq!(pricing.calculate("gpt-5-mini-2026-01-12", 1_000_000, 0), 0.25);
        assert_eq!(pricing.calculate("gpt-5-mini", 0, 1_000_000), 2.00);
    }

    #[test]
    fn unknown_model_costs_nothing() {
        let pricing = calculator(Provider::Mistral);
        assert_eq!(pricing.calculate("mistral-experimental", 10_000, 10_000), 0.0);
    }

    #[test]
    fn batch_estimate_uses_the_split() {
        let settings = Settings::default();
        let tokens = HashMap::from([(Provider::Mistral, 1_000_000u64)]);
        // 400k input at $2/M + 600k output at $6/M = $4.40
        let cost = estimate_batch_cost(&tokens, &HashMap::new(), &settings);
        assert_eq!(cost, 4.40);
    }
}
