// Generation orchestration.
//
// Per request: pseudonymize → prompt → provider call (through the rate
// limiter and retry policy) → depseudonymize. Step order is strict.
// Batches run under a bounded-concurrency pool so the shared per-provider
// limiters are respected collectively; one item's failure never aborts its
// siblings.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{RwLock, Semaphore};
use tokio::time::Instant;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::config::Settings;
use crate::db::Database;
use crate::error::{Error, Result, TimeoutKind};
use crate::privacy::recognizer::{HeuristicRecognizer, NameRecognizer};
use crate::privacy::redaction::{RedactionPipeline, ReviewCandidate};
use crate::privacy::registry::IdentityRegistry;
use crate::prompt::{format_record, PromptBuilder};
use crate::providers::ProviderClient;
use crate::rate_limit::RateLimiterSet;
use crate::retry::RetryPolicy;
use crate::types::{
    CalibrationExample, CallUsage, GeneratedReport, Provider, ProviderRequest, RequestState,
    SourceRecord,
};

#[derive(Debug, Clone)]
pub struct GenerationOutcome {
    pub record_id: String,
    pub pseudonym_id: String,
    pub report: GeneratedReport,
    /// Low-confidence redaction candidates, for human review before any
    /// export of the redacted material.
    pub review: Vec<ReviewCandidate>,
    pub usage: CallUsage,
}

#[derive(Debug, Clone)]
pub struct BatchOptions {
    pub max_concurrency: usize,
    /// Honored at the scheduling boundary: items not yet started when the
    /// deadline passes report a batch timeout, in-flight items finish.
    pub deadline: Option<Duration>,
    pub batch_id: Option<String>,
}

impl Default for BatchOptions {
    fn default() -> Self {
        BatchOptions {
            max_concurrency: 3,
            deadline: None,
            batch_id: None,
        }
    }
}

#[derive(Debug)]
pub struct BatchItem {
    pub record_id: String,
    pub result: Result<GenerationOutcome>,
}

#[derive(Clone)]
pub struct Orchestrator {
    registry: IdentityRegistry,
    pipeline: Arc<RedactionPipeline>,
    clients: HashMap<Provider, Arc<ProviderClient>>,
    limiters: RateLimiterSet,
    retry: RetryPolicy,
    prompts: Arc<PromptBuilder>,
    provider: Provider,
    model: Option<String>,
    settings: Arc<Settings>,
    cancelled_batches: Arc<RwLock<HashSet<String>>>,
}

impl Orchestrator {
    pub fn new(db: &Database, settings: Settings) -> Result<Self> {
        let registry = IdentityRegistry::open(db, settings.retention_days)?;
        Orchestrator::with_recognizer(registry, settings, Arc::new(HeuristicRecognizer::new()))
    }

    pub fn with_recognizer(
        registry: IdentityRegistry,
        settings: Settings,
        recognizer: Arc<dyn NameRecognizer>,
    ) -> Result<Self> {
        let pipeline =
            RedactionPipeline::new(registry.clone(), recognizer, settings.fuzzy.clone());

        // Clients are built only for providers with credentials; asking
        // for an unconfigured one fails before any call is attempted.
        let mut clients = HashMap::new();
        for provider in Provider::ALL {
            if settings.has_api_key(provider) {
                clients.insert(
                    provider,
                    Arc::new(ProviderClient::from_settings(provider, &settings)?),
                );
            }
        }

        Ok(Orchestrator {
            registry,
            pipeline: Arc::new(pipeline),
            clients,
            limiters: RateLimiterSet::from_settings(&settings),
            retry: RetryPolicy::from_settings(&settings),
            prompts: Arc::new(PromptBuilder::from_settings(&settings)),
            provider: settings.default_provider,
            model: None,
            settings: Arc::new(settings),
            cancelled_batches: Arc::new(RwLock::new(HashSet::new())),
        })
    }

    pub fn with_provider(mut self, provider: Provider, model: Option<String>) -> Self {
        self.provider = provider;
        self.model = model;
        self
    }

    /// Install or replace the client for a provider (custom transports,
    /// tests).
    pub fn register_client(&mut self, provider: Provider, client: ProviderClient) {
        self.clients.insert(provider, Arc::new(client));
    }

    pub fn registry(&self) -> &IdentityRegistry {
        &self.registry
    }

    pub fn redaction(&self) -> &RedactionPipeline {
        &self.pipeline
    }

    /// Generate one structured report for a record. No personally
    /// identifying token crosses the provider boundary; the result comes
    /// back with identities restored.
    pub async fn generate(
        &self,
        record: &SourceRecord,
        scope: &str,
        calibration: &[CalibrationExample],
    ) -> Result<GenerationOutcome> {
        let mut state = RequestState::Idle;
        let result = self
            .generate_inner(record, scope, calibration, &mut state)
            .await;
        if let Err(err) = &result {
            error!(
                record_id = %record.record_id,
                failed_during = %state,
                error = %err,
                "generation failed"
            );
        }
        result
    }

    async fn generate_inner(
        &self,
        record: &SourceRecord,
        scope: &str,
        calibration: &[CalibrationExample],
        state: &mut RequestState,
    ) -> Result<GenerationOutcome> {
        let client = self
            .clients
            .get(&self.provider)
            .ok_or_else(|| {
                Error::Configuration(format!(
                    "provider '{}' has no configured client: set its API key before generating",
                    self.provider
                ))
            })?
            .clone();
        let model = self
            .model
            .clone()
            .unwrap_or_else(|| self.settings.default_model(self.provider).to_string());

        *state = RequestState::Pseudonymizing;
        let pseudonym =
            self.registry
                .register(scope, &record.given_name, &record.family_name)?;
        debug!(record_id = %record.record_id, pseudonym = %pseudonym, state = %state, "identity registered");

        // Redaction runs recognizer inference, which blocks; keep it off
        // the async pool. Calibration examples are stored depseudonymized,
        // so each one is re-redacted at use time.
        let (record_text, examples, review) = {
            let pipeline = self.pipeline.clone();
            let scope = scope.to_string();
            let formatted = format_record(&pseudonym, record);
            let calibration = calibration.to_vec();
            type Redacted = (String, Vec<CalibrationExample>, Vec<ReviewCandidate>);
            tokio::task::spawn_blocking(move || -> Result<Redacted> {
                let redacted = pipeline.redact(&formatted, &scope)?;
                let mut examples = Vec::with_capacity(calibration.len());
                for example in calibration {
                    let summary = pipeline.redact(&example.record_summary, &scope)?;
                    let output = pipeline.redact(&example.validated_output, &scope)?;
                    examples.push(CalibrationExample {
                        record_summary: summary.text,
                        validated_output: output.text,
                    });
                }
                Ok((redacted.text, examples, redacted.review))
            })
            .await
            .map_err(|e| Error::Internal(format!("redaction task failed: {e}")))??
        };

        *state = RequestState::Prompting;
        let messages = self.prompts.build(&record_text, &examples);
        let request = ProviderRequest {
            provider: self.provider,
            model: model.clone(),
            messages,
            temperature: Some(self.settings.default_temperature),
            max_tokens: self.settings.report_max_tokens,
            json_mode: true,
        };

        *state = RequestState::AwaitingProvider;
        let limiter = self.limiters.limiter(self.provider);
        let acquire_timeout = Duration::from_secs(self.settings.acquire_timeout_secs);
        let response = self
            .retry
            .run(|| {
                let limiter = limiter.clone();
                let client = client.clone();
                let request = &request;
                async move {
                    limiter.acquire_timeout(acquire_timeout).await?;
                    client.invoke(request).await
                }
            })
            .await?;

        *state = RequestState::Depseudonymizing;
        let payload = extract_json(&response.text);
        let mut report: GeneratedReport =
            serde_json::from_str(payload).map_err(|e| Error::Schema {
                provider: self.provider,
                model: model.clone(),
                message: e.to_string(),
            })?;

        report.report_text = self.pipeline.depseudonymize(&report.report_text, scope)?;
        for alert in &mut report.alerts {
            alert.topic = self.pipeline.depseudonymize(&alert.topic, scope)?;
            alert.note = self.pipeline.depseudonymize(&alert.note, scope)?;
        }
        for strength in &mut report.strengths {
            strength.topic = self.pipeline.depseudonymize(&strength.topic, scope)?;
            strength.note = self.pipeline.depseudonymize(&strength.note, scope)?;
        }
        for area in &mut report.focus_areas {
            *area = self.pipeline.depseudonymize(area, scope)?;
        }

        let usage = CallUsage::from_response(self.provider, &response);
        *state = RequestState::Done;
        info!(
            record_id = %record.record_id,
            pseudonym = %pseudonym,
            provider = %self.provider,
            model = %usage.model,
            total_tokens = usage.total_tokens,
            cost_usd = usage.cost_usd,
            "report generated"
        );

        Ok(GenerationOutcome {
            record_id: record.record_id.clone(),
            pseudonym_id: pseudonym,
            report,
            review,
            usage,
        })
    }

    /// Run many records under a bounded-concurrency pool. Results come
    /// back in input order, one per record, each success or failure
    /// isolated to its own item.
    pub async fn generate_batch(
        &self,
        records: Vec<SourceRecord>,
        scope: &str,
        calibration: &[CalibrationExample],
        opts: BatchOptions,
    ) -> Vec<BatchItem> {
        let batch_id = opts
            .batch_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let max_concurrency = opts.max_concurrency.max(1);
        let deadline_limit = opts.deadline.unwrap_or_default();
        let deadline = opts.deadline.map(|d| Instant::now() + d);
        let semaphore = Arc::new(Semaphore::new(max_concurrency));

        info!(
            batch_id = %batch_id,
            items = records.len(),
            max_concurrency,
            "batch started"
        );

        let mut handles = Vec::with_capacity(records.len());
        for record in records {
            let orchestrator = self.clone();
            let semaphore = semaphore.clone();
            let scope = scope.to_string();
            let calibration = calibration.to_vec();
            let batch_id = batch_id.clone();
            let record_id = record.record_id.clone();

            let handle = tokio::spawn(async move {
                let record_id = record.record_id.clone();
                if orchestrator.is_batch_cancelled(&batch_id).await {
                    return BatchItem {
                        record_id,
                        result: Err(Error::Cancelled { batch_id }),
                    };
                }

                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => {
                        return BatchItem {
                            record_id,
                            result: Err(Error::Internal("batch pool closed".to_string())),
                        }
                    }
                };

                // Scheduling boundary: re-check after waiting for a slot.
                // Items already past this point run to completion.
                if orchestrator.is_batch_cancelled(&batch_id).await {
                    return BatchItem {
                        record_id,
                        result: Err(Error::Cancelled { batch_id }),
                    };
                }
                if let Some(deadline) = deadline {
                    if Instant::now() >= deadline {
                        return BatchItem {
                            record_id,
                            result: Err(Error::Timeout {
                                kind: TimeoutKind::Batch,
                                limit: deadline_limit,
                            }),
                        };
                    }
                }

                let result = orchestrator.generate(&record, &scope, &calibration).await;
                BatchItem { record_id, result }
            });
            handles.push((record_id, handle));
        }

        let mut items = Vec::with_capacity(handles.len());
        for (record_id, handle) in handles {
            match handle.await {
                Ok(item) => items.push(item),
                Err(e) => items.push(BatchItem {
                    record_id,
                    result: Err(Error::Internal(format!("batch task failed: {e}"))),
                }),
            }
        }

        let succeeded = items.iter().filter(|i| i.result.is_ok()).count();
        info!(
            batch_id = %batch_id,
            total = items.len(),
            succeeded,
            failed = items.len() - succeeded,
            "batch complete"
        );
        items
    }

    /// Stop scheduling new items of a batch; in-flight items finish so a
    /// half-paid provider response is never abandoned.
    pub async fn cancel_batch(&self, batch_id: &str) {
        self.cancelled_batches
            .write()
            .await
            .insert(batch_id.to_string());
        info!(batch_id, "batch cancellation requested");
    }

    async fn is_batch_cancelled(&self, batch_id: &str) -> bool {
        self.cancelled_batches.read().await.contains(batch_id)
    }
}

/// Providers sometimes wrap the JSON body in markdown fences despite
/// json_mode; take the inner body before parsing.
fn extract_json(content: &str) -> &str {
    if let Some(start) = content.find("```json") {
        let rest = &content[start + 7..];
        if let Some(end) = rest.find("```") {
            return rest[..end].trim();
        }
    }
    if let Some(start) = content.find("```") {
        let rest = &content[start + 3..];
        if let Some(end) = rest.find("```") {
            return rest[..end].trim();
        }
    }
    content.trim()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ProviderError, ProviderErrorKind};
    use crate::providers::testing::MockTransport;
    use crate::providers::transport::ProviderTransport;
    use crate::providers::PricingCalculator;
    use crate::types::{RawCompletion, RecordSection};
    use async_trait::async_trait;

    fn report_json(report_text: &str) -> String {
        serde_json::json!({
            "report_text": report_text,
            "alerts": [],
            "strengths": [],
            "overall_attitude": "active",
            "focus_areas": ["Oral participation"]
        })
        .to_string()
    }

    fn record(id: &str, given: &str, family: &str) -> SourceRecord {
        SourceRecord {
            record_id: id.to_string(),
            given_name: given.to_string(),
            family_name: family.to_string(),
            attributes: Vec::new(),
            sections: vec![RecordSection {
                label: "Participation".to_string(),
                body: format!("{given} {family} participe activement."),
            }],
        }
    }

    fn orchestrator_with(transport: MockTransport) -> Orchestrator {
        let db = Database::open_in_memory().unwrap();
        let mut orchestrator = Orchestrator::new(&db, Settings::default()).unwrap();
        orchestrator.register_client(
            Provider::OpenAi,
            ProviderClient::new(
                Box::new(transport),
                PricingCalculator::new(Provider::OpenAi, HashMap::new()),
                Duration::from_secs(5),
            ),
        );
        orchestrator
    }

    #[tokio::test]
    async fn generate_restores_identities_in_the_report() {
        let transport = MockTransport::new(Provider::OpenAi)
            .with_reply(&report_json("PERSON_001 a fait un excellent trimestre."));
        let orchestrator = orchestrator_with(transport);

        let outcome = orchestrator
            .generate(&record("r1", "Marie", "Dupont"), "ClassA", &[])
            .await
            .unwrap();

        assert_eq!(outcome.pseudonym_id, "PERSON_001");
        assert_eq!(
            outcome.report.report_text,
            "Marie Dupont a fait un excellent trimestre."
        );
        assert_eq!(outcome.usage.provider, Provider::OpenAi);
    }

    #[tokio::test]
    async fn fenced_json_replies_still_parse() {
        let fenced = format!("```json\n{}\n```", report_json("All fine."));
        let transport = MockTransport::new(Provider::OpenAi).with_reply(&fenced);
        let orchestrator = orchestrator_with(transport);

        let outcome = orchestrator
            .generate(&record("r1", "Marie", "Dupont"), "ClassA", &[])
            .await
            .unwrap();
        assert_eq!(outcome.report.report_text, "All fine.");
    }

    #[tokio::test]
    async fn missing_required_fields_fail_with_schema_error() {
        let transport =
            MockTransport::new(Provider::OpenAi).with_reply(r#"{"report_text": "only this"}"#);
        let orchestrator = orchestrator_with(transport);

        let err = orchestrator
            .generate(&record("r1", "Marie", "Dupont"), "ClassA", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Schema { .. }));
    }

    #[tokio::test]
    async fn unconfigured_provider_fails_before_any_call() {
        let db = Database::open_in_memory().unwrap();
        let orchestrator = Orchestrator::new(&db, Settings::default()).unwrap();

        let err = orchestrator
            .generate(&record("r1", "Marie", "Dupont"), "ClassA", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    /// Fails any request whose prompt mentions the given token, succeeds
    /// otherwise. Gives batch tests a deterministic failing item.
    struct FailOnToken {
        needle: String,
        kind: ProviderErrorKind,
    }

    #[async_trait]
    impl ProviderTransport for FailOnToken {
        fn provider(&self) -> Provider {
            Provider::OpenAi
        }

        async fn send(
            &self,
            request: &ProviderRequest,
        ) -> std::result::Result<RawCompletion, ProviderError> {
            if request
                .messages
                .iter()
                .any(|m| m.content.contains(&self.needle))
            {
                return Err(ProviderError::new(
                    Provider::OpenAi,
                    &request.model,
                    self.kind,
                    "scripted failure",
                ));
            }
            Ok(RawCompletion {
                text: report_json("Steady progress all term."),
                model: "mock-model".to_string(),
                prompt_tokens: 100,
                completion_tokens: 50,
            })
        }
    }

    #[tokio::test]
    async fn batch_isolates_one_unauthorized_item() {
        let db = Database::open_in_memory().unwrap();
        let mut orchestrator = Orchestrator::new(&db, Settings::default()).unwrap();

        let records: Vec<SourceRecord> = (1..=10)
            .map(|i| record(&format!("r{i}"), &format!("Given{i}"), &format!("Family{i}")))
            .collect();

        // Pre-register in input order so record #4 is PERSON_004.
        for r in &records {
            orchestrator
                .registry()
                .register("ClassA", &r.given_name, &r.family_name)
                .unwrap();
        }

        orchestrator.register_client(
            Provider::OpenAi,
            ProviderClient::new(
                Box::new(FailOnToken {
                    needle: "PERSON_004".to_string(),
                    kind: ProviderErrorKind::Unauthorized,
                }),
                PricingCalculator::new(Provider::OpenAi, HashMap::new()),
                Duration::from_secs(5),
            ),
        );

        let items = orchestrator
            .generate_batch(
                records,
                "ClassA",
                &[],
                BatchOptions {
                    max_concurrency: 3,
                    ..BatchOptions::default()
                },
            )
            .await;

        assert_eq!(items.len(), 10);
        for item in &items {
            if item.record_id == "r4" {
                assert!(matches!(
                    &item.result,
                    Err(Error::Provider(p)) if p.kind == ProviderErrorKind::Unauthorized
                ));
            } else {
                assert!(item.result.is_ok(), "item {} failed", item.record_id);
            }
        }
    }

    #[tokio::test]
    async fn cancelled_batch_schedules_nothing() {
        let transport = MockTransport::new(Provider::OpenAi).with_reply(&report_json("ok"));
        let orchestrator = orchestrator_with(transport);
        orchestrator.cancel_batch("b1").await;

        let items = orchestrator
            .generate_batch(
                vec![record("r1", "Marie", "Dupont")],
                "ClassA",
                &[],
                BatchOptions {
                    batch_id: Some("b1".to_string()),
                    ..BatchOptions::default()
                },
            )
            .await;

        assert!(matches!(items[0].result, Err(Error::Cancelled { .. })));
    }

    #[tokio::test]
    async fn expired_deadline_reports_batch_timeouts() {
        let transport = MockTransport::new(Provider::OpenAi).with_reply(&report_json("ok"));
        let orchestrator = orchestrator_with(transport);

        let items = orchestrator
            .generate_batch(
                vec![record("r1", "Marie", "Dupont")],
                "ClassA",
                &[],
                BatchOptions {
                    deadline: Some(Duration::ZERO),
                    ..BatchOptions::default()
                },
            )
            .await;

        assert!(matches!(
            items[0].result,
            Err(Error::Timeout {
                kind: TimeoutKind::Batch,
                ..
            })
        ));
    }

    /// Replies with a fixed report and keeps every prompt it saw.
    struct CaptureTransport {
        seen: Arc<std::sync::Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl ProviderTransport for CaptureTransport {
        fn provider(&self) -> Provider {
            Provider::OpenAi
        }

        async fn send(
            &self,
            request: &ProviderRequest,
        ) -> std::result::Result<RawCompletion, ProviderError> {
            let mut seen = self.seen.lock().unwrap();
            for message in &request.messages {
                seen.push(message.content.clone());
            }
            Ok(RawCompletion {
                text: report_json("PERSON_001 progressed well."),
                model: "mock-model".to_string(),
                prompt_tokens: 100,
                completion_tokens: 50,
            })
        }
    }

    #[tokio::test]
    async fn no_real_name_reaches_the_provider_boundary() {
        let db = Database::open_in_memory().unwrap();
        let mut orchestrator = Orchestrator::new(&db, Settings::default()).unwrap();

        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        orchestrator.register_client(
            Provider::OpenAi,
            ProviderClient::new(
                Box::new(CaptureTransport { seen: seen.clone() }),
                PricingCalculator::new(Provider::OpenAi, HashMap::new()),
                Duration::from_secs(5),
            ),
        );

        // The stored example carries real names, as it would after a
        // depseudonymized export; it must be re-redacted at use time.
        let calibration = vec![CalibrationExample {
            record_summary: "Record for Marie Dupont".to_string(),
            validated_output: "Marie Dupont had a strong term.".to_string(),
        }];

        let outcome = orchestrator
            .generate(&record("r1", "Marie", "Dupont"), "ClassA", &calibration)
            .await
            .unwrap();

        let seen = seen.lock().unwrap();
        assert!(!seen.is_empty());
        for content in seen.iter() {
            assert!(!content.contains("Marie"), "real name leaked: {content}");
            assert!(!content.contains("Dupont"), "real name leaked: {content}");
        }
        // And the caller still gets the restored identity back.
        assert_eq!(outcome.report.report_text, "Marie Dupont progressed well.");
    }

    #[test]
    fn extract_json_handles_fences_and_plain_bodies() {
        assert_eq!(extract_json("{\"a\":1}"), "{\"a\":1}");
        assert_eq!(extract_json("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(extract_json("noise ```\n{\"a\":1}\n``` trailing"), "{\"a\":1}");
    }
}
