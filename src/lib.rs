// veilgen: privacy-preserving generation pipeline.
//
// Free-text personal records are de-identified, sent through rate-limited,
// retryable calls to external text-generation providers, and come back
// with identities restored. No personally identifying token crosses the
// provider boundary.

pub mod config;
pub mod db;
pub mod error;
pub mod orchestrator;
pub mod privacy;
pub mod prompt;
pub mod providers;
pub mod rate_limit;
pub mod retry;
pub mod types;

pub use config::{FuzzyThresholds, Settings};
pub use db::Database;
pub use error::{Error, ProviderError, ProviderErrorKind, Result, TimeoutKind};
pub use orchestrator::{BatchItem, BatchOptions, GenerationOutcome, Orchestrator};
pub use privacy::{
    HeuristicRecognizer, IdentityRegistry, NameRecognizer, RedactionPipeline, RedactionResult,
    ReviewCandidate, PSEUDONYM_PREFIX, PSEUDONYM_TOKEN_PATTERN,
};
pub use providers::{ProviderClient, ProviderTransport};
pub use rate_limit::{RateLimiterSet, SlidingWindowLimiter};
pub use retry::RetryPolicy;
pub use types::{
    CalibrationExample, CallUsage, ChatMessage, GeneratedReport, Identity, Provider,
    ProviderRequest, ProviderResponse, RecordSection, RequestState, Role, SourceRecord,
};
