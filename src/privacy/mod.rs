// Privacy layer: identity registry, name normalization, and the
// three-pass redaction pipeline.

pub mod normalize;
pub mod recognizer;
pub mod redaction;
pub mod registry;

pub use recognizer::{HeuristicRecognizer, NameRecognizer};
pub use redaction::{RedactionPipeline, RedactionResult, ReviewCandidate};
pub use registry::{IdentityRegistry, PSEUDONYM_PREFIX, PSEUDONYM_TOKEN_PATTERN};
