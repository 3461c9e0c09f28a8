// Provider transport contract and shared error mapping.
//
// A transport does the raw provider call and maps what it observes onto
// the shared error taxonomy. Timing, the invocation timeout and pricing
// live in the shared client wrapper, not here.

use async_trait::async_trait;

use crate::error::{ProviderError, ProviderErrorKind};
use crate::types::{Provider, ProviderRequest, RawCompletion};

#[async_trait]
pub trait ProviderTransport: Send + Sync {
    fn provider(&self) -> Provider;

    async fn send(&self, request: &ProviderRequest) -> Result<RawCompletion, ProviderError>;
}

const MAX_BODY_SNIPPET: usize = 300;

/// Map an HTTP error status onto the shared taxonomy, with an actionable
/// hint instead of raw transport detail.
pub(crate) fn error_for_status(
    provider: Provider,
    model: &str,
    status: u16,
    body: &str,
) -> ProviderError {
    let kind = match status {
        429 => ProviderErrorKind::RateLimited,
        401 | 403 => ProviderErrorKind::Unauthorized,
        400 | 404 | 422 => ProviderErrorKind::InvalidRequest,
        500..=599 => ProviderErrorKind::Transient,
        _ => ProviderErrorKind::Unknown,
    };
    let hint = match kind {
        ProviderErrorKind::Unauthorized => " — check the configured API key",
        ProviderErrorKind::RateLimited => " — provider throttled the request",
        ProviderErrorKind::InvalidRequest => " — check the model name and request parameters",
        _ => "",
    };
    let snippet: String = body.trim().chars().take(MAX_BODY_SNIPPET).collect();
    ProviderError::new(
        provider,
        model,
        kind,
        format!("HTTP {status}{hint}: {snippet}"),
    )
}

/// Map a request-level failure (connect refused, timed out mid-flight,
/// body decode) onto the taxonomy.
pub(crate) fn error_for_request(
    provider: Provider,
    model: &str,
    err: &reqwest::Error,
) -> ProviderError {
    let kind = if err.is_timeout() || err.is_connect() {
        ProviderErrorKind::Transient
    } else {
        ProviderErrorKind::Unknown
    };
    ProviderError::new(provider, model, kind, err.to_string())
}

/// A 2xx reply whose body is missing the fields we need. Treated as
/// transient: truncated bodies do resolve on retry.
pub(crate) fn malformed_reply(provider: Provider, model: &str, detail: &str) -> ProviderError {
    ProviderError::new(
        provider,
        model,
        ProviderErrorKind::Transient,
        format!("malformed provider reply: {detail}"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_map_onto_the_taxonomy() {
        let cases = [
            (429, ProviderErrorKind::RateLimited),
            (401, ProviderErrorKind::Unauthorized),
            (403, ProviderErrorKind::Unauthorized),
            (400, ProviderErrorKind::InvalidRequest),
            (404, ProviderErrorKind::InvalidRequest),
            (422, ProviderErrorKind::InvalidRequest),
            (500, ProviderErrorKind::Transient),
            (503, ProviderErrorKind::Transient),
            (418, ProviderErrorKind::Unknown),
        ];
        for (status, expected) in cases {
            let err = error_for_status(Provider::OpenAi, "gpt-5-mini", status, "{}");
            assert_eq!(err.kind, expected, "status {status}");
        }
    }

    #[test]
    fn unauthorized_message_is_actionable() {
        let err = error_for_status(Provider::Mistral, "mistral-large-latest", 401, "denied");
        assert!(err.to_string().contains("API key"));
        assert!(err.to_string().contains("mistral"));
    }
}
