// ============================================================================
// Upstream Drivers
// ============================================================================
//
// A driver opens one canonical request against one upstream service and
// yields a canonical event stream. Three drivers exist:
//
// - `openai`    - API-key driver speaking the OpenAI chat-completion dialect
// - `anthropic` - API-key driver speaking the Anthropic messages dialect
// - `session`   - the default driver, authenticating with a leased upstream
//                 account session (or the unauthenticated human-fallback
//                 path when no session is eligible)
//
// Dispatch is by enum, not trait object; the registry owns one configured
// instance of each.
//
// ============================================================================

pub mod anthropic_client;
pub mod openai_client;
pub mod session_driver;
pub mod sse;

use std::fmt;
use std::pin::Pin;

use futures::Stream;

use crate::models::canonical::{CanonicalRequest, StreamEvent};
use crate::services::session_pool::SessionLease;

pub use anthropic_client::AnthropicDriver;
pub use openai_client::OpenAiDriver;
pub use session_driver::SessionDriver;

/// Canonical event stream produced by a driver.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<StreamEvent, UpstreamError>> + Send>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamErrorKind {
    /// Connection-level failure (DNS, TCP, TLS, aborted body).
    Network,
    /// Non-success HTTP status from the upstream.
    Status(u16),
    /// Unparseable response or SSE payload.
    Parse,
    Timeout,
}

#[derive(Debug, Clone)]
pub struct UpstreamError {
    pub kind: UpstreamErrorKind,
    pub message: String,
}

impl UpstreamError {
    pub fn new(kind: UpstreamErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn status(status: u16, body: &str) -> Self {
        // Prefer the upstream's own message when the body is an error envelope.
        let message = serde_json::from_str::<serde_json::Value>(body)
            .ok()
            .and_then(|v| {
                v.get("error")?
                    .get("message")?
                    .as_str()
                    .map(|m| format!("HTTP {status}: {m}"))
            })
            .unwrap_or_else(|| format!("HTTP {status}"));
        Self::new(UpstreamErrorKind::Status(status), message)
    }

    pub fn status_code(&self) -> Option<u16> {
        match self.kind {
            UpstreamErrorKind::Status(code) => Some(code),
            _ => None,
        }
    }

    /// Network failures, timeouts, 429 and 5xx retry across candidates;
    /// other 4xx surface immediately.
    pub fn is_retryable(&self) -> bool {
        match self.kind {
            UpstreamErrorKind::Network | UpstreamErrorKind::Timeout => true,
            UpstreamErrorKind::Status(code) => code == 429 || code >= 500,
            UpstreamErrorKind::Parse => false,
        }
    }

    /// Credential rejection: the dispatcher invalidates the session and
    /// moves to the next candidate.
    pub fn is_auth_rejection(&self) -> bool {
        matches!(self.kind, UpstreamErrorKind::Status(401))
    }
}

impl fmt::Display for UpstreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for UpstreamError {}

impl From<reqwest::Error> for UpstreamError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            UpstreamError::new(UpstreamErrorKind::Timeout, err.to_string())
        } else {
            UpstreamError::new(UpstreamErrorKind::Network, err.to_string())
        }
    }
}

/// The configured upstream drivers. `open` always requests an upstream
/// stream; non-streaming client calls are synthesized by the pipeline.
pub enum ProviderDriver {
    OpenAi(OpenAiDriver),
    Anthropic(AnthropicDriver),
    Session(SessionDriver),
}

impl ProviderDriver {
    pub fn name(&self) -> &'static str {
        match self {
            ProviderDriver::OpenAi(_) => "openai",
            ProviderDriver::Anthropic(_) => "anthropic",
            ProviderDriver::Session(_) => "session",
        }
    }

    /// Only the session driver leases from the pool.
    pub fn is_session_backed(&self) -> bool {
        matches!(self, ProviderDriver::Session(_))
    }

    pub async fn open(
        &self,
        request: &CanonicalRequest,
        lease: Option<&SessionLease>,
    ) -> Result<EventStream, UpstreamError> {
        match self {
            ProviderDriver::OpenAi(driver) => driver.open(request).await,
            ProviderDriver::Anthropic(driver) => driver.open(request).await,
            ProviderDriver::Session(driver) => driver.open(request, lease).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryability_follows_transport_rules() {
        assert!(UpstreamError::new(UpstreamErrorKind::Network, "conn reset").is_retryable());
        assert!(UpstreamError::new(UpstreamErrorKind::Timeout, "deadline").is_retryable());
        assert!(UpstreamError::status(429, "").is_retryable());
        assert!(UpstreamError::status(502, "").is_retryable());
        assert!(!UpstreamError::status(401, "").is_retryable());
        assert!(!UpstreamError::status(400, "").is_retryable());
        assert!(UpstreamError::status(401, "").is_auth_rejection());
    }

    #[test]
    fn status_error_extracts_upstream_message() {
        let err = UpstreamError::status(429, r#"{"error":{"message":"slow down"}}"#);
        assert_eq!(err.message, "HTTP 429: slow down");
        assert_eq!(err.status_code(), Some(429));

        let plain = UpstreamError::status(500, "<html>oops</html>");
        assert_eq!(plain.message, "HTTP 500");
    }
}
