// ============================================================================
// Error Handling - Closed Gateway Error Taxonomy
// ============================================================================
//
// Every failure a request can hit maps to exactly one variant here, and every
// variant maps to exactly one HTTP status plus the wire error envelope
// `{ "error": { "message", "type", "code" } }` shared by the OpenAI and
// Anthropic protocols.
//
// 🔒 SECURITY: internal failures (database, encryption) are logged server-side
// with full detail and surfaced to clients as generic messages only.
//
// ============================================================================

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GatewayError {
    // --- Request-shape errors (400, never billed) ---
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Unknown model: {0}")]
    InvalidModel(String),

    // --- Authorization errors (401/403, never billed) ---
    #[error("API key not found")]
    KeyNotFound,

    #[error("API key has been disabled")]
    KeyDisabled,

    #[error("User account is disabled")]
    UserDisabled,

    #[error("API key has expired")]
    KeyExpired,

    #[error("Model not allowed for this API key: {0}")]
    ModelNotAllowed(String),

    // --- Quota errors (402/429, never billed) ---
    #[error("API key quota exceeded")]
    QuotaExceeded,

    #[error("Account balance exhausted")]
    BalanceExhausted,

    #[error("Too many requests")]
    RateLimited,

    // --- Upstream errors ---
    #[error("No provider available for model: {0}")]
    ProviderNotAvailable(String),

    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("Request cancelled: {0}")]
    Cancelled(String),

    // --- Internal errors (500, never retried to avoid double billing) ---
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Encryption operation failed")]
    Encryption,

    #[error("Internal server error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl From<crate::services::encryption_service::EncryptionError> for GatewayError {
    fn from(err: crate::services::encryption_service::EncryptionError) -> Self {
        tracing::error!("Encryption error: {:?}", err);
        GatewayError::Encryption
    }
}

/// Non-standard status used for client-abandoned requests; axum has no
/// constant for it.
const STATUS_CLIENT_CLOSED_REQUEST: u16 = 499;

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::InvalidRequest(_) | GatewayError::InvalidModel(_) => {
                StatusCode::BAD_REQUEST
            }
            GatewayError::KeyNotFound | GatewayError::KeyDisabled | GatewayError::KeyExpired => {
                StatusCode::UNAUTHORIZED
            }
            GatewayError::UserDisabled | GatewayError::ModelNotAllowed(_) => StatusCode::FORBIDDEN,
            GatewayError::QuotaExceeded | GatewayError::RateLimited => {
                StatusCode::TOO_MANY_REQUESTS
            }
            GatewayError::BalanceExhausted => StatusCode::PAYMENT_REQUIRED,
            GatewayError::ProviderNotAvailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::Upstream(_) => StatusCode::BAD_GATEWAY,
            GatewayError::Cancelled(_) => {
                StatusCode::from_u16(STATUS_CLIENT_CLOSED_REQUEST).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            GatewayError::Database(_) | GatewayError::Encryption | GatewayError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Protocol `type` field of the error envelope.
    pub fn error_type(&self) -> &'static str {
        match self {
            GatewayError::InvalidRequest(_) | GatewayError::InvalidModel(_) => {
                "invalid_request_error"
            }
            GatewayError::KeyNotFound | GatewayError::KeyDisabled | GatewayError::KeyExpired => {
                "authentication_error"
            }
            GatewayError::UserDisabled | GatewayError::ModelNotAllowed(_) => "permission_error",
            GatewayError::QuotaExceeded | GatewayError::RateLimited => "rate_limit_error",
            GatewayError::BalanceExhausted => "api_error",
            GatewayError::ProviderNotAvailable(_) => "service_unavailable",
            GatewayError::Upstream(_) | GatewayError::Cancelled(_) => "api_error",
            GatewayError::Database(_) | GatewayError::Encryption | GatewayError::Internal(_) => {
                "api_error"
            }
        }
    }

    /// Protocol `code` field of the error envelope.
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::InvalidRequest(_) => "invalid_request",
            GatewayError::InvalidModel(_) => "invalid_model",
            GatewayError::KeyNotFound => "key_not_found",
            GatewayError::KeyDisabled => "key_disabled",
            GatewayError::UserDisabled => "user_disabled",
            GatewayError::KeyExpired => "expired",
            GatewayError::ModelNotAllowed(_) => "model_not_allowed",
            GatewayError::QuotaExceeded => "quota_exceeded",
            GatewayError::BalanceExhausted => "balance_exhausted",
            GatewayError::RateLimited => "rate_limited",
            GatewayError::ProviderNotAvailable(_) => "provider_not_available",
            GatewayError::Upstream(_) => "upstream_error",
            GatewayError::Cancelled(_) => "request_cancelled",
            GatewayError::Database(_) | GatewayError::Encryption | GatewayError::Internal(_) => {
                "internal_error"
            }
        }
    }

    /// Client-facing message. Internal variants return a generic message;
    /// the detailed error stays in server logs.
    fn client_message(&self) -> String {
        match self {
            GatewayError::Database(err) => {
                tracing::error!("Database error: {:?}", err);
                "Internal server error".to_string()
            }
            GatewayError::Internal(err) => {
                tracing::error!("Internal error: {:?}", err);
                "Internal server error".to_string()
            }
            GatewayError::Encryption => "Internal server error".to_string(),
            other => other.to_string(),
        }
    }

    pub fn envelope(&self) -> serde_json::Value {
        json!({
            "error": {
                "message": self.client_message(),
                "type": self.error_type(),
                "code": self.code(),
            }
        })
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = Json(self.envelope());
        (status, body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_errors_map_to_401_with_codes() {
        assert_eq!(GatewayError::KeyNotFound.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(GatewayError::KeyNotFound.code(), "key_not_found");
        assert_eq!(GatewayError::KeyDisabled.code(), "key_disabled");
        assert_eq!(GatewayError::KeyExpired.code(), "expired");
    }

    #[test]
    fn model_not_allowed_is_403_permission_error() {
        let err = GatewayError::ModelNotAllowed("claude-4-sonnet".to_string());
        assert_eq!(err.status(), StatusCode::FORBIDDEN);
        assert_eq!(err.error_type(), "permission_error");
        assert_eq!(err.code(), "model_not_allowed");
    }

    #[test]
    fn cancellation_uses_status_499() {
        assert_eq!(
            GatewayError::Cancelled("client disconnected".to_string())
                .status()
                .as_u16(),
            499
        );
    }

    #[test]
    fn envelope_has_message_type_code() {
        let envelope = GatewayError::QuotaExceeded.envelope();
        assert_eq!(envelope["error"]["type"], "rate_limit_error");
        assert_eq!(envelope["error"]["code"], "quota_exceeded");
        assert!(envelope["error"]["message"].is_string());
    }

    #[test]
    fn internal_errors_never_leak_details() {
        let err = GatewayError::Internal(anyhow::anyhow!("pool at /var/lib exploded"));
        let envelope = err.envelope();
        let message = envelope["error"]["message"].as_str().unwrap();
        assert!(!message.contains("/var/lib"));
    }
}
