//! Bearer-token authentication for the `/v1/*` surface.
//!
//! Runs the authorizer's check sequence (model access excluded, the model id
//! is only known after translation) and stores the resulting `AuthContext`
//! in request extensions for the handlers. Failures answer with the shared
//! error envelope; nothing is billed and no usage record exists for them.

use axum::{
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::middleware::error_handling::GatewayError;
use crate::middleware::metrics::AUTH_FAILURES;
use crate::state::AppState;

pub fn extract_bearer_token(auth_header: &str) -> Option<&str> {
    auth_header
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

pub async fn auth_middleware(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let token = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(extract_bearer_token);

    let Some(token) = token else {
        AUTH_FAILURES.with_label_values(&["missing_token"]).inc();
        return GatewayError::KeyNotFound.into_response();
    };

    match state.authorizer.authorize(token, None).await {
        Ok(auth) => {
            request.extensions_mut().insert(auth);
            next.run(request).await
        }
        Err(err) => {
            AUTH_FAILURES.with_label_values(&[err.code()]).inc();
            tracing::debug!(
                "Authorization failed for token {}: {}",
                crate::models::token::mask_token(token),
                err
            );
            err.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bearer_extraction() {
        assert_eq!(extract_bearer_token("Bearer sk-abc"), Some("sk-abc"));
        assert_eq!(extract_bearer_token("Bearer   sk-abc  "), Some("sk-abc"));
        assert_eq!(extract_bearer_token("Basic sk-abc"), None);
        assert_eq!(extract_bearer_token("Bearer "), None);
    }
}
