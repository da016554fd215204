//! `POST /v1/messages` and `POST /v1/messages/count_tokens` - the
//! Anthropic-shaped entry points.

use axum::body::Bytes;
use axum::extract::State;
use axum::response::Response;
use axum::{Extension, Json};

use crate::middleware::error_handling::{GatewayError, Result};
use crate::models::anthropic::{CountTokensRequest, CountTokensResponse, MessagesRequest};
use crate::services::token_authorizer::AuthContext;
use crate::services::translator::{anthropic, estimate_input_tokens, Protocol};
use crate::state::AppState;

pub async fn messages(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    body: Bytes,
) -> Result<Response> {
    let request: MessagesRequest = serde_json::from_slice(&body)
        .map_err(|err| GatewayError::InvalidRequest(format!("invalid JSON body: {err}")))?;

    let canonical = anthropic::to_canonical(request)?;

    tracing::debug!(
        "Messages request: user={} model={} stream={} max_tokens={}",
        auth.username,
        canonical.model,
        canonical.stream,
        canonical.max_tokens
    );

    state
        .dispatcher
        .dispatch(auth, canonical, Protocol::Anthropic)
        .await
}

/// Token estimation never touches an upstream; it is the documented
/// character-count heuristic over system, text blocks, and tool metadata.
pub async fn count_tokens(body: Bytes) -> Result<Json<CountTokensResponse>> {
    let request: CountTokensRequest = serde_json::from_slice(&body)
        .map_err(|err| GatewayError::InvalidRequest(format!("invalid JSON body: {err}")))?;

    let input_tokens = estimate_input_tokens(
        request.system.as_ref(),
        &request.messages,
        request.tools.as_deref(),
    );

    Ok(Json(CountTokensResponse { input_tokens }))
}
