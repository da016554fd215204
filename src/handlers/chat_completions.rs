//! `POST /v1/chat/completions` - the OpenAI-shaped entry point.

use axum::body::Bytes;
use axum::extract::State;
use axum::response::Response;
use axum::Extension;

use crate::middleware::error_handling::{GatewayError, Result};
use crate::models::openai::ChatCompletionRequest;
use crate::services::token_authorizer::AuthContext;
use crate::services::translator::{openai, Protocol};
use crate::state::AppState;

pub async fn chat_completions(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    body: Bytes,
) -> Result<Response> {
    // Body parsing is manual so shape errors answer in the protocol's own
    // error envelope rather than axum's default rejection.
    let request: ChatCompletionRequest = serde_json::from_slice(&body)
        .map_err(|err| GatewayError::InvalidRequest(format!("invalid JSON body: {err}")))?;

    let canonical = openai::to_canonical(request)?;

    tracing::debug!(
        "Chat completion: user={} model={} stream={} messages={}",
        auth.username,
        canonical.model,
        canonical.stream,
        canonical.messages.len()
    );

    state
        .dispatcher
        .dispatch(auth, canonical, Protocol::OpenAi)
        .await
}
