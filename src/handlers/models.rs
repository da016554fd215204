//! `GET /v1/models` - ids and metadata of the models a configured driver
//! can actually serve.

use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};

use crate::state::AppState;

pub async fn list_models(State(state): State<AppState>) -> Json<Value> {
    let data: Vec<Value> = state
        .registry
        .list_available_models()
        .iter()
        .map(|model| {
            json!({
                "id": model.id,
                "object": "model",
                "owned_by": model.provider,
                "max_tokens": model.max_tokens,
                "context_window": model.context_window,
            })
        })
        .collect();

    Json(json!({ "object": "list", "data": data }))
}
