pub mod config;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod repositories;
pub mod services;
pub mod state;

use axum::http::{header, HeaderValue, Method};
use axum::{
    middleware as axum_middleware,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;

use crate::middleware::ip_rate_limiter::RateLimiter;
use crate::state::AppState;

pub fn create_app(state: AppState) -> Router {
    let rate_limiter = Arc::new(RateLimiter::new(&state.config.rate_limit));

    let cors_origins: Vec<HeaderValue> = state
        .config
        .cors_origins
        .iter()
        .filter_map(|origin| match origin.parse() {
            Ok(header_value) => Some(header_value),
            Err(err) => {
                tracing::error!("❌ Invalid CORS origin '{}': {}", origin, err);
                None
            }
        })
        .collect();

    let cors = CorsLayer::new()
        .allow_origin(cors_origins)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE, header::ACCEPT]);

    Router::new()
        .nest(
            "/v1",
            Router::new()
                .route("/chat/completions", post(handlers::chat_completions::chat_completions))
                .route("/messages", post(handlers::messages::messages))
                .route("/messages/count_tokens", post(handlers::messages::count_tokens))
                .route("/models", get(handlers::models::list_models))
                .layer(axum_middleware::from_fn_with_state(
                    state.clone(),
                    middleware::auth_middleware,
                )),
        )
        // 📊 OBSERVABILITY: Prometheus scrape endpoint (public)
        .route("/metrics", get(middleware::metrics_handler))
        .layer(
            ServiceBuilder::new()
                .layer(axum_middleware::from_fn(middleware::metrics_middleware))
                .layer(axum_middleware::from_fn(middleware::request_id_middleware))
                .layer(axum::Extension(rate_limiter))
                .layer(axum_middleware::from_fn(middleware::rate_limit_middleware))
                .layer(cors),
        )
        .with_state(state)
}
