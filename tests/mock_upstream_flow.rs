// Mock Upstream Server for Testing
// Simulates an Anthropic-dialect upstream and drives the full relay chain:
// HTTP open -> SSE parse -> streaming pipeline -> protocol rendering.
// Run with: cargo test --test mock_upstream_flow

use std::net::SocketAddr;
use std::time::Duration;

use axum::{
    body::Body,
    http::{header, HeaderMap, StatusCode},
    response::Response,
    routing::post,
    Router,
};

use prism_gateway::models::canonical::{StreamEvent, TokenUsage};
use prism_gateway::services::streaming::drain_to_events;
use prism_gateway::services::translator::anthropic::AnthropicStreamRenderer;
use prism_gateway::services::translator::openai::synthesize_response;
use prism_gateway::services::upstream::{AnthropicDriver, ProviderDriver};

// ============================================================================
// Mock upstream
// ============================================================================

const STREAM_BODY: &str = "event: message_start\n\
data: {\"type\":\"message_start\",\"message\":{\"id\":\"msg_1\",\"type\":\"message\",\"role\":\"assistant\",\"content\":[],\"model\":\"claude-4-sonnet\",\"usage\":{\"input_tokens\":100,\"output_tokens\":1}}}\n\n\
event: content_block_start\n\
data: {\"type\":\"content_block_start\",\"index\":0,\"content_block\":{\"type\":\"text\",\"text\":\"\"}}\n\n\
event: content_block_delta\n\
data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"Hello from \"}}\n\n\
event: content_block_delta\n\
data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"upstream\"}}\n\n\
event: content_block_stop\n\
data: {\"type\":\"content_block_stop\",\"index\":0}\n\n\
event: message_delta\n\
data: {\"type\":\"message_delta\",\"delta\":{\"stop_reason\":\"end_turn\"},\"usage\":{\"output_tokens\":400}}\n\n\
event: message_stop\n\
data: {\"type\":\"message_stop\"}\n\n";

async fn mock_messages(headers: HeaderMap) -> Response {
    // The API-key driver authenticates with x-api-key.
    if headers.get("x-api-key").is_none() {
        return Response::builder()
            .status(StatusCode::UNAUTHORIZED)
            .body(Body::from(
                r#"{"error":{"type":"authentication_error","message":"missing key"}}"#,
            ))
            .unwrap();
    }

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .body(Body::from(STREAM_BODY))
        .unwrap()
}

async fn start_mock_upstream() -> SocketAddr {
    let app = Router::new().route("/v1/messages", post(mock_messages));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind mock upstream");
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn request_for(model: &str) -> prism_gateway::models::canonical::CanonicalRequest {
    prism_gateway::models::canonical::CanonicalRequest {
        model: model.to_string(),
        messages: vec![prism_gateway::models::canonical::ChatMessage::user("hi")],
        max_tokens: 1024,
        stream: true,
        tools: Vec::new(),
        sampling: Default::default(),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn driver_relays_mock_upstream_stream_with_usage() {
    let addr = start_mock_upstream().await;
    let driver = ProviderDriver::Anthropic(AnthropicDriver::new(
        "sk-ant-test".to_string(),
        Some(format!("http://{addr}")),
    ));

    let stream = driver
        .open(&request_for("claude-4-sonnet"), None)
        .await
        .expect("upstream open");

    let (events, outcome) = drain_to_events(stream, Duration::from_secs(5), false).await;

    assert_eq!(outcome.status_code, 200);
    assert_eq!(
        outcome.usage,
        TokenUsage {
            prompt_tokens: 100,
            completion_tokens: 400
        }
    );

    let text: String = events
        .iter()
        .filter_map(|event| match event {
            StreamEvent::Content(delta) => Some(delta.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(text, "Hello from upstream");

    // The same event sequence renders as an OpenAI body for a non-streaming
    // caller...
    let body = synthesize_response("claude-4-sonnet", 1, &events);
    assert_eq!(
        body.choices[0].message.content.as_deref(),
        Some("Hello from upstream")
    );
    assert_eq!(body.usage.total_tokens, 500);

    // ...and as a well-formed Anthropic event sequence for a streaming one.
    let mut renderer = AnthropicStreamRenderer::new("claude-4-sonnet");
    let frames: Vec<_> = events.iter().flat_map(|e| renderer.render(e)).collect();
    let names: Vec<&str> = frames.iter().filter_map(|f| f.event.as_deref()).collect();
    assert_eq!(names.first(), Some(&"message_start"));
    assert_eq!(names.last(), Some(&"message_stop"));
    assert_eq!(names.iter().filter(|n| **n == "message_delta").count(), 1);
}

#[tokio::test]
async fn upstream_rejection_surfaces_as_auth_error() {
    let addr = start_mock_upstream().await;
    // Empty key still sends the header; simulate a missing credential by
    // talking to the endpoint directly without one.
    let client = reqwest::Client::new();
    let response = client
        .post(format!("http://{addr}/v1/messages"))
        .json(&serde_json::json!({"model": "claude-4-sonnet"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 401);

    // Through the driver, a 401 is classified as an auth rejection so the
    // dispatcher can invalidate the session and fail over.
    let err = prism_gateway::services::upstream::UpstreamError::status(401, "");
    assert!(err.is_auth_rejection());
    assert!(!err.is_retryable());
}
