// ============================================================================
// Streaming Pipeline
// ============================================================================
//
// Takes the driver's canonical event stream and relays it to the client as
// SSE, preserving order, applying the request deadline, reacting to client
// disconnects, and extracting the terminal usage tuple for accounting.
//
// The channel between producer and client is bounded: the producer suspends
// when the client lags, so a response is never buffered whole in memory.
//
// Every path out of the relay funnels into exactly one `StreamOutcome`
// delivered to the completion callback - that is where usage recording and
// post-flight billing hang off.
//
// ============================================================================

use std::convert::Infallible;
use std::time::Duration;

use axum::response::sse::Sse;
use axum::response::{IntoResponse, Response};
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::models::canonical::{StreamEvent, TokenUsage};
use crate::services::translator::anthropic::AnthropicStreamRenderer;
use crate::services::translator::openai::OpenAiStreamRenderer;
use crate::services::translator::tool_calls::ToolCallScanner;
use crate::services::translator::{Protocol, SseFrame};
use crate::services::upstream::EventStream;

/// Bounded frame buffer between producer and client.
const CHANNEL_CAPACITY: usize = 64;

/// Terminal state of one relayed stream.
#[derive(Debug, Clone)]
pub struct StreamOutcome {
    pub usage: TokenUsage,
    pub status_code: i32,
    pub error_message: Option<String>,
}

impl StreamOutcome {
    fn ok(usage: TokenUsage) -> Self {
        Self {
            usage,
            status_code: 200,
            error_message: None,
        }
    }

    fn cancelled(usage: TokenUsage, reason: &str) -> Self {
        Self {
            usage,
            status_code: 499,
            error_message: Some(reason.to_string()),
        }
    }

    fn upstream_error(usage: TokenUsage, message: String) -> Self {
        Self {
            usage,
            status_code: 502,
            error_message: Some(message),
        }
    }
}

enum ProtocolRenderer {
    OpenAi(OpenAiStreamRenderer),
    Anthropic(AnthropicStreamRenderer),
}

impl ProtocolRenderer {
    fn new(protocol: Protocol, model: &str) -> Self {
        match protocol {
            Protocol::OpenAi => {
                ProtocolRenderer::OpenAi(OpenAiStreamRenderer::new(model, chrono::Utc::now().timestamp()))
            }
            Protocol::Anthropic => ProtocolRenderer::Anthropic(AnthropicStreamRenderer::new(model)),
        }
    }

    fn render(&mut self, event: &StreamEvent) -> Vec<SseFrame> {
        match self {
            ProtocolRenderer::OpenAi(renderer) => renderer.render(event),
            ProtocolRenderer::Anthropic(renderer) => renderer.render(event),
        }
    }
}

/// Relays a driver stream to an SSE response. The completion callback fires
/// exactly once, after the client stream is closed, with the final outcome.
pub fn run_streaming<F>(
    mut upstream: EventStream,
    protocol: Protocol,
    model: String,
    deadline: Duration,
    scan_tool_calls: bool,
    on_complete: F,
) -> Response
where
    F: FnOnce(StreamOutcome) + Send + 'static,
{
    let (tx, rx) = mpsc::channel::<Result<axum::response::sse::Event, Infallible>>(CHANNEL_CAPACITY);

    tokio::spawn(async move {
        let mut renderer = ProtocolRenderer::new(protocol, &model);
        let mut scanner = scan_tool_calls.then(ToolCallScanner::new);
        let mut usage = TokenUsage::default();
        let deadline_at = tokio::time::Instant::now() + deadline;

        // `start` goes out immediately, before the first upstream byte.
        let mut send_failed = false;
        for frame in renderer.render(&StreamEvent::Start) {
            if tx.send(Ok(frame.to_axum_event())).await.is_err() {
                send_failed = true;
                break;
            }
        }

        let outcome = if send_failed {
            StreamOutcome::cancelled(usage, "client disconnected")
        } else {
            relay_loop(
                &mut upstream,
                &tx,
                &mut renderer,
                &mut scanner,
                &mut usage,
                deadline_at,
            )
            .await
        };

        drop(tx);
        on_complete(outcome);
    });

    Sse::new(ReceiverStream::new(rx))
        .keep_alive(axum::response::sse::KeepAlive::default())
        .into_response()
}

async fn relay_loop(
    upstream: &mut EventStream,
    tx: &mpsc::Sender<Result<axum::response::sse::Event, Infallible>>,
    renderer: &mut ProtocolRenderer,
    scanner: &mut Option<ToolCallScanner>,
    usage: &mut TokenUsage,
    deadline_at: tokio::time::Instant,
) -> StreamOutcome {
    loop {
        let next = tokio::select! {
            // Client went away: close the upstream (dropped with us) and
            // report the cancellation - it must not be silently swallowed.
            () = tx.closed() => {
                return StreamOutcome::cancelled(*usage, "client disconnected");
            }
            next = tokio::time::timeout_at(deadline_at, upstream.next()) => match next {
                Err(_) => {
                    let frames = renderer.render(&StreamEvent::Error(
                        "request deadline exceeded".to_string(),
                    ));
                    send_frames(tx, frames).await;
                    return StreamOutcome::cancelled(*usage, "request deadline exceeded");
                }
                Ok(next) => next,
            },
        };

        match next {
            Some(Ok(event)) => {
                let events = expand_event(event, scanner, usage);
                for event in events {
                    let terminal = matches!(
                        event,
                        StreamEvent::Done { .. } | StreamEvent::Error(_)
                    );
                    let error_message = match &event {
                        StreamEvent::Error(message) => Some(message.clone()),
                        _ => None,
                    };

                    if !send_frames(tx, renderer.render(&event)).await {
                        return StreamOutcome::cancelled(*usage, "client disconnected");
                    }

                    if terminal {
                        return match error_message {
                            Some(message) => StreamOutcome::upstream_error(*usage, message),
                            None => StreamOutcome::ok(*usage),
                        };
                    }
                }
            }
            Some(Err(err)) => {
                // Malformed chunk or transport failure mid-stream: terminate
                // with a well-formed error frame, bill what was reported.
                let frames = renderer.render(&StreamEvent::Error(err.to_string()));
                send_frames(tx, frames).await;
                return StreamOutcome::upstream_error(*usage, err.to_string());
            }
            None => {
                // Upstream closed without a terminal event.
                let mut events = flush_scanner(scanner);
                events.push(StreamEvent::Done { stop_reason: None });
                for event in events {
                    if !send_frames(tx, renderer.render(&event)).await {
                        return StreamOutcome::cancelled(*usage, "client disconnected");
                    }
                }
                return StreamOutcome::ok(*usage);
            }
        }
    }
}

/// Applies the tool-call scanner to content deltas and captures usage.
fn expand_event(
    event: StreamEvent,
    scanner: &mut Option<ToolCallScanner>,
    usage: &mut TokenUsage,
) -> Vec<StreamEvent> {
    match event {
        StreamEvent::Usage(u) => {
            *usage = u;
            vec![StreamEvent::Usage(u)]
        }
        StreamEvent::Content(delta) => match scanner {
            Some(scanner) => scanner.push(&delta),
            None => vec![StreamEvent::Content(delta)],
        },
        StreamEvent::Done { stop_reason } => {
            let mut events = flush_scanner(scanner);
            events.push(StreamEvent::Done { stop_reason });
            events
        }
        other => vec![other],
    }
}

fn flush_scanner(scanner: &mut Option<ToolCallScanner>) -> Vec<StreamEvent> {
    scanner.as_mut().map(ToolCallScanner::finish).unwrap_or_default()
}

async fn send_frames(
    tx: &mpsc::Sender<Result<axum::response::sse::Event, Infallible>>,
    frames: Vec<SseFrame>,
) -> bool {
    for frame in frames {
        if tx.send(Ok(frame.to_axum_event())).await.is_err() {
            return false;
        }
    }
    true
}

/// Non-streaming wrapper: drains the same pipeline and hands the collected
/// events to the caller for JSON synthesis.
pub async fn drain_to_events(
    mut upstream: EventStream,
    deadline: Duration,
    scan_tool_calls: bool,
) -> (Vec<StreamEvent>, StreamOutcome) {
    let mut events: Vec<StreamEvent> = vec![StreamEvent::Start];
    let mut scanner = scan_tool_calls.then(ToolCallScanner::new);
    let mut usage = TokenUsage::default();
    let deadline_at = tokio::time::Instant::now() + deadline;

    loop {
        let next = match tokio::time::timeout_at(deadline_at, upstream.next()).await {
            Err(_) => {
                events.push(StreamEvent::Error("request deadline exceeded".to_string()));
                return (
                    events,
                    StreamOutcome::cancelled(usage, "request deadline exceeded"),
                );
            }
            Ok(next) => next,
        };

        match next {
            Some(Ok(event)) => {
                for event in expand_event(event, &mut scanner, &mut usage) {
                    match &event {
                        StreamEvent::Done { .. } => {
                            events.push(event);
                            return (events, StreamOutcome::ok(usage));
                        }
                        StreamEvent::Error(message) => {
                            let message = message.clone();
                            events.push(event);
                            return (events, StreamOutcome::upstream_error(usage, message));
                        }
                        _ => events.push(event),
                    }
                }
            }
            Some(Err(err)) => {
                events.push(StreamEvent::Error(err.to_string()));
                return (events, StreamOutcome::upstream_error(usage, err.to_string()));
            }
            None => {
                events.extend(flush_scanner(&mut scanner));
                events.push(StreamEvent::Done { stop_reason: None });
                return (events, StreamOutcome::ok(usage));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::upstream::{UpstreamError, UpstreamErrorKind};

    fn upstream_of(events: Vec<Result<StreamEvent, UpstreamError>>) -> EventStream {
        Box::pin(futures::stream::iter(events))
    }

    #[tokio::test]
    async fn drain_collects_text_usage_and_done() {
        let upstream = upstream_of(vec![
            Ok(StreamEvent::Content("Hello".to_string())),
            Ok(StreamEvent::Usage(TokenUsage {
                prompt_tokens: 100,
                completion_tokens: 400,
            })),
            Ok(StreamEvent::Done {
                stop_reason: Some("stop".to_string()),
            }),
        ]);

        let (events, outcome) = drain_to_events(upstream, Duration::from_secs(5), false).await;
        assert_eq!(outcome.status_code, 200);
        assert_eq!(outcome.usage.total(), 500);
        assert!(events.contains(&StreamEvent::Content("Hello".to_string())));
        assert!(matches!(events.last(), Some(StreamEvent::Done { .. })));
    }

    #[tokio::test]
    async fn drain_reports_midstream_parse_errors_with_partial_usage() {
        let upstream = upstream_of(vec![
            Ok(StreamEvent::Content("par".to_string())),
            Ok(StreamEvent::Usage(TokenUsage {
                prompt_tokens: 10,
                completion_tokens: 3,
            })),
            Err(UpstreamError::new(
                UpstreamErrorKind::Parse,
                "malformed chunk",
            )),
        ]);

        let (events, outcome) = drain_to_events(upstream, Duration::from_secs(5), false).await;
        assert_eq!(outcome.status_code, 502);
        assert_eq!(outcome.usage.total(), 13);
        assert!(matches!(events.last(), Some(StreamEvent::Error(_))));
    }

    #[tokio::test]
    async fn drain_synthesizes_done_when_upstream_closes_early() {
        let upstream = upstream_of(vec![Ok(StreamEvent::Content("half".to_string()))]);
        let (events, outcome) = drain_to_events(upstream, Duration::from_secs(5), false).await;
        assert_eq!(outcome.status_code, 200);
        assert!(outcome.usage.is_zero());
        assert!(matches!(events.last(), Some(StreamEvent::Done { .. })));
    }

    #[tokio::test]
    async fn drain_deadline_yields_499_outcome() {
        // An upstream that never produces anything.
        let upstream: EventStream = Box::pin(futures::stream::pending());
        let (events, outcome) = drain_to_events(upstream, Duration::from_millis(20), false).await;
        assert_eq!(outcome.status_code, 499);
        assert_eq!(
            outcome.error_message.as_deref(),
            Some("request deadline exceeded")
        );
        assert!(matches!(events.last(), Some(StreamEvent::Error(_))));
    }

    #[tokio::test]
    async fn drain_converts_tool_fragments_when_scanning_enabled() {
        let upstream = upstream_of(vec![
            Ok(StreamEvent::Content(
                "<tool_call>\n<function=lookup>\n<parameter=q>rust</parameter>\n</function>\n</tool_call>"
                    .to_string(),
            )),
            Ok(StreamEvent::Done { stop_reason: None }),
        ]);

        let (events, outcome) = drain_to_events(upstream, Duration::from_secs(5), true).await;
        assert_eq!(outcome.status_code, 200);
        assert!(events.iter().any(|event| matches!(
            event,
            StreamEvent::ToolUse { name, .. } if name == "lookup"
        )));
    }

    #[tokio::test]
    async fn streaming_completion_callback_fires_once_with_outcome() {
        let upstream = upstream_of(vec![
            Ok(StreamEvent::Content("hi".to_string())),
            Ok(StreamEvent::Usage(TokenUsage {
                prompt_tokens: 1,
                completion_tokens: 2,
            })),
            Ok(StreamEvent::Done { stop_reason: None }),
        ]);

        let (done_tx, done_rx) = tokio::sync::oneshot::channel();
        let response = run_streaming(
            upstream,
            Protocol::OpenAi,
            "gpt-4o".to_string(),
            Duration::from_secs(5),
            false,
            move |outcome| {
                let _ = done_tx.send(outcome);
            },
        );
        assert_eq!(response.status(), axum::http::StatusCode::OK);

        // Consume the body so the producer can finish.
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let text = String::from_utf8_lossy(&body);
        assert!(text.contains("[DONE]"));

        let outcome = done_rx.await.unwrap();
        assert_eq!(outcome.status_code, 200);
        assert_eq!(outcome.usage.total(), 3);
    }
}
