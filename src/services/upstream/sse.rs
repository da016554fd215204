//! SSE parsers that turn upstream byte streams into canonical `StreamEvent`s.
//!
//! Two upstream dialects exist: OpenAI chat-completion chunks (`data:` lines
//! terminated by `data: [DONE]`) and Anthropic typed events
//! (`message_start` … `message_stop`). Both parsers are plain `Stream`
//! adapters over `eventsource-stream`, so chunked delivery, CRLF line
//! endings, and UTF-8 split across TCP segments are handled underneath.

use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll};

use eventsource_stream::{Event as SseEvent, EventStream, Eventsource};
use futures::Stream;
use serde::Deserialize;
use serde_json::Value;

use crate::models::canonical::{StreamEvent, TokenUsage};
use crate::models::openai::ChatCompletionChunk;
use crate::services::upstream::{UpstreamError, UpstreamErrorKind};

type ParseResult = Result<StreamEvent, UpstreamError>;

// ============================================================================
// OpenAI dialect
// ============================================================================

/// Parses OpenAI streaming chunks. Usage arrives on the final pre-[DONE]
/// chunk when `stream_options.include_usage` was requested; tool-call
/// fragments are accumulated per index and emitted when the stream finishes.
pub struct OpenAiSseParser<S> {
    inner: EventStream<S>,
    pending: VecDeque<ParseResult>,
    stop_reason: Option<String>,
    tool_calls: Vec<PartialToolCall>,
    finished: bool,
}

#[derive(Default)]
struct PartialToolCall {
    id: String,
    name: String,
    arguments: String,
}

impl<S> OpenAiSseParser<S> {
    pub fn new(stream: S) -> Self
    where
        S: Eventsource,
    {
        Self {
            inner: stream.eventsource(),
            pending: VecDeque::new(),
            stop_reason: None,
            tool_calls: Vec::new(),
            finished: false,
        }
    }

    fn handle_event(&mut self, event: &SseEvent) {
        let data = event.data.trim();
        if data.is_empty() {
            return;
        }
        if data == "[DONE]" {
            self.flush_tool_calls();
            self.pending.push_back(Ok(StreamEvent::Done {
                stop_reason: self.stop_reason.take(),
            }));
            self.finished = true;
            return;
        }

        let chunk: ChatCompletionChunk = match serde_json::from_str(data) {
            Ok(chunk) => chunk,
            Err(err) => {
                // Mid-stream error envelopes are not chunks.
                if let Ok(value) = serde_json::from_str::<Value>(data) {
                    if let Some(message) = value
                        .get("error")
                        .and_then(|e| e.get("message"))
                        .and_then(Value::as_str)
                    {
                        self.pending
                            .push_back(Ok(StreamEvent::Error(message.to_string())));
                        return;
                    }
                }
                self.pending.push_back(Err(UpstreamError::new(
                    UpstreamErrorKind::Parse,
                    format!("malformed chunk: {err}"),
                )));
                return;
            }
        };

        if let Some(usage) = chunk.usage {
            self.pending.push_back(Ok(StreamEvent::Usage(TokenUsage {
                prompt_tokens: usage.prompt_tokens,
                completion_tokens: usage.completion_tokens,
            })));
        }

        for choice in chunk.choices {
            if let Some(content) = choice.delta.content {
                if !content.is_empty() {
                    self.pending.push_back(Ok(StreamEvent::Content(content)));
                }
            }
            if let Some(calls) = choice.delta.tool_calls {
                for call in calls {
                    let index = call.index as usize;
                    if self.tool_calls.len() <= index {
                        self.tool_calls.resize_with(index + 1, PartialToolCall::default);
                    }
                    let partial = &mut self.tool_calls[index];
                    if !call.id.is_empty() {
                        partial.id = call.id;
                    }
                    if !call.function.name.is_empty() {
                        partial.name = call.function.name;
                    }
                    partial.arguments.push_str(&call.function.arguments);
                }
            }
            if let Some(reason) = choice.finish_reason {
                self.stop_reason = Some(reason);
            }
        }
    }

    fn flush_tool_calls(&mut self) {
        for call in self.tool_calls.drain(..) {
            if call.name.is_empty() {
                continue;
            }
            let input = serde_json::from_str(&call.arguments).unwrap_or(Value::Null);
            self.pending.push_back(Ok(StreamEvent::ToolUse {
                id: call.id,
                name: call.name,
                input,
            }));
        }
    }
}

impl<S, E> Stream for OpenAiSseParser<S>
where
    S: Stream<Item = Result<bytes::Bytes, E>> + Unpin,
    E: std::error::Error + Send + Sync + 'static,
{
    type Item = ParseResult;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Poll::Ready(Some(event));
            }
            if self.finished {
                return Poll::Ready(None);
            }
            match Pin::new(&mut self.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(event))) => self.handle_event(&event),
                Poll::Ready(Some(Err(err))) => {
                    return Poll::Ready(Some(Err(UpstreamError::new(
                        UpstreamErrorKind::Parse,
                        format!("SSE stream error: {err}"),
                    ))));
                }
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

// ============================================================================
// Anthropic dialect
// ============================================================================

/// Parses Anthropic typed SSE events. `input_tokens` arrives on
/// `message_start`, `output_tokens` on `message_delta`; the usage event is
/// synthesized once both halves are known.
pub struct AnthropicSseParser<S> {
    inner: EventStream<S>,
    pending: VecDeque<ParseResult>,
    input_tokens: i64,
    stop_reason: Option<String>,
    /// Accumulating tool_use block, keyed by content-block index.
    open_tool: Option<(usize, String, String, String)>, // (index, id, name, json)
    finished: bool,
}

impl<S> AnthropicSseParser<S> {
    pub fn new(stream: S) -> Self
    where
        S: Eventsource,
    {
        Self {
            inner: stream.eventsource(),
            pending: VecDeque::new(),
            input_tokens: 0,
            stop_reason: None,
            open_tool: None,
            finished: false,
        }
    }

    fn handle_event(&mut self, event: &SseEvent) {
        let data = event.data.trim();
        match event.event.as_str() {
            "ping" => {}
            "message_start" => {
                if let Ok(parsed) = serde_json::from_str::<MessageStart>(data) {
                    self.input_tokens = parsed.message.usage.input_tokens;
                }
            }
            "content_block_start" => {
                if let Ok(parsed) = serde_json::from_str::<ContentBlockStart>(data) {
                    if parsed.content_block.block_type == "tool_use" {
                        self.open_tool = Some((
                            parsed.index,
                            parsed.content_block.id.unwrap_or_default(),
                            parsed.content_block.name.unwrap_or_default(),
                            String::new(),
                        ));
                    }
                }
            }
            "content_block_delta" => match serde_json::from_str::<ContentBlockDelta>(data) {
                Ok(parsed) => match parsed.delta.delta_type.as_str() {
                    "text_delta" => {
                        let text = parsed.delta.text.unwrap_or_default();
                        if !text.is_empty() {
                            self.pending.push_back(Ok(StreamEvent::Content(text)));
                        }
                    }
                    "input_json_delta" => {
                        if let Some((index, _, _, json)) = self.open_tool.as_mut() {
                            if *index == parsed.index {
                                json.push_str(&parsed.delta.partial_json.unwrap_or_default());
                            }
                        }
                    }
                    // thinking/signature deltas are upstream-internal
                    _ => {}
                },
                Err(err) => self.pending.push_back(Err(UpstreamError::new(
                    UpstreamErrorKind::Parse,
                    format!("malformed content_block_delta: {err}"),
                ))),
            },
            "content_block_stop" => {
                if let Ok(parsed) = serde_json::from_str::<ContentBlockStop>(data) {
                    let closes_tool = self
                        .open_tool
                        .as_ref()
                        .map(|(index, ..)| *index == parsed.index)
                        .unwrap_or(false);
                    if closes_tool {
                        let (_, id, name, json) = self.open_tool.take().expect("checked above");
                        let input = serde_json::from_str(&json).unwrap_or(Value::Null);
                        self.pending
                            .push_back(Ok(StreamEvent::ToolUse { id, name, input }));
                    }
                }
            }
            "message_delta" => {
                if let Ok(parsed) = serde_json::from_str::<MessageDelta>(data) {
                    if let Some(reason) = parsed.delta.stop_reason {
                        self.stop_reason = Some(reason);
                    }
                    if let Some(usage) = parsed.usage {
                        self.pending.push_back(Ok(StreamEvent::Usage(TokenUsage {
                            prompt_tokens: self.input_tokens,
                            completion_tokens: usage.output_tokens,
                        })));
                    }
                }
            }
            "message_stop" => {
                self.pending.push_back(Ok(StreamEvent::Done {
                    stop_reason: self.stop_reason.take(),
                }));
                self.finished = true;
            }
            "error" => {
                let message = serde_json::from_str::<ErrorEvent>(data)
                    .map(|e| format!("{}: {}", e.error.error_type, e.error.message))
                    .unwrap_or_else(|_| data.to_string());
                self.pending.push_back(Ok(StreamEvent::Error(message)));
                self.finished = true;
            }
            other => {
                tracing::debug!("Ignoring unknown upstream SSE event type: {}", other);
            }
        }
    }
}

impl<S, E> Stream for AnthropicSseParser<S>
where
    S: Stream<Item = Result<bytes::Bytes, E>> + Unpin,
    E: std::error::Error + Send + Sync + 'static,
{
    type Item = ParseResult;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Poll::Ready(Some(event));
            }
            if self.finished {
                return Poll::Ready(None);
            }
            match Pin::new(&mut self.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(event))) => self.handle_event(&event),
                Poll::Ready(Some(Err(err))) => {
                    return Poll::Ready(Some(Err(UpstreamError::new(
                        UpstreamErrorKind::Parse,
                        format!("SSE stream error: {err}"),
                    ))));
                }
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

// === Anthropic SSE payload structures ===

#[derive(Debug, Deserialize)]
struct MessageStart {
    message: MessageInfo,
}

#[derive(Debug, Deserialize)]
struct MessageInfo {
    #[serde(default)]
    usage: StartUsage,
}

#[derive(Debug, Default, Deserialize)]
struct StartUsage {
    #[serde(default)]
    input_tokens: i64,
}

#[derive(Debug, Deserialize)]
struct ContentBlockStart {
    index: usize,
    content_block: StartBlock,
}

#[derive(Debug, Deserialize)]
struct StartBlock {
    #[serde(rename = "type")]
    block_type: String,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ContentBlockDelta {
    index: usize,
    delta: DeltaBody,
}

#[derive(Debug, Deserialize)]
struct DeltaBody {
    #[serde(rename = "type")]
    delta_type: String,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    partial_json: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ContentBlockStop {
    index: usize,
}

#[derive(Debug, Deserialize)]
struct MessageDelta {
    delta: MessageDeltaInner,
    #[serde(default)]
    usage: Option<DeltaUsage>,
}

#[derive(Debug, Deserialize)]
struct MessageDeltaInner {
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DeltaUsage {
    #[serde(default)]
    output_tokens: i64,
}

#[derive(Debug, Deserialize)]
struct ErrorEvent {
    error: ErrorInfo,
}

#[derive(Debug, Deserialize)]
struct ErrorInfo {
    #[serde(rename = "type")]
    error_type: String,
    message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn mock_byte_stream(
        data: &str,
        chunk_size: usize,
    ) -> impl Stream<Item = Result<bytes::Bytes, std::io::Error>> {
        let chunks: Vec<_> = data
            .as_bytes()
            .chunks(chunk_size)
            .map(|c| Ok(bytes::Bytes::copy_from_slice(c)))
            .collect();
        futures::stream::iter(chunks)
    }

    const ANTHROPIC_TEXT_STREAM: &str = r#"event: message_start
data: {"type":"message_start","message":{"id":"msg_1","type":"message","role":"assistant","content":[],"model":"claude-4-sonnet","usage":{"input_tokens":100,"output_tokens":1}}}

event: content_block_start
data: {"type":"content_block_start","index":0,"content_block":{"type":"text","text":""}}

event: ping
data: {"type":"ping"}

event: content_block_delta
data: {"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hello"}}

event: content_block_delta
data: {"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":" world"}}

event: content_block_stop
data: {"type":"content_block_stop","index":0}

event: message_delta
data: {"type":"message_delta","delta":{"stop_reason":"end_turn"},"usage":{"output_tokens":400}}

event: message_stop
data: {"type":"message_stop"}

"#;

    #[tokio::test]
    async fn anthropic_parser_text_stream() {
        let mut parser = AnthropicSseParser::new(mock_byte_stream(ANTHROPIC_TEXT_STREAM, 50));

        let mut events = Vec::new();
        while let Some(result) = parser.next().await {
            events.push(result.expect("valid event"));
        }

        assert_eq!(
            events,
            vec![
                StreamEvent::Content("Hello".to_string()),
                StreamEvent::Content(" world".to_string()),
                StreamEvent::Usage(TokenUsage {
                    prompt_tokens: 100,
                    completion_tokens: 400
                }),
                StreamEvent::Done {
                    stop_reason: Some("end_turn".to_string())
                },
            ]
        );
    }

    #[tokio::test]
    async fn anthropic_parser_accumulates_tool_use() {
        let stream = r#"event: message_start
data: {"type":"message_start","message":{"usage":{"input_tokens":20}}}

event: content_block_start
data: {"type":"content_block_start","index":0,"content_block":{"type":"tool_use","id":"toolu_1","name":"get_weather"}}

event: content_block_delta
data: {"type":"content_block_delta","index":0,"delta":{"type":"input_json_delta","partial_json":"{\"city\": "}}

event: content_block_delta
data: {"type":"content_block_delta","index":0,"delta":{"type":"input_json_delta","partial_json":"\"Lisbon\"}"}}

event: content_block_stop
data: {"type":"content_block_stop","index":0}

event: message_delta
data: {"type":"message_delta","delta":{"stop_reason":"tool_use"},"usage":{"output_tokens":25}}

event: message_stop
data: {"type":"message_stop"}

"#;
        let mut parser = AnthropicSseParser::new(mock_byte_stream(stream, 37));

        let mut events = Vec::new();
        while let Some(result) = parser.next().await {
            events.push(result.expect("valid event"));
        }

        assert_eq!(
            events[0],
            StreamEvent::ToolUse {
                id: "toolu_1".to_string(),
                name: "get_weather".to_string(),
                input: serde_json::json!({"city": "Lisbon"}),
            }
        );
        assert!(matches!(events[1], StreamEvent::Usage(_)));
        assert_eq!(
            events[2],
            StreamEvent::Done {
                stop_reason: Some("tool_use".to_string())
            }
        );
    }

    #[tokio::test]
    async fn anthropic_parser_surfaces_midstream_errors() {
        let stream = "event: error\ndata: {\"type\":\"error\",\"error\":{\"type\":\"overloaded_error\",\"message\":\"try later\"}}\n\n";
        let mut parser = AnthropicSseParser::new(mock_byte_stream(stream, 16));

        let event = parser.next().await.unwrap().unwrap();
        assert_eq!(
            event,
            StreamEvent::Error("overloaded_error: try later".to_string())
        );
        assert!(parser.next().await.is_none());
    }

    #[tokio::test]
    async fn openai_parser_text_stream_with_usage() {
        let stream = concat!(
            "data: {\"id\":\"c1\",\"object\":\"chat.completion.chunk\",\"created\":1,\"model\":\"gpt-4o\",\"choices\":[{\"index\":0,\"delta\":{\"role\":\"assistant\"},\"finish_reason\":null}]}\n\n",
            "data: {\"id\":\"c1\",\"object\":\"chat.completion.chunk\",\"created\":1,\"model\":\"gpt-4o\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"Hi\"},\"finish_reason\":null}]}\n\n",
            "data: {\"id\":\"c1\",\"object\":\"chat.completion.chunk\",\"created\":1,\"model\":\"gpt-4o\",\"choices\":[{\"index\":0,\"delta\":{},\"finish_reason\":\"stop\"}]}\n\n",
            "data: {\"id\":\"c1\",\"object\":\"chat.completion.chunk\",\"created\":1,\"model\":\"gpt-4o\",\"choices\":[],\"usage\":{\"prompt_tokens\":100,\"completion_tokens\":400,\"total_tokens\":500}}\n\n",
            "data: [DONE]\n\n",
        );
        let mut parser = OpenAiSseParser::new(mock_byte_stream(stream, 64));

        let mut events = Vec::new();
        while let Some(result) = parser.next().await {
            events.push(result.expect("valid event"));
        }

        assert_eq!(
            events,
            vec![
                StreamEvent::Content("Hi".to_string()),
                StreamEvent::Usage(TokenUsage {
                    prompt_tokens: 100,
                    completion_tokens: 400
                }),
                StreamEvent::Done {
                    stop_reason: Some("stop".to_string())
                },
            ]
        );
    }

    #[tokio::test]
    async fn openai_parser_crlf_line_endings() {
        let stream = "data: {\"id\":\"c\",\"object\":\"chat.completion.chunk\",\"created\":1,\"model\":\"m\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"ok\"},\"finish_reason\":null}]}\r\n\r\ndata: [DONE]\r\n\r\n";
        let mut parser = OpenAiSseParser::new(mock_byte_stream(stream, 10));

        let mut events = Vec::new();
        while let Some(result) = parser.next().await {
            events.push(result.expect("valid event"));
        }
        assert_eq!(events.len(), 2);
        assert_eq!(events[0], StreamEvent::Content("ok".to_string()));
    }

    #[tokio::test]
    async fn openai_parser_assembles_streamed_tool_calls() {
        let stream = concat!(
            "data: {\"id\":\"c\",\"object\":\"chat.completion.chunk\",\"created\":1,\"model\":\"m\",\"choices\":[{\"index\":0,\"delta\":{\"tool_calls\":[{\"index\":0,\"id\":\"call_1\",\"type\":\"function\",\"function\":{\"name\":\"lookup\",\"arguments\":\"{\\\"q\\\":\"}}]},\"finish_reason\":null}]}\n\n",
            "data: {\"id\":\"c\",\"object\":\"chat.completion.chunk\",\"created\":1,\"model\":\"m\",\"choices\":[{\"index\":0,\"delta\":{\"tool_calls\":[{\"index\":0,\"id\":\"\",\"type\":\"function\",\"function\":{\"name\":\"\",\"arguments\":\"\\\"rust\\\"}\"}}]},\"finish_reason\":\"tool_calls\"}]}\n\n",
            "data: [DONE]\n\n",
        );
        let mut parser = OpenAiSseParser::new(mock_byte_stream(stream, 48));

        let mut events = Vec::new();
        while let Some(result) = parser.next().await {
            events.push(result.expect("valid event"));
        }

        assert_eq!(
            events[0],
            StreamEvent::ToolUse {
                id: "call_1".to_string(),
                name: "lookup".to_string(),
                input: serde_json::json!({"q": "rust"}),
            }
        );
        assert_eq!(
            events[1],
            StreamEvent::Done {
                stop_reason: Some("tool_calls".to_string())
            }
        );
    }
}
