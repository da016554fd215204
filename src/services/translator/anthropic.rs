//! Anthropic messages protocol: inbound conversion and outbound rendering.

use serde_json::json;
use uuid::Uuid;

use crate::middleware::error_handling::Result;
use crate::models::anthropic::{
    AnthropicContent, AnthropicMessageResponse, AnthropicUsage, MessagesRequest, SystemPrompt,
};
use crate::models::canonical::{
    CanonicalRequest, ChatMessage, ContentBlock, MessageContent, SamplingParams, StreamEvent,
    TokenUsage, ToolDefinition,
};
use crate::services::translator::{finish_canonical, resolve_model, SseFrame};

pub fn to_canonical(request: MessagesRequest) -> Result<CanonicalRequest> {
    let model = resolve_model(&request.model)?;

    let mut messages: Vec<ChatMessage> = Vec::with_capacity(request.messages.len() + 1);

    // `system` (string or block list) becomes the leading system message.
    if let Some(system) = &request.system {
        let text = match system {
            SystemPrompt::Text(text) => text.clone(),
            SystemPrompt::Blocks(_) => system.text(),
        };
        if !text.is_empty() {
            messages.push(ChatMessage::system(text));
        }
    }

    for message in &request.messages {
        let content = match &message.content {
            AnthropicContent::Text(text) => MessageContent::Text(text.clone()),
            AnthropicContent::Blocks(blocks) => MessageContent::Blocks(blocks.clone()),
        };
        messages.push(ChatMessage {
            role: message.role.clone(),
            content,
        });
    }

    let tools: Vec<ToolDefinition> = request
        .tools
        .unwrap_or_default()
        .into_iter()
        .map(|tool| ToolDefinition {
            name: tool.name,
            description: tool.description.unwrap_or_default(),
            input_schema: tool.input_schema.unwrap_or(serde_json::Value::Null),
        })
        .collect();

    finish_canonical(
        model,
        messages,
        request.max_tokens,
        request.stream.unwrap_or(false),
        tools,
        SamplingParams {
            temperature: request.temperature,
            top_p: request.top_p,
            stop_sequences: request.stop_sequences,
        },
    )
}

// ============================================================================
// Outbound streaming
// ============================================================================

/// Renders canonical events as the Anthropic event sequence:
/// `message_start`, `content_block_start`, `content_block_delta`*,
/// `content_block_stop`, `message_delta` (stop_reason + usage),
/// `message_stop`. The single `message_delta` is the only carrier of usage.
pub struct AnthropicStreamRenderer {
    id: String,
    model: String,
    block_index: usize,
    text_block_open: bool,
    usage: TokenUsage,
    finished: bool,
}

impl AnthropicStreamRenderer {
    pub fn new(model: &str) -> Self {
        Self {
            id: format!("msg_{}", Uuid::new_v4().simple()),
            model: model.to_string(),
            block_index: 0,
            text_block_open: false,
            usage: TokenUsage::default(),
            finished: false,
        }
    }

    pub fn render(&mut self, event: &StreamEvent) -> Vec<SseFrame> {
        if self.finished {
            return Vec::new();
        }
        match event {
            StreamEvent::Start => {
                vec![SseFrame::named(
                    "message_start",
                    json!({
                        "type": "message_start",
                        "message": {
                            "id": self.id,
                            "type": "message",
                            "role": "assistant",
                            "model": self.model,
                            "content": [],
                            "stop_reason": null,
                            "stop_sequence": null,
                            "usage": {"input_tokens": 0, "output_tokens": 0},
                        },
                    })
                    .to_string(),
                )]
            }
            StreamEvent::Content(delta) => {
                let mut frames = Vec::with_capacity(2);
                if !self.text_block_open {
                    frames.push(self.block_start_text());
                    self.text_block_open = true;
                }
                frames.push(SseFrame::named(
                    "content_block_delta",
                    json!({
                        "type": "content_block_delta",
                        "index": self.block_index,
                        "delta": {"type": "text_delta", "text": delta},
                    })
                    .to_string(),
                ));
                frames
            }
            StreamEvent::ToolUse { id, name, input } => {
                let mut frames = Vec::with_capacity(4);
                self.close_text_block(&mut frames);
                let index = self.block_index;
                frames.push(SseFrame::named(
                    "content_block_start",
                    json!({
                        "type": "content_block_start",
                        "index": index,
                        "content_block": {"type": "tool_use", "id": id, "name": name, "input": {}},
                    })
                    .to_string(),
                ));
                frames.push(SseFrame::named(
                    "content_block_delta",
                    json!({
                        "type": "content_block_delta",
                        "index": index,
                        "delta": {"type": "input_json_delta", "partial_json": input.to_string()},
                    })
                    .to_string(),
                ));
                frames.push(SseFrame::named(
                    "content_block_stop",
                    json!({"type": "content_block_stop", "index": index}).to_string(),
                ));
                self.block_index += 1;
                frames
            }
            StreamEvent::Usage(usage) => {
                self.usage = *usage;
                Vec::new()
            }
            StreamEvent::Error(message) => {
                self.finished = true;
                vec![SseFrame::named(
                    "error",
                    json!({
                        "type": "error",
                        "error": {"type": "api_error", "message": message},
                    })
                    .to_string(),
                )]
            }
            StreamEvent::Done { stop_reason } => {
                self.finished = true;
                let mut frames = Vec::with_capacity(4);
                self.close_text_block(&mut frames);
                frames.push(SseFrame::named(
                    "message_delta",
                    json!({
                        "type": "message_delta",
                        "delta": {
                            "stop_reason": stop_reason.clone().unwrap_or_else(|| "end_turn".to_string()),
                            "stop_sequence": null,
                        },
                        "usage": {
                            "input_tokens": self.usage.prompt_tokens,
                            "output_tokens": self.usage.completion_tokens,
                        },
                    })
                    .to_string(),
                ));
                frames.push(SseFrame::named(
                    "message_stop",
                    json!({"type": "message_stop"}).to_string(),
                ));
                frames
            }
        }
    }

    fn block_start_text(&self) -> SseFrame {
        SseFrame::named(
            "content_block_start",
            json!({
                "type": "content_block_start",
                "index": self.block_index,
                "content_block": {"type": "text", "text": ""},
            })
            .to_string(),
        )
    }

    fn close_text_block(&mut self, frames: &mut Vec<SseFrame>) {
        if self.text_block_open {
            frames.push(SseFrame::named(
                "content_block_stop",
                json!({"type": "content_block_stop", "index": self.block_index}).to_string(),
            ));
            self.text_block_open = false;
            self.block_index += 1;
        }
    }
}

// ============================================================================
// Non-streaming synthesis
// ============================================================================

pub fn synthesize_response(model: &str, events: &[StreamEvent]) -> AnthropicMessageResponse {
    let mut text = String::new();
    let mut content: Vec<ContentBlock> = Vec::new();
    let mut usage = TokenUsage::default();
    let mut stop_reason = None;

    for event in events {
        match event {
            StreamEvent::Content(delta) => text.push_str(delta),
            StreamEvent::ToolUse { id, name, input } => {
                if !text.is_empty() {
                    content.push(ContentBlock::Text(std::mem::take(&mut text)));
                }
                content.push(ContentBlock::ToolUse {
                    id: id.clone(),
                    name: name.clone(),
                    input: input.clone(),
                });
            }
            StreamEvent::Usage(u) => usage = *u,
            StreamEvent::Done { stop_reason: sr } => stop_reason = sr.clone(),
            StreamEvent::Start | StreamEvent::Error(_) => {}
        }
    }
    if !text.is_empty() {
        content.push(ContentBlock::Text(text));
    }

    let has_tool_use = content
        .iter()
        .any(|block| matches!(block, ContentBlock::ToolUse { .. }));

    AnthropicMessageResponse {
        id: format!("msg_{}", Uuid::new_v4().simple()),
        message_type: "message".to_string(),
        role: "assistant".to_string(),
        model: model.to_string(),
        content,
        stop_reason: stop_reason.or_else(|| {
            Some(if has_tool_use {
                "tool_use".to_string()
            } else {
                "end_turn".to_string()
            })
        }),
        stop_sequence: None,
        usage: AnthropicUsage {
            input_tokens: usage.prompt_tokens,
            output_tokens: usage.completion_tokens,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    #[test]
    fn system_string_becomes_leading_system_message() {
        let request: MessagesRequest = serde_json::from_value(json!({
            "model": "claude-4-sonnet",
            "system": "Be brief",
            "messages": [{"role": "user", "content": "hi"}],
        }))
        .unwrap();

        let canonical = to_canonical(request).unwrap();
        assert_eq!(canonical.messages[0].role, "system");
        assert_eq!(canonical.messages[0].content.text(), "Be brief");
        // max_tokens absent -> model default
        assert_eq!(canonical.max_tokens, 4096);
    }

    #[test]
    fn system_blocks_are_concatenated() {
        let request: MessagesRequest = serde_json::from_value(json!({
            "model": "claude-4-sonnet",
            "system": [
                {"type": "text", "text": "Be brief."},
                {"type": "text", "text": "Answer in French."}
            ],
            "messages": [{"role": "user", "content": "hi"}],
        }))
        .unwrap();

        let canonical = to_canonical(request).unwrap();
        assert_eq!(
            canonical.messages[0].content.text(),
            "Be brief.\nAnswer in French."
        );
    }

    /// Text-only request round-trips through canonical form without loss.
    #[test]
    fn canonical_roundtrip_preserves_request() {
        let request: MessagesRequest = serde_json::from_value(json!({
            "model": "claude-4-sonnet",
            "system": "Be brief",
            "max_tokens": 1024,
            "messages": [
                {"role": "user", "content": "What is Rust?"},
                {"role": "assistant", "content": [{"type": "text", "text": "A language."}]},
                {"role": "user", "content": "More."}
            ],
        }))
        .unwrap();

        let canonical = to_canonical(request).unwrap();
        // Project canonical back into the Anthropic request shape.
        let system = canonical.system_text().unwrap();
        let messages: Vec<Value> = canonical
            .conversation()
            .iter()
            .map(|m| json!({"role": m.role, "content": m.content.text()}))
            .collect();

        assert_eq!(system, "Be brief");
        assert_eq!(canonical.max_tokens, 1024);
        assert_eq!(
            messages,
            vec![
                json!({"role": "user", "content": "What is Rust?"}),
                json!({"role": "assistant", "content": "A language."}),
                json!({"role": "user", "content": "More."}),
            ]
        );
    }

    #[test]
    fn stream_rendering_follows_the_event_sequence() {
        let mut renderer = AnthropicStreamRenderer::new("claude-4-sonnet");
        let events = vec![
            StreamEvent::Start,
            StreamEvent::Content("Hi".to_string()),
            StreamEvent::Usage(TokenUsage {
                prompt_tokens: 7,
                completion_tokens: 3,
            }),
            StreamEvent::Done {
                stop_reason: Some("end_turn".to_string()),
            },
        ];

        let frames: Vec<SseFrame> = events.iter().flat_map(|e| renderer.render(e)).collect();
        let names: Vec<&str> = frames.iter().filter_map(|f| f.event.as_deref()).collect();
        assert_eq!(
            names,
            vec![
                "message_start",
                "content_block_start",
                "content_block_delta",
                "content_block_stop",
                "message_delta",
                "message_stop",
            ]
        );

        // Exactly one message_delta, and it carries the usage.
        let delta_frame = &frames[names.iter().position(|n| *n == "message_delta").unwrap()];
        let value: Value = serde_json::from_str(&delta_frame.data).unwrap();
        assert_eq!(value["usage"]["input_tokens"], 7);
        assert_eq!(value["usage"]["output_tokens"], 3);
        assert_eq!(value["delta"]["stop_reason"], "end_turn");
    }

    #[test]
    fn tool_use_renders_as_its_own_block() {
        let mut renderer = AnthropicStreamRenderer::new("claude-4-sonnet");
        renderer.render(&StreamEvent::Start);
        renderer.render(&StreamEvent::Content("thinking".to_string()));
        let frames = renderer.render(&StreamEvent::ToolUse {
            id: "call_1".to_string(),
            name: "lookup".to_string(),
            input: json!({"q": "x"}),
        });

        let names: Vec<&str> = frames.iter().filter_map(|f| f.event.as_deref()).collect();
        assert_eq!(
            names,
            vec![
                "content_block_stop",  // closes the text block
                "content_block_start", // opens the tool_use block
                "content_block_delta",
                "content_block_stop",
            ]
        );
        let start: Value = serde_json::from_str(&frames[1].data).unwrap();
        assert_eq!(start["content_block"]["type"], "tool_use");
        assert_eq!(start["index"], 1);
    }

    #[test]
    fn synthesized_message_orders_blocks() {
        let events = vec![
            StreamEvent::Start,
            StreamEvent::Content("Let me look. ".to_string()),
            StreamEvent::ToolUse {
                id: "call_1".to_string(),
                name: "lookup".to_string(),
                input: json!({}),
            },
            StreamEvent::Usage(TokenUsage {
                prompt_tokens: 1,
                completion_tokens: 2,
            }),
            StreamEvent::Done { stop_reason: None },
        ];
        let response = synthesize_response("claude-4-sonnet", &events);
        assert_eq!(response.content.len(), 2);
        assert!(matches!(&response.content[0], ContentBlock::Text(t) if t == "Let me look. "));
        assert!(matches!(&response.content[1], ContentBlock::ToolUse { .. }));
        assert_eq!(response.stop_reason.as_deref(), Some("tool_use"));
        assert_eq!(response.usage.input_tokens, 1);
    }
}
