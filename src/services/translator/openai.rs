//! OpenAI chat-completion protocol: inbound conversion and outbound
//! rendering of the canonical event stream.

use serde_json::json;
use uuid::Uuid;

use crate::middleware::error_handling::{GatewayError, Result};
use crate::models::canonical::{
    CanonicalRequest, ChatMessage, MessageContent, SamplingParams, StreamEvent, TokenUsage,
    ToolDefinition,
};
use crate::models::openai::{
    ChatChoice, ChatChoiceMessage, ChatCompletionRequest, ChatCompletionResponse, OpenAiContent,
    OpenAiToolCall, OpenAiToolCallFunction, OpenAiUsage,
};
use crate::services::translator::{finish_canonical, resolve_model, SseFrame};

pub fn to_canonical(request: ChatCompletionRequest) -> Result<CanonicalRequest> {
    let model = resolve_model(&request.model)?;

    let mut stream = request.stream.unwrap_or(false);

    let mut messages: Vec<ChatMessage> = Vec::with_capacity(request.messages.len() + 1);
    if request.messages.is_empty() {
        // `instructions` without messages becomes a single user message and
        // the response is never streamed.
        match request.instructions.as_deref() {
            Some(instructions) if !instructions.trim().is_empty() => {
                messages.push(ChatMessage::user(instructions));
                stream = false;
            }
            _ => {
                return Err(GatewayError::InvalidRequest(
                    "messages is required".to_string(),
                ));
            }
        }
    } else {
        for message in &request.messages {
            let content = match &message.content {
                Some(OpenAiContent::Text(text)) => text.clone(),
                Some(OpenAiContent::Parts(parts)) => parts
                    .iter()
                    .filter_map(|part| part.text.as_deref())
                    .collect::<Vec<_>>()
                    .join(""),
                None => String::new(),
            };
            messages.push(ChatMessage::new(message.role.clone(), content));
        }
    }

    let tools: Vec<ToolDefinition> = request
        .tools
        .unwrap_or_default()
        .into_iter()
        .map(|tool| ToolDefinition {
            name: tool.function.name,
            description: tool.function.description.unwrap_or_default(),
            input_schema: tool.function.parameters.unwrap_or(serde_json::Value::Null),
        })
        .collect();

    finish_canonical(
        model,
        messages,
        request.max_tokens,
        stream,
        tools,
        SamplingParams {
            temperature: request.temperature,
            top_p: request.top_p,
            stop_sequences: request.stop,
        },
    )
}

// ============================================================================
// Outbound streaming
// ============================================================================

/// Renders canonical events as chat-completion chunks, ending with
/// `data: [DONE]`. Usage is carried on a dedicated final chunk so it is
/// emitted exactly once.
pub struct OpenAiStreamRenderer {
    id: String,
    created: i64,
    model: String,
    usage: Option<TokenUsage>,
    tool_call_index: u32,
    finished: bool,
}

impl OpenAiStreamRenderer {
    pub fn new(model: &str, created: i64) -> Self {
        Self {
            id: format!("chatcmpl-{}", Uuid::new_v4().simple()),
            created,
            model: model.to_string(),
            usage: None,
            tool_call_index: 0,
            finished: false,
        }
    }

    pub fn render(&mut self, event: &StreamEvent) -> Vec<SseFrame> {
        if self.finished {
            return Vec::new();
        }
        match event {
            StreamEvent::Start => {
                vec![self.chunk(json!({"role": "assistant"}), None, None)]
            }
            StreamEvent::Content(delta) => {
                vec![self.chunk(json!({"content": delta}), None, None)]
            }
            StreamEvent::ToolUse { id, name, input } => {
                let index = self.tool_call_index;
                self.tool_call_index += 1;
                vec![self.chunk(
                    json!({
                        "tool_calls": [{
                            "index": index,
                            "id": id,
                            "type": "function",
                            "function": {
                                "name": name,
                                "arguments": input.to_string(),
                            },
                        }]
                    }),
                    None,
                    None,
                )]
            }
            StreamEvent::Usage(usage) => {
                self.usage = Some(*usage);
                Vec::new()
            }
            StreamEvent::Error(message) => {
                self.finished = true;
                vec![
                    SseFrame::data_only(
                        json!({
                            "error": {
                                "message": message,
                                "type": "api_error",
                                "code": "upstream_error",
                            }
                        })
                        .to_string(),
                    ),
                    SseFrame::data_only("[DONE]"),
                ]
            }
            StreamEvent::Done { stop_reason } => {
                self.finished = true;
                let finish = stop_reason.clone().unwrap_or_else(|| "stop".to_string());
                let mut frames = vec![self.chunk(json!({}), Some(finish), None)];
                if let Some(usage) = self.usage.take() {
                    frames.push(self.usage_chunk(usage));
                }
                frames.push(SseFrame::data_only("[DONE]"));
                frames
            }
        }
    }

    fn chunk(
        &self,
        delta: serde_json::Value,
        finish_reason: Option<String>,
        usage: Option<TokenUsage>,
    ) -> SseFrame {
        let mut chunk = json!({
            "id": self.id,
            "object": "chat.completion.chunk",
            "created": self.created,
            "model": self.model,
            "choices": [{
                "index": 0,
                "delta": delta,
                "finish_reason": finish_reason,
            }],
        });
        if let Some(usage) = usage {
            chunk["usage"] = json!(OpenAiUsage::from(usage));
        }
        SseFrame::data_only(chunk.to_string())
    }

    fn usage_chunk(&self, usage: TokenUsage) -> SseFrame {
        let chunk = json!({
            "id": self.id,
            "object": "chat.completion.chunk",
            "created": self.created,
            "model": self.model,
            "choices": [],
            "usage": OpenAiUsage::from(usage),
        });
        SseFrame::data_only(chunk.to_string())
    }
}

// ============================================================================
// Non-streaming synthesis
// ============================================================================

/// Drains a finished event sequence into one chat-completion body.
pub fn synthesize_response(
    model: &str,
    created: i64,
    events: &[StreamEvent],
) -> ChatCompletionResponse {
    let mut content = String::new();
    let mut tool_calls = Vec::new();
    let mut usage = TokenUsage::default();
    let mut finish_reason = None;

    for event in events {
        match event {
            StreamEvent::Content(delta) => content.push_str(delta),
            StreamEvent::ToolUse { id, name, input } => tool_calls.push(OpenAiToolCall {
                id: id.clone(),
                call_type: "function".to_string(),
                function: OpenAiToolCallFunction {
                    name: name.clone(),
                    arguments: input.to_string(),
                },
            }),
            StreamEvent::Usage(u) => usage = *u,
            StreamEvent::Done { stop_reason } => finish_reason = stop_reason.clone(),
            StreamEvent::Start | StreamEvent::Error(_) => {}
        }
    }

    if finish_reason.is_none() {
        finish_reason = Some(if tool_calls.is_empty() {
            "stop".to_string()
        } else {
            "tool_calls".to_string()
        });
    }

    ChatCompletionResponse {
        id: format!("chatcmpl-{}", Uuid::new_v4().simple()),
        object: "chat.completion".to_string(),
        created,
        model: model.to_string(),
        choices: vec![ChatChoice {
            index: 0,
            message: ChatChoiceMessage {
                role: "assistant".to_string(),
                content: Some(content),
                tool_calls: if tool_calls.is_empty() {
                    None
                } else {
                    Some(tool_calls)
                },
            },
            finish_reason,
        }],
        usage: usage.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::openai::ChatCompletionChunk;

    fn parse_chunk(frame: &SseFrame) -> ChatCompletionChunk {
        serde_json::from_str(&frame.data).expect("chunk json")
    }

    #[test]
    fn instructions_become_single_user_message_and_disable_streaming() {
        let request: ChatCompletionRequest = serde_json::from_value(json!({
            "model": "gpt-4o",
            "messages": [],
            "stream": true,
            "instructions": "Say hello",
        }))
        .unwrap();

        let canonical = to_canonical(request).unwrap();
        assert!(!canonical.stream);
        assert_eq!(canonical.messages.len(), 1);
        assert_eq!(canonical.messages[0].role, "user");
        assert_eq!(canonical.messages[0].content.text(), "Say hello");
    }

    #[test]
    fn unknown_model_is_rejected() {
        let request: ChatCompletionRequest = serde_json::from_value(json!({
            "model": "made-up-model",
            "messages": [{"role": "user", "content": "hi"}],
        }))
        .unwrap();
        assert!(matches!(
            to_canonical(request),
            Err(GatewayError::InvalidModel(_))
        ));
    }

    #[test]
    fn rendered_stream_reconstructs_text_and_usage() {
        let mut renderer = OpenAiStreamRenderer::new("gpt-4o", 1_700_000_000);
        let events = vec![
            StreamEvent::Start,
            StreamEvent::Content("Hel".to_string()),
            StreamEvent::Content("lo".to_string()),
            StreamEvent::Usage(TokenUsage {
                prompt_tokens: 100,
                completion_tokens: 400,
            }),
            StreamEvent::Done { stop_reason: None },
        ];

        let frames: Vec<SseFrame> = events.iter().flat_map(|e| renderer.render(e)).collect();
        assert_eq!(frames.last().unwrap().data, "[DONE]");

        // Parse everything back the way a client would.
        let mut text = String::new();
        let mut usage: Option<OpenAiUsage> = None;
        for frame in &frames[..frames.len() - 1] {
            let chunk = parse_chunk(frame);
            for choice in chunk.choices {
                if let Some(content) = choice.delta.content {
                    text.push_str(&content);
                }
            }
            if let Some(u) = chunk.usage {
                assert!(usage.is_none(), "usage must be emitted exactly once");
                usage = Some(u);
            }
        }

        assert_eq!(text, "Hello");
        let usage = usage.expect("usage chunk present");
        assert_eq!(usage.prompt_tokens, 100);
        assert_eq!(usage.completion_tokens, 400);
        assert_eq!(usage.total_tokens, 500);
    }

    #[test]
    fn error_event_closes_the_stream_well_formed() {
        let mut renderer = OpenAiStreamRenderer::new("gpt-4o", 1);
        let frames = renderer.render(&StreamEvent::Error("upstream blew up".to_string()));
        assert_eq!(frames.len(), 2);
        assert!(frames[0].data.contains("upstream blew up"));
        assert_eq!(frames[1].data, "[DONE]");
        // Nothing renders after a terminal error.
        assert!(renderer
            .render(&StreamEvent::Content("late".to_string()))
            .is_empty());
    }

    #[test]
    fn synthesized_body_collects_tool_calls() {
        let events = vec![
            StreamEvent::Start,
            StreamEvent::ToolUse {
                id: "call_1".to_string(),
                name: "lookup".to_string(),
                input: json!({"q": "rust"}),
            },
            StreamEvent::Usage(TokenUsage {
                prompt_tokens: 10,
                completion_tokens: 5,
            }),
            StreamEvent::Done {
                stop_reason: Some("tool_calls".to_string()),
            },
        ];
        let response = synthesize_response("gpt-4o", 1, &events);
        let calls = response.choices[0].message.tool_calls.as_ref().unwrap();
        assert_eq!(calls[0].function.name, "lookup");
        assert_eq!(response.usage.total_tokens, 15);
        assert_eq!(
            response.choices[0].finish_reason.as_deref(),
            Some("tool_calls")
        );
    }
}
