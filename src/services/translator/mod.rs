// ============================================================================
// Protocol Translator
// ============================================================================
//
// Bidirectional conversion between the two public wire shapes (OpenAI chat
// completions, Anthropic messages) and the gateway's canonical form:
//
//   inbound:  wire request  -> CanonicalRequest (normalized model, clamped
//             max_tokens, system folded into the leading message, tool
//             prompt injected when the upstream path needs it)
//   outbound: StreamEvent   -> wire SSE frames / synthesized JSON body
//
// ============================================================================

pub mod anthropic;
pub mod openai;
pub mod tool_calls;

use crate::middleware::error_handling::{GatewayError, Result};
use crate::models::anthropic::{AnthropicTool, SystemPrompt};
use crate::models::canonical::{CanonicalRequest, ChatMessage, MessageContent, ToolDefinition};
use crate::models::catalog::{clamp_max_tokens, find_model};

/// Which wire protocol the caller spoke; decides the outbound rendering and
/// the error envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    OpenAi,
    Anthropic,
}

/// One SSE frame, protocol-agnostic. Rendered as
/// `event: <name>\ndata: <data>\n\n` (the event line only when present).
#[derive(Debug, Clone, PartialEq)]
pub struct SseFrame {
    pub event: Option<String>,
    pub data: String,
}

impl SseFrame {
    pub fn data_only(data: impl Into<String>) -> Self {
        Self {
            event: None,
            data: data.into(),
        }
    }

    pub fn named(event: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            event: Some(event.into()),
            data: data.into(),
        }
    }

    pub fn to_axum_event(&self) -> axum::response::sse::Event {
        let mut event = axum::response::sse::Event::default().data(self.data.clone());
        if let Some(name) = &self.event {
            event = event.event(name.clone());
        }
        event
    }
}

impl std::fmt::Display for SseFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(event) = &self.event {
            writeln!(f, "event: {event}")?;
        }
        writeln!(f, "data: {}", self.data)?;
        writeln!(f)
    }
}

/// Resolves and normalizes a caller-supplied model id.
pub fn resolve_model(model: &str) -> Result<&'static crate::models::catalog::ModelInfo> {
    find_model(model).ok_or_else(|| GatewayError::InvalidModel(model.to_string()))
}

/// Shared tail of both inbound conversions: clamp max_tokens and, when the
/// request declares tools, fold the tool-use prompt into the system message
/// so upstreams without native tool calling can still answer with
/// `<tool_call>` fragments.
pub(crate) fn finish_canonical(
    model: &'static crate::models::catalog::ModelInfo,
    mut messages: Vec<ChatMessage>,
    requested_max_tokens: Option<u32>,
    stream: bool,
    tools: Vec<ToolDefinition>,
    sampling: crate::models::canonical::SamplingParams,
) -> Result<CanonicalRequest> {
    if messages.iter().all(|m| m.role == "system") {
        return Err(GatewayError::InvalidRequest(
            "messages must contain at least one non-system message".to_string(),
        ));
    }

    if !tools.is_empty() {
        let prompt = render_tool_prompt(&tools);
        match messages.first_mut() {
            Some(first) if first.role == "system" => {
                let existing = first.content.text();
                first.content = MessageContent::Text(if existing.is_empty() {
                    prompt
                } else {
                    format!("{existing}\n\n{prompt}")
                });
            }
            _ => messages.insert(0, ChatMessage::system(prompt)),
        }
    }

    Ok(CanonicalRequest {
        model: model.id.to_string(),
        max_tokens: clamp_max_tokens(model, requested_max_tokens),
        messages,
        stream,
        tools,
        sampling,
    })
}

/// The deterministic tool-use prompt template. Stable wording: the fragment
/// grammar here is what `tool_calls::parse_tool_calls` accepts.
pub fn render_tool_prompt(tools: &[ToolDefinition]) -> String {
    let mut prompt = String::from(
        "You have access to the following tools. To invoke a tool, respond with \
a fragment in exactly this form:\n\
<tool_call>\n\
<function=tool_name>\n\
<parameter=arg_name>arg value</parameter>\n\
</function>\n\
</tool_call>\n\n\
Available tools:\n",
    );
    for tool in tools {
        prompt.push_str(&format!("- {}: {}\n", tool.name, tool.description));
        if !tool.input_schema.is_null() {
            prompt.push_str(&format!("  input schema: {}\n", tool.input_schema));
        }
    }
    prompt
}

/// Documented token estimator for `/v1/messages/count_tokens`: character
/// counts of system text, message text blocks, and tool name+description,
/// divided by four, rounded up, minimum 1.
pub fn estimate_input_tokens(
    system: Option<&SystemPrompt>,
    messages: &[crate::models::anthropic::AnthropicMessage],
    tools: Option<&[AnthropicTool]>,
) -> u64 {
    let mut chars = 0usize;

    if let Some(system) = system {
        chars += system.text().chars().count();
    }

    for message in messages {
        let text = match &message.content {
            crate::models::anthropic::AnthropicContent::Text(text) => text.clone(),
            crate::models::anthropic::AnthropicContent::Blocks(blocks) => {
                MessageContent::Blocks(blocks.clone()).text()
            }
        };
        chars += text.chars().count();
    }

    if let Some(tools) = tools {
        for tool in tools {
            chars += tool.name.chars().count();
            chars += tool
                .description
                .as_deref()
                .map(|d| d.chars().count())
                .unwrap_or(0);
        }
    }

    (chars as u64).div_ceil(4).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::anthropic::{AnthropicContent, AnthropicMessage};
    use serde_json::json;

    #[test]
    fn frames_render_as_sse_lines() {
        let frame = SseFrame::named("message_stop", r#"{"type":"message_stop"}"#);
        assert_eq!(
            frame.to_string(),
            "event: message_stop\ndata: {\"type\":\"message_stop\"}\n\n"
        );
        assert_eq!(SseFrame::data_only("[DONE]").to_string(), "data: [DONE]\n\n");
    }

    #[test]
    fn tool_prompt_lists_every_tool() {
        let tools = vec![
            ToolDefinition {
                name: "get_weather".to_string(),
                description: "Current weather for a city".to_string(),
                input_schema: json!({"type": "object"}),
            },
            ToolDefinition {
                name: "search".to_string(),
                description: String::new(),
                input_schema: serde_json::Value::Null,
            },
        ];
        let prompt = render_tool_prompt(&tools);
        assert!(prompt.contains("<tool_call>"));
        assert!(prompt.contains("- get_weather: Current weather for a city"));
        assert!(prompt.contains("- search: "));
        // Deterministic: same input, same output.
        assert_eq!(prompt, render_tool_prompt(&tools));
    }

    #[test]
    fn estimator_is_ceil_chars_over_four_min_one() {
        assert_eq!(estimate_input_tokens(None, &[], None), 1);

        let messages = vec![AnthropicMessage {
            role: "user".to_string(),
            content: AnthropicContent::Text("abcdefgh".to_string()), // 8 chars
        }];
        assert_eq!(estimate_input_tokens(None, &messages, None), 2);

        let system = SystemPrompt::Text("abc".to_string()); // 8 + 3 = 11 -> ceil 2.75 = 3
        assert_eq!(estimate_input_tokens(Some(&system), &messages, None), 3);

        let tools = vec![AnthropicTool {
            name: "ab".to_string(),
            description: Some("cd".to_string()),
            input_schema: None,
        }]; // + 4 chars -> 15 -> 4
        assert_eq!(
            estimate_input_tokens(Some(&system), &messages, Some(&tools)),
            4
        );
    }

    #[test]
    fn tool_injection_creates_or_extends_system_message() {
        let model = crate::models::catalog::find_model("gpt-4o").unwrap();
        let tools = vec![ToolDefinition {
            name: "lookup".to_string(),
            description: "d".to_string(),
            input_schema: serde_json::Value::Null,
        }];

        let canonical = finish_canonical(
            model,
            vec![ChatMessage::user("hi")],
            None,
            false,
            tools.clone(),
            Default::default(),
        )
        .unwrap();
        assert_eq!(canonical.messages[0].role, "system");
        assert!(canonical.messages[0].content.text().contains("<tool_call>"));

        let canonical = finish_canonical(
            model,
            vec![ChatMessage::system("Be brief"), ChatMessage::user("hi")],
            None,
            false,
            tools,
            Default::default(),
        )
        .unwrap();
        let system = canonical.messages[0].content.text();
        assert!(system.starts_with("Be brief"));
        assert!(system.contains("<tool_call>"));
    }

    #[test]
    fn requests_without_conversation_are_rejected() {
        let model = crate::models::catalog::find_model("gpt-4o").unwrap();
        let err = finish_canonical(
            model,
            vec![ChatMessage::system("only system")],
            None,
            false,
            Vec::new(),
            Default::default(),
        )
        .unwrap_err();
        assert!(matches!(err, GatewayError::InvalidRequest(_)));
    }
}
