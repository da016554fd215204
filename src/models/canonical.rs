/// Canonical request/event forms shared by every protocol and driver.
///
/// Inbound handlers normalize OpenAI or Anthropic payloads into
/// `CanonicalRequest`; drivers emit `StreamEvent`s; outbound renderers turn
/// those events back into whichever wire shape the caller spoke.

use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{json, Value};

/// One typed piece of message content.
///
/// Unknown block types are preserved verbatim so a round-trip through the
/// gateway never loses caller data.
#[derive(Debug, Clone, PartialEq)]
pub enum ContentBlock {
    Text(String),
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: Value,
    },
    Unknown(Value),
}

impl ContentBlock {
    pub fn to_value(&self) -> Value {
        match self {
            ContentBlock::Text(text) => json!({ "type": "text", "text": text }),
            ContentBlock::ToolUse { id, name, input } => json!({
                "type": "tool_use",
                "id": id,
                "name": name,
                "input": input,
            }),
            ContentBlock::ToolResult {
                tool_use_id,
                content,
            } => json!({
                "type": "tool_result",
                "tool_use_id": tool_use_id,
                "content": content,
            }),
            ContentBlock::Unknown(value) => value.clone(),
        }
    }

    pub fn from_value(value: Value) -> Self {
        let block_type = value.get("type").and_then(Value::as_str).unwrap_or("");
        match block_type {
            "text" => match value.get("text").and_then(Value::as_str) {
                Some(text) => ContentBlock::Text(text.to_string()),
                None => ContentBlock::Unknown(value),
            },
            "tool_use" => {
                let id = value.get("id").and_then(Value::as_str);
                let name = value.get("name").and_then(Value::as_str);
                match (id, name) {
                    (Some(id), Some(name)) => ContentBlock::ToolUse {
                        id: id.to_string(),
                        name: name.to_string(),
                        input: value.get("input").cloned().unwrap_or(Value::Null),
                    },
                    _ => ContentBlock::Unknown(value),
                }
            }
            "tool_result" => match value.get("tool_use_id").and_then(Value::as_str) {
                Some(tool_use_id) => ContentBlock::ToolResult {
                    tool_use_id: tool_use_id.to_string(),
                    content: value.get("content").cloned().unwrap_or(Value::Null),
                },
                None => ContentBlock::Unknown(value),
            },
            _ => ContentBlock::Unknown(value),
        }
    }
}

impl Serialize for ContentBlock {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ContentBlock {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        if !value.is_object() {
            return Err(D::Error::custom("content block must be a JSON object"));
        }
        Ok(ContentBlock::from_value(value))
    }
}

/// Message content: either a bare string or a list of typed blocks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl MessageContent {
    /// Concatenated text of the content, ignoring non-text blocks.
    pub fn text(&self) -> String {
        match self {
            MessageContent::Text(text) => text.clone(),
            MessageContent::Blocks(blocks) => blocks
                .iter()
                .filter_map(|block| match block {
                    ContentBlock::Text(text) => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join(""),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: MessageContent,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: MessageContent::Text(content.into()),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new("system", content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new("user", content)
    }
}

/// A tool the caller exposes to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub input_schema: Value,
}

/// Sampling parameters passed through to the upstream unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SamplingParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_sequences: Option<Vec<String>>,
}

/// The gateway-internal request, independent of the inbound wire shape.
#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalRequest {
    /// Canonical (normalized) model id.
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub max_tokens: u32,
    pub stream: bool,
    pub tools: Vec<ToolDefinition>,
    pub sampling: SamplingParams,
}

impl CanonicalRequest {
    /// The leading system message text, if any.
    pub fn system_text(&self) -> Option<String> {
        self.messages
            .first()
            .filter(|m| m.role == "system")
            .map(|m| m.content.text())
    }

    /// Messages excluding the leading system message.
    pub fn conversation(&self) -> &[ChatMessage] {
        match self.messages.first() {
            Some(m) if m.role == "system" => &self.messages[1..],
            _ => &self.messages[..],
        }
    }
}

/// Token usage reported by an upstream at end of stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
}

impl TokenUsage {
    pub fn total(&self) -> i64 {
        self.prompt_tokens + self.completion_tokens
    }

    pub fn is_zero(&self) -> bool {
        self.prompt_tokens == 0 && self.completion_tokens == 0
    }
}

/// Events flowing from a driver through the streaming pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// Stream opened; emitted exactly once, first.
    Start,
    /// A piece of assistant text.
    Content(String),
    /// A completed tool invocation decoded from the model output.
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    /// Final token usage; emitted at most once.
    Usage(TokenUsage),
    /// Terminal error; the stream ends after this.
    Error(String),
    /// Stream finished normally.
    Done { stop_reason: Option<String> },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_block_roundtrip_preserves_unknown_types() {
        let raw = json!({ "type": "document", "source": { "data": "abc" } });
        let block = ContentBlock::from_value(raw.clone());
        assert_eq!(block, ContentBlock::Unknown(raw.clone()));
        assert_eq!(block.to_value(), raw);
    }

    #[test]
    fn content_block_parses_text_and_tool_use() {
        let text = ContentBlock::from_value(json!({ "type": "text", "text": "hi" }));
        assert_eq!(text, ContentBlock::Text("hi".to_string()));

        let tool = ContentBlock::from_value(json!({
            "type": "tool_use", "id": "toolu_1", "name": "search", "input": { "q": "rust" }
        }));
        assert_eq!(
            tool,
            ContentBlock::ToolUse {
                id: "toolu_1".to_string(),
                name: "search".to_string(),
                input: json!({ "q": "rust" }),
            }
        );
    }

    #[test]
    fn message_content_concatenates_text_blocks() {
        let content = MessageContent::Blocks(vec![
            ContentBlock::Text("Hello ".to_string()),
            ContentBlock::Unknown(json!({ "type": "image" })),
            ContentBlock::Text("world".to_string()),
        ]);
        assert_eq!(content.text(), "Hello world");
    }

    #[test]
    fn malformed_typed_block_degrades_to_unknown() {
        // A "text" block without a text field must not be dropped.
        let raw = json!({ "type": "text", "body": "oops" });
        assert_eq!(
            ContentBlock::from_value(raw.clone()),
            ContentBlock::Unknown(raw)
        );
    }
}
