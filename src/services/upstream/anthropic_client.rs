//! Anthropic messages API-key driver.

use serde_json::{json, Map, Value};

use crate::models::canonical::{CanonicalRequest, MessageContent};
use crate::services::upstream::sse::AnthropicSseParser;
use crate::services::upstream::{EventStream, UpstreamError};

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct AnthropicDriver {
    api_key: String,
    base_url: String,
    http: reqwest::Client,
}

impl AnthropicDriver {
    pub fn new(api_key: String, base_url: Option<String>) -> Self {
        Self {
            api_key,
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            http: reqwest::Client::new(),
        }
    }

    pub async fn open(&self, request: &CanonicalRequest) -> Result<EventStream, UpstreamError> {
        let body = build_request_body(request);
        let url = format!("{}/v1/messages", self.base_url.trim_end_matches('/'));

        let response = self
            .http
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .header("accept", "text/event-stream")
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!("Anthropic upstream error ({}): {}", status, body);
            return Err(UpstreamError::status(status.as_u16(), &body));
        }

        Ok(Box::pin(AnthropicSseParser::new(response.bytes_stream())))
    }
}

pub(crate) fn build_request_body(request: &CanonicalRequest) -> Value {
    let mut body = Map::new();
    body.insert("model".to_string(), json!(request.model));
    body.insert("max_tokens".to_string(), json!(request.max_tokens));
    body.insert("stream".to_string(), json!(true));

    if let Some(system) = request.system_text() {
        body.insert("system".to_string(), json!(system));
    }

    let messages: Vec<Value> = request
        .conversation()
        .iter()
        .map(|message| {
            let content = match &message.content {
                MessageContent::Text(text) => json!(text),
                MessageContent::Blocks(blocks) => {
                    json!(blocks.iter().map(|b| b.to_value()).collect::<Vec<_>>())
                }
            };
            json!({ "role": message.role, "content": content })
        })
        .collect();
    body.insert("messages".to_string(), json!(messages));

    if !request.tools.is_empty() {
        let tools: Vec<Value> = request
            .tools
            .iter()
            .map(|tool| {
                json!({
                    "name": tool.name,
                    "description": tool.description,
                    "input_schema": tool.input_schema,
                })
            })
            .collect();
        body.insert("tools".to_string(), json!(tools));
    }

    if let Some(temperature) = request.sampling.temperature {
        body.insert("temperature".to_string(), json!(temperature));
    }
    if let Some(top_p) = request.sampling.top_p {
        body.insert("top_p".to_string(), json!(top_p));
    }
    if let Some(stop) = &request.sampling.stop_sequences {
        body.insert("stop_sequences".to_string(), json!(stop));
    }

    Value::Object(body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::canonical::{ChatMessage, SamplingParams};

    #[test]
    fn system_message_moves_to_the_system_field() {
        let request = CanonicalRequest {
            model: "claude-4-sonnet".to_string(),
            messages: vec![ChatMessage::system("Be brief"), ChatMessage::user("hi")],
            max_tokens: 4096,
            stream: true,
            tools: Vec::new(),
            sampling: SamplingParams::default(),
        };

        let body = build_request_body(&request);
        assert_eq!(body["system"], json!("Be brief"));
        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0]["role"], json!("user"));
    }
}
