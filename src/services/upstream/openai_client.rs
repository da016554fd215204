//! OpenAI-compatible API-key driver.

use serde_json::{json, Map, Value};

use crate::models::canonical::CanonicalRequest;
use crate::services::upstream::sse::OpenAiSseParser;
use crate::services::upstream::{EventStream, UpstreamError};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

pub struct OpenAiDriver {
    api_key: String,
    base_url: String,
    http: reqwest::Client,
}

impl OpenAiDriver {
    pub fn new(api_key: String, base_url: Option<String>) -> Self {
        Self {
            api_key,
            base_url: base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            http: reqwest::Client::new(),
        }
    }

    pub async fn open(&self, request: &CanonicalRequest) -> Result<EventStream, UpstreamError> {
        let body = build_request_body(request);
        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));

        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .header("accept", "text/event-stream")
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!("OpenAI upstream error ({}): {}", status, body);
            return Err(UpstreamError::status(status.as_u16(), &body));
        }

        Ok(Box::pin(OpenAiSseParser::new(response.bytes_stream())))
    }
}

/// Upstream streams are always requested with usage reporting so billing has
/// exact numbers; downstream non-streaming callers are synthesized later.
fn build_request_body(request: &CanonicalRequest) -> Value {
    let messages: Vec<Value> = request
        .messages
        .iter()
        .map(|message| {
            json!({
                "role": message.role,
                "content": message.content.text(),
            })
        })
        .collect();

    let mut body = Map::new();
    body.insert("model".to_string(), json!(request.model));
    body.insert("messages".to_string(), json!(messages));
    body.insert("max_tokens".to_string(), json!(request.max_tokens));
    body.insert("stream".to_string(), json!(true));
    body.insert(
        "stream_options".to_string(),
        json!({ "include_usage": true }),
    );
    if let Some(temperature) = request.sampling.temperature {
        body.insert("temperature".to_string(), json!(temperature));
    }
    if let Some(top_p) = request.sampling.top_p {
        body.insert("top_p".to_string(), json!(top_p));
    }
    if let Some(stop) = &request.sampling.stop_sequences {
        body.insert("stop".to_string(), json!(stop));
    }

    Value::Object(body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::canonical::{ChatMessage, SamplingParams};

    #[test]
    fn request_body_always_asks_for_streamed_usage() {
        let request = CanonicalRequest {
            model: "gpt-4o".to_string(),
            messages: vec![ChatMessage::user("hi")],
            max_tokens: 4096,
            stream: false,
            tools: Vec::new(),
            sampling: SamplingParams {
                temperature: Some(0.2),
                ..SamplingParams::default()
            },
        };

        let body = build_request_body(&request);
        assert_eq!(body["stream"], json!(true));
        assert_eq!(body["stream_options"]["include_usage"], json!(true));
        assert_eq!(body["temperature"], json!(0.2f32));
        assert!(body.get("top_p").is_none());
        assert_eq!(body["messages"][0]["content"], json!("hi"));
    }
}
