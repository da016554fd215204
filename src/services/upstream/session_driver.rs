//! Default driver: authenticates with a leased upstream account session.
//!
//! Speaks the Anthropic messages dialect against the configured session
//! endpoint. With no eligible session the dispatcher passes `lease = None`
//! and the driver takes the unauthenticated human-fallback path; the usage
//! record then carries the `x-is-human-fallback` sentinel instead of a
//! session email.

use crate::models::canonical::CanonicalRequest;
use crate::services::session_pool::SessionLease;
use crate::services::upstream::anthropic_client::build_request_body;
use crate::services::upstream::sse::AnthropicSseParser;
use crate::services::upstream::{EventStream, UpstreamError};

const DEFAULT_USER_AGENT: &str = concat!("prism-gateway/", env!("CARGO_PKG_VERSION"));

pub struct SessionDriver {
    base_url: String,
    http: reqwest::Client,
}

impl SessionDriver {
    pub fn new(base_url: String) -> Self {
        Self {
            base_url,
            http: reqwest::Client::new(),
        }
    }

    pub async fn open(
        &self,
        request: &CanonicalRequest,
        lease: Option<&SessionLease>,
    ) -> Result<EventStream, UpstreamError> {
        let body = build_request_body(request);
        let url = format!("{}/v1/messages", self.base_url.trim_end_matches('/'));

        let mut builder = self
            .http
            .post(&url)
            .header("content-type", "application/json")
            .header("accept", "text/event-stream");

        match lease {
            Some(lease) => {
                builder = builder
                    .bearer_auth(&lease.token)
                    .header(
                        "user-agent",
                        lease.user_agent.as_deref().unwrap_or(DEFAULT_USER_AGENT),
                    );
                if !lease.cookies.is_empty() {
                    builder = builder.header("cookie", cookie_header(&lease.cookies));
                }
            }
            None => {
                // Human fallback: no account credential at all.
                builder = builder.header("user-agent", DEFAULT_USER_AGENT);
            }
        }

        let response = builder.json(&body).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let email = lease.map(|l| l.email.as_str()).unwrap_or("fallback");
            tracing::warn!("Session upstream error for {} ({}): {}", email, status, body);
            return Err(UpstreamError::status(status.as_u16(), &body));
        }

        Ok(Box::pin(AnthropicSseParser::new(response.bytes_stream())))
    }
}

fn cookie_header(cookies: &std::collections::HashMap<String, String>) -> String {
    let mut pairs: Vec<String> = cookies
        .iter()
        .map(|(name, value)| format!("{name}={value}"))
        .collect();
    pairs.sort();
    pairs.join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn cookie_header_is_deterministic() {
        let mut cookies = HashMap::new();
        cookies.insert("sessionKey".to_string(), "abc".to_string());
        cookies.insert("cf_clearance".to_string(), "xyz".to_string());
        assert_eq!(cookie_header(&cookies), "cf_clearance=xyz; sessionKey=abc");
    }
}
