// ============================================================================
// Provider Registry - model -> driver selection and failover order
// ============================================================================
//
// A deterministic prefix-rule table chooses the primary driver for a model;
// the final rule is the default session-backed driver. Failover iterates the
// remaining available drivers of the same model family, up to MAX_RETRIES
// extra attempts with exponential backoff.
//
// ============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::config::ProviderConfig;
use crate::middleware::error_handling::{GatewayError, Result};
use crate::models::catalog::{find_model, list_models, ModelInfo};
use crate::services::upstream::{AnthropicDriver, OpenAiDriver, ProviderDriver, SessionDriver};

/// Retries after the initial attempt.
pub const MAX_RETRIES: u32 = 2;

const BACKOFF_BASE_MS: u64 = 200;
const BACKOFF_CAP_MS: u64 = 2_000;

/// Exponential backoff between failover attempts: 200ms, 400ms, ... capped
/// at 2s.
pub fn retry_backoff(attempt: u32) -> Duration {
    let ms = BACKOFF_BASE_MS.saturating_mul(1u64 << attempt.min(16));
    Duration::from_millis(ms.min(BACKOFF_CAP_MS))
}

/// First matching prefix wins; the empty-prefix final rule is the default
/// session driver.
const MODEL_PREFIX_RULES: &[(&str, &str)] = &[
    ("gpt-", "openai"),
    ("o1", "openai"),
    ("claude-", "session"),
    ("", "session"),
];

pub struct ProviderRegistry {
    drivers: HashMap<&'static str, Arc<ProviderDriver>>,
}

impl ProviderRegistry {
    pub fn from_config(config: &ProviderConfig) -> Self {
        let mut drivers: HashMap<&'static str, Arc<ProviderDriver>> = HashMap::new();

        if let Some(api_key) = &config.openai_api_key {
            drivers.insert(
                "openai",
                Arc::new(ProviderDriver::OpenAi(OpenAiDriver::new(
                    api_key.clone(),
                    config.openai_base_url.clone(),
                ))),
            );
        }
        if let Some(api_key) = &config.anthropic_api_key {
            drivers.insert(
                "anthropic",
                Arc::new(ProviderDriver::Anthropic(AnthropicDriver::new(
                    api_key.clone(),
                    config.anthropic_base_url.clone(),
                ))),
            );
        }
        if let Some(base_url) = &config.session_base_url {
            drivers.insert(
                "session",
                Arc::new(ProviderDriver::Session(SessionDriver::new(base_url.clone()))),
            );
        }

        Self { drivers }
    }

    /// True iff the named driver is configured with valid credentials.
    pub fn is_available(&self, provider: &str) -> bool {
        self.drivers.contains_key(provider)
    }

    fn rule_provider(model_id: &str) -> &'static str {
        MODEL_PREFIX_RULES
            .iter()
            .find(|(prefix, _)| model_id.starts_with(prefix))
            .map(|(_, provider)| *provider)
            .expect("final catch-all rule always matches")
    }

    /// Provider names able to serve `model`, primary first. The session
    /// driver speaks the Anthropic dialect, so it only backs that family.
    fn candidate_names(model: &ModelInfo) -> Vec<&'static str> {
        let primary = Self::rule_provider(model.id);
        let mut names = vec![primary];
        let family: &[&'static str] = match model.provider {
            "anthropic" => &["session", "anthropic"],
            "openai" => &["openai"],
            _ => &[],
        };
        for name in family {
            if !names.contains(name) {
                names.push(name);
            }
        }
        names
    }

    /// All configured drivers able to serve `model`, failover order.
    pub fn list_available_for_model(&self, model_id: &str) -> Vec<Arc<ProviderDriver>> {
        let Some(model) = find_model(model_id) else {
            return Vec::new();
        };
        Self::candidate_names(model)
            .into_iter()
            .filter_map(|name| self.drivers.get(name).cloned())
            .collect()
    }

    /// Primary driver for `model`, or `provider_not_available` when nothing
    /// configured can serve it.
    pub fn select(&self, model_id: &str) -> Result<Arc<ProviderDriver>> {
        self.list_available_for_model(model_id)
            .into_iter()
            .next()
            .ok_or_else(|| GatewayError::ProviderNotAvailable(model_id.to_string()))
    }

    /// Catalog entries some configured driver can actually serve.
    pub fn list_available_models(&self) -> Vec<&'static ModelInfo> {
        list_models()
            .iter()
            .filter(|model| {
                Self::candidate_names(model)
                    .iter()
                    .any(|name| self.is_available(name))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(openai: bool, anthropic: bool, session: bool) -> ProviderRegistry {
        ProviderRegistry::from_config(&ProviderConfig {
            openai_api_key: openai.then(|| "sk-test".to_string()),
            openai_base_url: None,
            anthropic_api_key: anthropic.then(|| "sk-ant-test".to_string()),
            anthropic_base_url: None,
            session_base_url: session.then(|| "https://upstream.example".to_string()),
        })
    }

    #[test]
    fn prefix_rules_are_first_match_with_session_default() {
        assert_eq!(ProviderRegistry::rule_provider("gpt-4o"), "openai");
        assert_eq!(ProviderRegistry::rule_provider("claude-4-sonnet"), "session");
        assert_eq!(ProviderRegistry::rule_provider("anything-else"), "session");
    }

    #[test]
    fn failover_order_is_session_then_api_key_for_claude() {
        let registry = registry(false, true, true);
        let drivers = registry.list_available_for_model("claude-4-sonnet");
        let names: Vec<&str> = drivers.iter().map(|d| d.name()).collect();
        assert_eq!(names, vec!["session", "anthropic"]);
    }

    #[test]
    fn select_errors_when_no_driver_is_configured() {
        let registry = registry(false, false, false);
        assert!(matches!(
            registry.select("gpt-4o"),
            Err(GatewayError::ProviderNotAvailable(_))
        ));
    }

    #[test]
    fn available_models_follow_configured_drivers() {
        let registry = registry(true, false, false);
        let models = registry.list_available_models();
        assert!(models.iter().any(|m| m.id == "gpt-4o"));
        assert!(!models.iter().any(|m| m.id == "claude-4-sonnet"));
    }

    #[test]
    fn backoff_doubles_and_caps_at_two_seconds() {
        assert_eq!(retry_backoff(0), Duration::from_millis(200));
        assert_eq!(retry_backoff(1), Duration::from_millis(400));
        assert_eq!(retry_backoff(2), Duration::from_millis(800));
        assert_eq!(retry_backoff(5), Duration::from_millis(2_000));
        assert_eq!(retry_backoff(30), Duration::from_millis(2_000));
    }
}
