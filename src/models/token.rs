use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// An API token issued by this gateway (the client credential).
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ApiToken {
    pub id: i64,
    pub value: String,
    pub masked_value: String,
    pub name: Option<String>,
    /// NULL = system/admin token.
    pub owner_user_id: Option<i64>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub usage_count: i64,
    /// NULL = unlimited.
    pub quota_limit_usd: Option<Decimal>,
    pub quota_used_usd: Decimal,
    /// NULL = never expires.
    pub expires_at: Option<DateTime<Utc>>,
    /// Comma-separated model ids; empty/NULL = all models allowed.
    pub allowed_models: Option<String>,
}

impl ApiToken {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(expires) if expires <= now)
    }

    /// Quota check uses `>=`: a token at exactly its limit is exhausted, but a
    /// call admitted below the limit always completes (the overshoot is caught
    /// post-flight by the auto-disable pass).
    pub fn quota_exhausted(&self) -> bool {
        match self.quota_limit_usd {
            Some(limit) => self.quota_used_usd >= limit,
            None => false,
        }
    }

    pub fn allowed_model_list(&self) -> Vec<String> {
        parse_allowed_models(self.allowed_models.as_deref())
    }

    /// Empty allow-list means every model is permitted.
    pub fn allows_model(&self, model: &str) -> bool {
        let allowed = self.allowed_model_list();
        allowed.is_empty() || allowed.iter().any(|m| m == model)
    }
}

pub fn parse_allowed_models(raw: Option<&str>) -> Vec<String> {
    raw.unwrap_or("")
        .split(',')
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .map(str::to_string)
        .collect()
}

/// Deterministic display masking: first four and last four characters kept.
pub fn mask_token(value: &str) -> String {
    let chars: Vec<char> = value.chars().collect();
    if chars.len() <= 8 {
        return "*".repeat(chars.len());
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{head}****{tail}")
}

/// Denormalized snapshot returned by token validation: token row joined with
/// the owner's account state.
#[derive(Debug, Clone)]
pub struct TokenSnapshot {
    pub token: ApiToken,
    pub username: String,
    /// True for system tokens (no owner) and for owners whose account and
    /// balance are both active.
    pub user_active: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn token(limit: Option<Decimal>, used: Decimal, allowed: Option<&str>) -> ApiToken {
        ApiToken {
            id: 1,
            value: "sk-prism-1234567890abcdef".to_string(),
            masked_value: mask_token("sk-prism-1234567890abcdef"),
            name: None,
            owner_user_id: Some(7),
            is_active: true,
            created_at: Utc::now(),
            last_used_at: None,
            usage_count: 0,
            quota_limit_usd: limit,
            quota_used_usd: used,
            expires_at: None,
            allowed_models: allowed.map(str::to_string),
        }
    }

    #[test]
    fn masking_preserves_first_and_last_four() {
        assert_eq!(mask_token("sk-prism-1234567890abcdef"), "sk-p****cdef");
        assert_eq!(mask_token("short"), "*****");
    }

    #[test]
    fn quota_uses_greater_or_equal() {
        assert!(!token(Some(dec!(0.001)), dec!(0.0009), None).quota_exhausted());
        assert!(token(Some(dec!(0.001)), dec!(0.001), None).quota_exhausted());
        assert!(token(Some(dec!(0.001)), dec!(0.0011), None).quota_exhausted());
        assert!(!token(None, dec!(1000), None).quota_exhausted());
    }

    #[test]
    fn empty_allow_list_permits_everything() {
        assert!(token(None, dec!(0), None).allows_model("gpt-4o"));
        assert!(token(None, dec!(0), Some("")).allows_model("claude-4-sonnet"));
        let restricted = token(None, dec!(0), Some("gpt-4o"));
        assert!(restricted.allows_model("gpt-4o"));
        assert!(!restricted.allows_model("claude-4-sonnet"));
    }

    #[test]
    fn allow_list_tolerates_whitespace() {
        let t = token(None, dec!(0), Some(" gpt-4o , claude-4-sonnet "));
        assert_eq!(t.allowed_model_list(), vec!["gpt-4o", "claude-4-sonnet"]);
    }
}
