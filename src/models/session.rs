use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Consecutive failures after which a session is invalidated.
pub const FAIL_THRESHOLD: i32 = 5;

pub const DEFAULT_DAILY_TOKEN_LIMIT: i64 = 100_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum SessionQuotaStatus {
    Available,
    Exhausted,
}

/// One account credential at an upstream AI service.
///
/// `token` and `extra_cookies` are stored encrypted; the pool decrypts
/// lazily when a session is leased.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct UpstreamSession {
    pub id: i64,
    pub email: String,
    #[serde(skip_serializing)]
    pub token: String,
    pub user_agent: Option<String>,
    /// Encrypted JSON map of cookie name to value.
    #[serde(skip_serializing)]
    pub extra_cookies: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub is_valid: bool,
    pub usage_count: i64,
    pub fail_count: i32,
    pub daily_token_limit: i64,
    pub daily_token_used: i64,
    pub last_used_at: Option<DateTime<Utc>>,
    pub last_check: Option<DateTime<Utc>>,
    pub last_reset_at: DateTime<Utc>,
    pub quota_status: SessionQuotaStatus,
    pub account_type: String,
}

impl UpstreamSession {
    /// Lease eligibility per the pool contract. Model compatibility is
    /// checked separately because it depends on the catalog entry.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.is_valid
            && self.quota_status == SessionQuotaStatus::Available
            && self.fail_count < FAIL_THRESHOLD
            && !matches!(self.expires_at, Some(expires) if expires <= now)
    }

    pub fn is_pro(&self) -> bool {
        self.account_type.eq_ignore_ascii_case("pro")
    }

    pub fn daily_quota_exhausted(&self) -> bool {
        self.daily_token_used >= self.daily_token_limit
    }
}

/// Session identifiers arrive from admin imports and cookie dumps with stray
/// control characters; strip them at every boundary.
pub fn normalize_email(raw: &str) -> String {
    raw.chars()
        .filter(|c| !matches!(c, '\r' | '\n' | '\t' | ' '))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn session() -> UpstreamSession {
        UpstreamSession {
            id: 1,
            email: "a@example.com".to_string(),
            token: String::new(),
            user_agent: None,
            extra_cookies: None,
            expires_at: None,
            is_valid: true,
            usage_count: 0,
            fail_count: 0,
            daily_token_limit: DEFAULT_DAILY_TOKEN_LIMIT,
            daily_token_used: 0,
            last_used_at: None,
            last_check: None,
            last_reset_at: Utc::now(),
            quota_status: SessionQuotaStatus::Available,
            account_type: "free".to_string(),
        }
    }

    #[test]
    fn normalize_strips_control_whitespace() {
        assert_eq!(normalize_email(" a@b.c\r\n"), "a@b.c");
        assert_eq!(normalize_email("a\t@b .c"), "a@b.c");
    }

    #[test]
    fn eligibility_respects_fail_threshold_and_expiry() {
        let now = Utc::now();
        let mut s = session();
        assert!(s.is_eligible(now));

        s.fail_count = FAIL_THRESHOLD;
        assert!(!s.is_eligible(now));
        s.fail_count = FAIL_THRESHOLD - 1;
        assert!(s.is_eligible(now));

        s.expires_at = Some(now - Duration::seconds(1));
        assert!(!s.is_eligible(now));
        s.expires_at = Some(now + Duration::hours(1));
        assert!(s.is_eligible(now));

        s.quota_status = SessionQuotaStatus::Exhausted;
        assert!(!s.is_eligible(now));
    }
}
