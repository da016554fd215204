use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Session identifier recorded when no leasable upstream session existed and
/// the driver fell back to the unauthenticated path.
pub const HUMAN_FALLBACK_SESSION: &str = "x-is-human-fallback";

/// Append-only audit row: exactly one per completed call attempt, success or
/// failure.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct UsageRecord {
    #[sqlx(default)]
    pub id: i64,
    pub user_id: Option<i64>,
    pub username: String,
    pub api_token: String,
    pub token_name: Option<String>,
    pub model: String,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub total_tokens: i64,
    pub session_email: String,
    pub status_code: i32,
    pub error_message: Option<String>,
    pub requested_at: DateTime<Utc>,
    pub responded_at: DateTime<Utc>,
    pub duration_ms: i64,
}

impl UsageRecord {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }
}

/// Per-day, per-user, per-model rollup that retention folds old usage
/// records into before deleting them. `user_id = 0` covers records with no
/// attributable user (system tokens).
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AggregateUsageStat {
    pub day: chrono::NaiveDate,
    pub user_id: i64,
    pub model: String,
    pub request_count: i64,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub total_tokens: i64,
}
