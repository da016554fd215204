use chrono::{Duration, Utc};
use sqlx::MySqlPool;

use crate::middleware::error_handling::Result;
use crate::models::session::{normalize_email, UpstreamSession, FAIL_THRESHOLD};
use crate::services::encryption_service::EncryptionService;

const SESSION_COLUMNS: &str = r#"
    id, email, token, user_agent, extra_cookies, expires_at, is_valid,
    usage_count, fail_count, daily_token_limit, daily_token_used,
    last_used_at, last_check, last_reset_at, quota_status, account_type
"#;

/// Store operations on `upstream_sessions`. Credentials stay encrypted in
/// the rows this repo returns; the pool decrypts lazily on lease.
pub struct SessionRepository {
    pool: MySqlPool,
    encryption: EncryptionService,
}

impl SessionRepository {
    pub fn new(pool: MySqlPool, encryption: EncryptionService) -> Self {
        Self { pool, encryption }
    }

    pub fn encryption(&self) -> &EncryptionService {
        &self.encryption
    }

    pub async fn list_all(&self) -> Result<Vec<UpstreamSession>> {
        let sessions = sqlx::query_as::<_, UpstreamSession>(&format!(
            "SELECT {SESSION_COLUMNS} FROM upstream_sessions"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(sessions)
    }

    /// Eligible lease candidates with the lease predicate applied in SQL,
    /// ordered least-used / least-recent first. The pool's cold-refresh path
    /// uses this; the deterministic email-hash tie-break is reapplied in
    /// memory.
    pub async fn lease_session_candidates(&self, limit: i64) -> Result<Vec<UpstreamSession>> {
        let sessions = sqlx::query_as::<_, UpstreamSession>(&format!(
            r#"
            SELECT {SESSION_COLUMNS}
            FROM upstream_sessions
            WHERE is_valid = TRUE
              AND quota_status = 'available'
              AND fail_count < ?
              AND (expires_at IS NULL OR expires_at > UTC_TIMESTAMP())
            ORDER BY usage_count ASC, last_used_at ASC
            LIMIT ?
            "#
        ))
        .bind(FAIL_THRESHOLD)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(sessions)
    }

    /// Per-call bookkeeping, committed after the stream finishes. Counters
    /// are independent atomic increments; their slight temporary skew under
    /// concurrency is tolerated because each is monotone.
    pub async fn commit_session_usage(
        &self,
        email: &str,
        success: bool,
        tokens_used: i64,
    ) -> Result<()> {
        let email = normalize_email(email);

        if success {
            sqlx::query(
                r#"
                UPDATE upstream_sessions
                SET usage_count = usage_count + 1,
                    fail_count = 0,
                    last_used_at = UTC_TIMESTAMP(),
                    daily_token_used = daily_token_used + ?
                WHERE email = ?
                "#,
            )
            .bind(tokens_used)
            .bind(&email)
            .execute(&self.pool)
            .await?;

            // The in-flight call always completes; exhaustion only gates
            // future leases.
            sqlx::query(
                r#"
                UPDATE upstream_sessions
                SET quota_status = 'exhausted'
                WHERE email = ? AND daily_token_used >= daily_token_limit
                "#,
            )
            .bind(&email)
            .execute(&self.pool)
            .await?;
        } else {
            sqlx::query(
                r#"
                UPDATE upstream_sessions
                SET fail_count = fail_count + 1, last_check = UTC_TIMESTAMP()
                WHERE email = ?
                "#,
            )
            .bind(&email)
            .execute(&self.pool)
            .await?;

            sqlx::query(
                r#"
                UPDATE upstream_sessions
                SET is_valid = FALSE
                WHERE email = ? AND fail_count >= ?
                "#,
            )
            .bind(&email)
            .bind(FAIL_THRESHOLD)
            .execute(&self.pool)
            .await?;
        }

        Ok(())
    }

    /// Hard invalidation, used when the upstream rejects the credential
    /// outright (401).
    pub async fn invalidate_session(&self, email: &str) -> Result<()> {
        let email = normalize_email(email);
        sqlx::query(
            "UPDATE upstream_sessions SET is_valid = FALSE, last_check = UTC_TIMESTAMP() WHERE email = ?",
        )
        .bind(&email)
        .execute(&self.pool)
        .await?;
        tracing::warn!("🚫 Upstream session {} invalidated", email);
        Ok(())
    }

    /// Rolling 24-hour reset: any session whose `last_reset_at` is older than
    /// 24 h gets a zeroed counter and available status. Idempotent; at most
    /// one reset per session per window because the reset also refreshes
    /// `last_reset_at`.
    pub async fn reset_daily_quotas(&self) -> Result<u64> {
        let cutoff = Utc::now() - Duration::hours(24);
        let result = sqlx::query(
            r#"
            UPDATE upstream_sessions
            SET daily_token_used = 0,
                quota_status = 'available',
                last_reset_at = UTC_TIMESTAMP()
            WHERE last_reset_at < ?
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Deletes sessions whose non-null, non-epoch expiry has passed.
    pub async fn cleanup_expired_sessions(&self) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM upstream_sessions
            WHERE expires_at IS NOT NULL
              AND expires_at > FROM_UNIXTIME(0)
              AND expires_at < UTC_TIMESTAMP()
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}
