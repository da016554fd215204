use chrono::{Duration, Utc};
use sqlx::MySqlPool;

use crate::middleware::error_handling::Result;
use crate::models::usage::UsageRecord;

/// Append-only usage audit plus the retention/aggregation pass.
pub struct UsageRepository {
    pool: MySqlPool,
}

const INSERT_RECORD: &str = r#"
    INSERT INTO usage_records
        (user_id, username, api_token, token_name, model, prompt_tokens,
         completion_tokens, total_tokens, session_email, status_code,
         error_message, requested_at, responded_at, duration_ms)
    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
"#;

impl UsageRepository {
    pub fn new(pool: MySqlPool) -> Self {
        Self { pool }
    }

    pub async fn insert_usage_record(&self, record: &UsageRecord) -> Result<()> {
        bind_record(sqlx::query(INSERT_RECORD), record)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// One transaction per batch so a mid-batch failure leaves nothing
    /// half-written and the whole batch can be retried.
    pub async fn batch_insert_usage_records(&self, records: &[UsageRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        for record in records {
            bind_record(sqlx::query(INSERT_RECORD), record)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Retention pass: roll counters for records older than `retention_days`
    /// into `aggregate_usage_stats`, then delete them in batches of 1000
    /// with a 100 ms pause between batches.
    pub async fn prune_old_records(&self, retention_days: i64) -> Result<u64> {
        let cutoff = Utc::now() - Duration::days(retention_days);

        sqlx::query(
            r#"
            INSERT INTO aggregate_usage_stats
                (day, user_id, model, request_count, prompt_tokens, completion_tokens, total_tokens)
            SELECT DATE(requested_at), COALESCE(user_id, 0), model,
                   COUNT(*), SUM(prompt_tokens), SUM(completion_tokens), SUM(total_tokens)
            FROM usage_records
            WHERE requested_at < ?
            GROUP BY DATE(requested_at), COALESCE(user_id, 0), model
            ON DUPLICATE KEY UPDATE
                request_count = request_count + VALUES(request_count),
                prompt_tokens = prompt_tokens + VALUES(prompt_tokens),
                completion_tokens = completion_tokens + VALUES(completion_tokens),
                total_tokens = total_tokens + VALUES(total_tokens)
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        let mut total_deleted = 0u64;
        loop {
            let result = sqlx::query("DELETE FROM usage_records WHERE requested_at < ? LIMIT 1000")
                .bind(cutoff)
                .execute(&self.pool)
                .await?;

            let deleted = result.rows_affected();
            total_deleted += deleted;
            if deleted < 1000 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }

        if total_deleted > 0 {
            tracing::info!(
                "🧹 Usage retention: {} records older than {} days pruned",
                total_deleted,
                retention_days
            );
        }

        Ok(total_deleted)
    }
}

fn bind_record<'q>(
    query: sqlx::query::Query<'q, sqlx::MySql, sqlx::mysql::MySqlArguments>,
    record: &'q UsageRecord,
) -> sqlx::query::Query<'q, sqlx::MySql, sqlx::mysql::MySqlArguments> {
    query
        .bind(record.user_id)
        .bind(&record.username)
        .bind(&record.api_token)
        .bind(&record.token_name)
        .bind(&record.model)
        .bind(record.prompt_tokens)
        .bind(record.completion_tokens)
        .bind(record.total_tokens)
        .bind(&record.session_email)
        .bind(record.status_code)
        .bind(&record.error_message)
        .bind(record.requested_at)
        .bind(record.responded_at)
        .bind(record.duration_ms)
}
