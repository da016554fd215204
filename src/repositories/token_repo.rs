use chrono::Utc;
use rust_decimal::Decimal;
use sqlx::{MySqlPool, Row};

use crate::middleware::error_handling::{GatewayError, Result};
use crate::models::token::{ApiToken, TokenSnapshot};

/// Store operations on `api_tokens`. Anything that can cost money re-reads
/// the row here instead of trusting the authorizer cache.
pub struct TokenRepository {
    pool: MySqlPool,
}

impl TokenRepository {
    pub fn new(pool: MySqlPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &MySqlPool {
        &self.pool
    }

    async fn fetch(&self, value: &str) -> Result<Option<ApiToken>> {
        let token = sqlx::query_as::<_, ApiToken>(
            r#"
            SELECT id, value, masked_value, name, owner_user_id, is_active, created_at,
                   last_used_at, usage_count, quota_limit_usd, quota_used_usd, expires_at,
                   allowed_models
            FROM api_tokens
            WHERE value = ?
            "#,
        )
        .bind(value)
        .fetch_optional(&self.pool)
        .await?;
        Ok(token)
    }

    /// Denormalized snapshot: token row joined with the owner's account and
    /// balance state. Errors: `key_not_found`, `key_disabled`,
    /// `user_disabled`.
    pub async fn validate_token(&self, value: &str) -> Result<TokenSnapshot> {
        let token = self.fetch(value).await?.ok_or(GatewayError::KeyNotFound)?;

        if !token.is_active {
            return Err(GatewayError::KeyDisabled);
        }

        match token.owner_user_id {
            None => Ok(TokenSnapshot {
                username: "system".to_string(),
                user_active: true,
                token,
            }),
            Some(user_id) => {
                let row = sqlx::query(
                    r#"
                    SELECT u.username, u.is_active,
                           COALESCE(b.status, 'active') AS balance_status
                    FROM users u
                    LEFT JOIN user_balances b ON b.user_id = u.id
                    WHERE u.id = ?
                    "#,
                )
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?
                .ok_or(GatewayError::UserDisabled)?;

                let username: String = row.get("username");
                let user_is_active: bool = row.get("is_active");
                let balance_status: String = row.get("balance_status");

                if !user_is_active {
                    return Err(GatewayError::UserDisabled);
                }

                Ok(TokenSnapshot {
                    username,
                    user_active: balance_status != "exhausted",
                    token,
                })
            }
        }
    }

    /// Read-only quota gate: `(ok, limit_or_null, used)`. Uses `>=` so a
    /// token sitting exactly at its limit is refused.
    pub async fn check_quota(&self, value: &str) -> Result<(bool, Option<Decimal>, Decimal)> {
        let token = self.fetch(value).await?.ok_or(GatewayError::KeyNotFound)?;
        let ok = !token.quota_exhausted();
        Ok((ok, token.quota_limit_usd, token.quota_used_usd))
    }

    pub async fn check_expiry(&self, value: &str) -> Result<()> {
        let token = self.fetch(value).await?.ok_or(GatewayError::KeyNotFound)?;
        if token.is_expired(Utc::now()) {
            return Err(GatewayError::KeyExpired);
        }
        Ok(())
    }

    pub async fn check_model_access(&self, value: &str, model: &str) -> Result<()> {
        let token = self.fetch(value).await?.ok_or(GatewayError::KeyNotFound)?;
        if token.allows_model(model) {
            Ok(())
        } else {
            Err(GatewayError::ModelNotAllowed(model.to_string()))
        }
    }

    /// Atomic increment of the token's own spend counter; returns the new
    /// `quota_used_usd`. Concurrent callers all observe monotonic values.
    pub async fn add_token_quota_used(&self, value: &str, cost_usd: Decimal) -> Result<Decimal> {
        sqlx::query(
            r#"
            UPDATE api_tokens
            SET quota_used_usd = quota_used_usd + ?, usage_count = usage_count + 1
            WHERE value = ?
            "#,
        )
        .bind(cost_usd)
        .bind(value)
        .execute(&self.pool)
        .await?;

        let used: Decimal = sqlx::query("SELECT quota_used_usd FROM api_tokens WHERE value = ?")
            .bind(value)
            .fetch_optional(&self.pool)
            .await?
            .map(|row| row.get(0))
            .unwrap_or_default();

        Ok(used)
    }

    /// Flips `is_active` to false iff used >= limit, inside one transaction
    /// with a row lock so a concurrent debit cannot race the decision.
    /// Returns true when the token was disabled by this call.
    pub async fn disable_if_quota_exceeded(&self, value: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            r#"
            SELECT quota_limit_usd, quota_used_usd, is_active
            FROM api_tokens
            WHERE value = ?
            FOR UPDATE
            "#,
        )
        .bind(value)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            tx.rollback().await?;
            return Ok(false);
        };

        let limit: Option<Decimal> = row.get("quota_limit_usd");
        let used: Decimal = row.get("quota_used_usd");
        let is_active: bool = row.get("is_active");

        let exceeded = matches!(limit, Some(limit) if used >= limit);
        if !exceeded || !is_active {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query("UPDATE api_tokens SET is_active = FALSE WHERE value = ?")
            .bind(value)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        tracing::warn!("🚫 API token {} disabled: quota exhausted ({} >= {:?})",
            mask_for_log(value), used, limit);
        Ok(true)
    }

    pub async fn update_last_used(&self, value: &str) -> Result<()> {
        sqlx::query("UPDATE api_tokens SET last_used_at = UTC_TIMESTAMP() WHERE value = ?")
            .bind(value)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Every active token, for the authorizer's startup load.
    pub async fn list_active(&self) -> Result<Vec<ApiToken>> {
        let tokens = sqlx::query_as::<_, ApiToken>(
            r#"
            SELECT id, value, masked_value, name, owner_user_id, is_active, created_at,
                   last_used_at, usage_count, quota_limit_usd, quota_used_usd, expires_at,
                   allowed_models
            FROM api_tokens
            WHERE is_active = TRUE
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(tokens)
    }

    /// Background auto-disable pass: tokens whose spend crossed their limit
    /// between admissions. Returns how many were disabled.
    pub async fn disable_exhausted_tokens(&self) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE api_tokens
            SET is_active = FALSE
            WHERE is_active = TRUE
              AND quota_limit_usd IS NOT NULL
              AND quota_used_usd >= quota_limit_usd
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

fn mask_for_log(value: &str) -> String {
    crate::models::token::mask_token(value)
}
