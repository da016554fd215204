// ============================================================================
// Startup Schema Migration
// ============================================================================
//
// Lightweight migration phase run once at boot:
//
// 1. Creates every table the gateway owns (idempotent CREATE IF NOT EXISTS).
// 2. Adds columns introduced after initial deployments (checked against
//    information_schema because MySQL lacks ADD COLUMN IF NOT EXISTS).
// 3. ⚠️  DESTRUCTIVE, documented: if a legacy `users.id` is not a 64-bit
//    integer, the dependent gateway tables are dropped so the schema can be
//    recreated cleanly. Balances, tokens, and usage history are lost in that
//    case; operators migrating from the legacy schema must export first.
// 4. Seeds the admin token from ADMIN_KEY on first boot.
// 5. Re-encrypts legacy plaintext session credentials.
//
// ============================================================================

use sqlx::{MySqlPool, Row};

use crate::middleware::error_handling::Result;
use crate::models::token::mask_token;
use crate::services::encryption_service::{is_encrypted, EncryptionService};

pub async fn migrate(pool: &MySqlPool) -> Result<()> {
    rebuild_if_legacy_user_ids(pool).await?;

    for ddl in CREATE_TABLES {
        sqlx::query(ddl).execute(pool).await?;
    }

    // Columns added after the initial schema shipped.
    add_column_if_missing(
        pool,
        "balance_transactions",
        "request_id",
        "VARCHAR(64) NULL UNIQUE",
    )
    .await?;
    add_column_if_missing(pool, "upstream_sessions", "account_type", "VARCHAR(32) NOT NULL DEFAULT 'free'")
        .await?;
    add_column_if_missing(pool, "api_tokens", "allowed_models", "TEXT NULL").await?;

    tracing::info!("✅ Database schema migration completed");
    Ok(())
}

/// Drops gateway tables when `users.id` predates the 64-bit id migration.
/// `ON DELETE CASCADE` children go first.
async fn rebuild_if_legacy_user_ids(pool: &MySqlPool) -> Result<()> {
    let id_type: Option<String> = sqlx::query(
        r#"
        SELECT DATA_TYPE FROM information_schema.COLUMNS
        WHERE TABLE_SCHEMA = DATABASE() AND TABLE_NAME = 'users' AND COLUMN_NAME = 'id'
        "#,
    )
    .fetch_optional(pool)
    .await?
    .map(|row| row.get::<String, _>(0));

    if let Some(data_type) = id_type {
        if !data_type.eq_ignore_ascii_case("bigint") {
            tracing::warn!(
                "⚠️  Legacy users.id type '{}' detected - dropping dependent tables for clean recreate",
                data_type
            );
            for table in [
                "balance_transactions",
                "usage_records",
                "user_balances",
                "api_tokens",
                "users",
            ] {
                sqlx::query(&format!("DROP TABLE IF EXISTS {table}"))
                    .execute(pool)
                    .await?;
            }
        }
    }

    Ok(())
}

async fn add_column_if_missing(
    pool: &MySqlPool,
    table: &str,
    column: &str,
    definition: &str,
) -> Result<()> {
    let exists: i64 = sqlx::query(
        r#"
        SELECT COUNT(*) FROM information_schema.COLUMNS
        WHERE TABLE_SCHEMA = DATABASE() AND TABLE_NAME = ? AND COLUMN_NAME = ?
        "#,
    )
    .bind(table)
    .bind(column)
    .fetch_one(pool)
    .await?
    .get(0);

    if exists == 0 {
        sqlx::query(&format!("ALTER TABLE {table} ADD COLUMN {column} {definition}"))
            .execute(pool)
            .await?;
        tracing::info!("✅ Added column {}.{}", table, column);
    }

    Ok(())
}

/// One-time seed of the admin token (owner NULL = system token). Idempotent:
/// a second boot with the same ADMIN_KEY is a no-op.
pub async fn seed_admin_token(pool: &MySqlPool, admin_key: &str) -> Result<()> {
    let result = sqlx::query(
        r#"
        INSERT INTO api_tokens (value, masked_value, name, owner_user_id, is_active)
        SELECT ?, ?, 'admin', NULL, TRUE
        WHERE NOT EXISTS (SELECT 1 FROM api_tokens WHERE value = ?)
        "#,
    )
    .bind(admin_key)
    .bind(mask_token(admin_key))
    .bind(admin_key)
    .execute(pool)
    .await?;

    if result.rows_affected() > 0 {
        tracing::info!("🔑 Admin token seeded from ADMIN_KEY");
    }

    Ok(())
}

/// One-shot migration of legacy plaintext session credentials, runnable at
/// startup or on demand. Detects plaintext via the ciphertext format check.
pub async fn reencrypt_plaintext_sessions(
    pool: &MySqlPool,
    encryption: &EncryptionService,
) -> Result<u64> {
    let rows = sqlx::query("SELECT id, token, extra_cookies FROM upstream_sessions")
        .fetch_all(pool)
        .await?;

    let mut migrated = 0u64;
    for row in rows {
        let id: i64 = row.get("id");
        let token: String = row.get("token");
        let extra_cookies: Option<String> = row.get("extra_cookies");

        let token_needs = !token.is_empty() && !is_encrypted(&token);
        let cookies_need = extra_cookies
            .as_deref()
            .map(|c| !c.is_empty() && !is_encrypted(c))
            .unwrap_or(false);

        if !token_needs && !cookies_need {
            continue;
        }

        let new_token = if token_needs {
            encryption.encrypt(&token)?
        } else {
            token
        };
        let new_cookies = match extra_cookies {
            Some(cookies) if cookies_need => Some(encryption.encrypt(&cookies)?),
            other => other,
        };

        sqlx::query("UPDATE upstream_sessions SET token = ?, extra_cookies = ? WHERE id = ?")
            .bind(new_token)
            .bind(new_cookies)
            .bind(id)
            .execute(pool)
            .await?;
        migrated += 1;
    }

    if migrated > 0 {
        tracing::info!("🔐 Re-encrypted {} legacy plaintext session rows", migrated);
    }

    Ok(migrated)
}

const CREATE_TABLES: &[&str] = &[
    // Owned minimally here: user management itself is an external concern,
    // but balances, tokens, and usage records hang off users.id.
    r#"
    CREATE TABLE IF NOT EXISTS users (
        id BIGINT AUTO_INCREMENT PRIMARY KEY,
        username VARCHAR(191) NOT NULL UNIQUE,
        is_active BOOLEAN NOT NULL DEFAULT TRUE,
        created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS api_tokens (
        id BIGINT AUTO_INCREMENT PRIMARY KEY,
        value VARCHAR(191) NOT NULL UNIQUE,
        masked_value VARCHAR(64) NOT NULL,
        name VARCHAR(191) NULL,
        owner_user_id BIGINT NULL,
        is_active BOOLEAN NOT NULL DEFAULT TRUE,
        created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
        last_used_at TIMESTAMP NULL,
        usage_count BIGINT NOT NULL DEFAULT 0,
        quota_limit_usd DECIMAL(20,6) NULL,
        quota_used_usd DECIMAL(20,6) NOT NULL DEFAULT 0,
        expires_at TIMESTAMP NULL,
        allowed_models TEXT NULL,
        CONSTRAINT fk_api_tokens_owner FOREIGN KEY (owner_user_id)
            REFERENCES users(id) ON DELETE CASCADE
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS user_balances (
        user_id BIGINT PRIMARY KEY,
        balance_usd DECIMAL(20,6) NOT NULL DEFAULT 0,
        status VARCHAR(16) NOT NULL DEFAULT 'active',
        total_consumed_usd DECIMAL(20,6) NOT NULL DEFAULT 0,
        total_recharged_usd DECIMAL(20,6) NOT NULL DEFAULT 0,
        CONSTRAINT fk_user_balances_user FOREIGN KEY (user_id)
            REFERENCES users(id) ON DELETE CASCADE
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS upstream_sessions (
        id BIGINT AUTO_INCREMENT PRIMARY KEY,
        email VARCHAR(191) NOT NULL UNIQUE,
        token TEXT NOT NULL,
        user_agent VARCHAR(512) NULL,
        extra_cookies TEXT NULL,
        expires_at TIMESTAMP NULL,
        is_valid BOOLEAN NOT NULL DEFAULT TRUE,
        usage_count BIGINT NOT NULL DEFAULT 0,
        fail_count INT NOT NULL DEFAULT 0,
        daily_token_limit BIGINT NOT NULL DEFAULT 100000,
        daily_token_used BIGINT NOT NULL DEFAULT 0,
        last_used_at TIMESTAMP NULL,
        last_check TIMESTAMP NULL,
        last_reset_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
        quota_status VARCHAR(16) NOT NULL DEFAULT 'available',
        account_type VARCHAR(32) NOT NULL DEFAULT 'free'
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS usage_records (
        id BIGINT AUTO_INCREMENT PRIMARY KEY,
        user_id BIGINT NULL,
        username VARCHAR(191) NOT NULL,
        api_token VARCHAR(191) NOT NULL,
        token_name VARCHAR(191) NULL,
        model VARCHAR(128) NOT NULL,
        prompt_tokens BIGINT NOT NULL DEFAULT 0,
        completion_tokens BIGINT NOT NULL DEFAULT 0,
        total_tokens BIGINT NOT NULL DEFAULT 0,
        session_email VARCHAR(191) NOT NULL,
        status_code INT NOT NULL,
        error_message TEXT NULL,
        requested_at TIMESTAMP NOT NULL,
        responded_at TIMESTAMP NOT NULL,
        duration_ms BIGINT NOT NULL DEFAULT 0,
        INDEX idx_usage_records_user_date (user_id, requested_at),
        INDEX idx_usage_records_requested (requested_at)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS balance_transactions (
        id BIGINT AUTO_INCREMENT PRIMARY KEY,
        user_id BIGINT NOT NULL,
        tx_type VARCHAR(32) NOT NULL,
        amount DECIMAL(20,6) NOT NULL,
        balance_after DECIMAL(20,6) NOT NULL,
        tokens BIGINT NOT NULL DEFAULT 0,
        description TEXT NULL,
        related_user_id BIGINT NULL,
        admin_id BIGINT NULL,
        api_token VARCHAR(191) NULL,
        model VARCHAR(128) NULL,
        request_id VARCHAR(64) NULL UNIQUE,
        created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
        INDEX idx_balance_tx_user_date (user_id, created_at),
        CONSTRAINT fk_balance_tx_user FOREIGN KEY (user_id)
            REFERENCES users(id) ON DELETE CASCADE
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS aggregate_usage_stats (
        day DATE NOT NULL,
        user_id BIGINT NOT NULL DEFAULT 0,
        model VARCHAR(128) NOT NULL,
        request_count BIGINT NOT NULL DEFAULT 0,
        prompt_tokens BIGINT NOT NULL DEFAULT 0,
        completion_tokens BIGINT NOT NULL DEFAULT 0,
        total_tokens BIGINT NOT NULL DEFAULT 0,
        PRIMARY KEY (day, user_id, model)
    )
    "#,
];
