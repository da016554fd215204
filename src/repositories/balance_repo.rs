use rust_decimal::Decimal;
use sqlx::{MySqlPool, Row};

use crate::middleware::error_handling::Result;
use crate::models::balance::{cost_for_tokens, BalanceTransaction, TransactionType, UserBalance};

/// Wallet operations. Every debit/credit serializes on a `FOR UPDATE` row
/// lock over the user's balance; `balance_after` in the ledger is the
/// post-lock state, so ledger order matches balance history exactly.
pub struct BalanceRepository {
    pool: MySqlPool,
}

/// Everything a ledger row needs besides amount and type.
#[derive(Debug, Clone, Default)]
pub struct LedgerContext {
    pub tokens: i64,
    pub description: Option<String>,
    pub related_user_id: Option<i64>,
    pub admin_id: Option<i64>,
    pub api_token: Option<String>,
    pub model: Option<String>,
    /// Transaction identity: a debit replayed with the same id is a no-op.
    pub request_id: Option<String>,
}

impl BalanceRepository {
    pub fn new(pool: MySqlPool) -> Self {
        Self { pool }
    }

    pub async fn get_balance(&self, user_id: i64) -> Result<Option<UserBalance>> {
        let balance = sqlx::query_as::<_, UserBalance>(
            r#"
            SELECT user_id, balance_usd, status, total_consumed_usd, total_recharged_usd
            FROM user_balances
            WHERE user_id = ?
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(balance)
    }

    /// Atomic API-usage debit: row lock, cost computation, balance and
    /// `total_consumed` update, exhausted transition (which deactivates all
    /// of the user's tokens inside the same transaction), ledger insert.
    ///
    /// Returns the ledger row. A duplicate `request_id` returns the existing
    /// row without touching the balance.
    pub async fn debit(
        &self,
        user_id: i64,
        tokens: i64,
        api_token: &str,
        model: &str,
        request_id: Option<&str>,
    ) -> Result<BalanceTransaction> {
        let cost = cost_for_tokens(tokens);
        let ctx = LedgerContext {
            tokens,
            api_token: Some(api_token.to_string()),
            model: Some(model.to_string()),
            request_id: request_id.map(str::to_string),
            ..LedgerContext::default()
        };
        self.apply(user_id, -cost, TransactionType::ApiUsage, ctx)
            .await
    }

    /// Mirror of `debit`. A credit that lifts an exhausted balance above zero
    /// reactivates the user's tokens.
    pub async fn credit(
        &self,
        user_id: i64,
        amount: Decimal,
        tx_type: TransactionType,
        ctx: LedgerContext,
    ) -> Result<BalanceTransaction> {
        self.apply(user_id, amount, tx_type, ctx).await
    }

    async fn apply(
        &self,
        user_id: i64,
        amount: Decimal,
        tx_type: TransactionType,
        ctx: LedgerContext,
    ) -> Result<BalanceTransaction> {
        let mut tx = self.pool.begin().await?;

        // Idempotency gate: transaction identity is the request id.
        if let Some(request_id) = ctx.request_id.as_deref() {
            let existing = sqlx::query_as::<_, BalanceTransaction>(
                r#"
                SELECT id, user_id, tx_type, amount, balance_after, tokens, description,
                       related_user_id, admin_id, api_token, model, request_id, created_at
                FROM balance_transactions
                WHERE request_id = ?
                "#,
            )
            .bind(request_id)
            .fetch_optional(&mut *tx)
            .await?;

            if let Some(existing) = existing {
                tx.rollback().await?;
                tracing::debug!("Duplicate balance transaction {} ignored", request_id);
                return Ok(existing);
            }
        }

        // Ensure the wallet row exists, then take the row lock.
        sqlx::query("INSERT IGNORE INTO user_balances (user_id) VALUES (?)")
            .bind(user_id)
            .execute(&mut *tx)
            .await?;

        let row = sqlx::query(
            "SELECT balance_usd, status FROM user_balances WHERE user_id = ? FOR UPDATE",
        )
        .bind(user_id)
        .fetch_one(&mut *tx)
        .await?;

        let balance: Decimal = row.get("balance_usd");
        let status: String = row.get("status");
        let new_balance = (balance + amount).round_dp(6);

        let was_exhausted = status == "exhausted";
        let now_exhausted = new_balance <= Decimal::ZERO;

        let (consumed_delta, recharged_delta) = if amount < Decimal::ZERO {
            (-amount, Decimal::ZERO)
        } else {
            (Decimal::ZERO, amount)
        };

        sqlx::query(
            r#"
            UPDATE user_balances
            SET balance_usd = ?,
                status = ?,
                total_consumed_usd = total_consumed_usd + ?,
                total_recharged_usd = total_recharged_usd + ?
            WHERE user_id = ?
            "#,
        )
        .bind(new_balance)
        .bind(if now_exhausted { "exhausted" } else { "active" })
        .bind(consumed_delta)
        .bind(recharged_delta)
        .bind(user_id)
        .execute(&mut *tx)
        .await?;

        // Exhaustion transitions toggle every token the user owns, inside
        // the same transaction as the balance flip.
        if now_exhausted && !was_exhausted {
            sqlx::query("UPDATE api_tokens SET is_active = FALSE WHERE owner_user_id = ?")
                .bind(user_id)
                .execute(&mut *tx)
                .await?;
            tracing::warn!("💸 User {} balance exhausted - tokens deactivated", user_id);
        } else if !now_exhausted && was_exhausted {
            sqlx::query("UPDATE api_tokens SET is_active = TRUE WHERE owner_user_id = ?")
                .bind(user_id)
                .execute(&mut *tx)
                .await?;
            tracing::info!("✅ User {} balance restored - tokens reactivated", user_id);
        }

        let insert = sqlx::query(
            r#"
            INSERT INTO balance_transactions
                (user_id, tx_type, amount, balance_after, tokens, description,
                 related_user_id, admin_id, api_token, model, request_id)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(user_id)
        .bind(tx_type)
        .bind(amount)
        .bind(new_balance)
        .bind(ctx.tokens)
        .bind(&ctx.description)
        .bind(ctx.related_user_id)
        .bind(ctx.admin_id)
        .bind(&ctx.api_token)
        .bind(&ctx.model)
        .bind(&ctx.request_id)
        .execute(&mut *tx)
        .await?;

        let ledger_id = insert.last_insert_id() as i64;

        let ledger = sqlx::query_as::<_, BalanceTransaction>(
            r#"
            SELECT id, user_id, tx_type, amount, balance_after, tokens, description,
                   related_user_id, admin_id, api_token, model, request_id, created_at
            FROM balance_transactions
            WHERE id = ?
            "#,
        )
        .bind(ledger_id)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(ledger)
    }
}
