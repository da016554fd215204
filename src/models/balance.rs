use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// 1 USD buys this many upstream tokens under the baseline price.
pub const TOKENS_PER_USD: i64 = 1_000_000;

/// Baseline cost formula: `tokens / 1,000,000` USD, kept at 6 fractional
/// digits. Used whenever a provider does not supply a model-specific price.
pub fn cost_for_tokens(tokens: i64) -> Decimal {
    (Decimal::from(tokens) / dec!(1_000_000)).round_dp(6)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum BalanceStatus {
    Active,
    Exhausted,
}

/// A user's USD wallet. One row per user.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct UserBalance {
    pub user_id: i64,
    pub balance_usd: Decimal,
    pub status: BalanceStatus,
    pub total_consumed_usd: Decimal,
    pub total_recharged_usd: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    Initial,
    ApiUsage,
    ReferralBonus,
    AdminAdjust,
    GameExchange,
    GamePurchase,
}

/// Append-only ledger entry. `balance_after` always equals the previous
/// row's `balance_after` for the same user plus `amount`, modulo rounding.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct BalanceTransaction {
    pub id: i64,
    pub user_id: i64,
    pub tx_type: TransactionType,
    /// Signed: debits negative, credits positive.
    pub amount: Decimal,
    pub balance_after: Decimal,
    pub tokens: i64,
    pub description: Option<String>,
    pub related_user_id: Option<i64>,
    pub admin_id: Option<i64>,
    pub api_token: Option<String>,
    pub model: Option<String>,
    /// Idempotency identity: a debit replayed with the same request id is a
    /// no-op (unique when present).
    pub request_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn baseline_cost_is_one_usd_per_million_tokens() {
        assert_eq!(cost_for_tokens(1_000_000), dec!(1.000000));
        assert_eq!(cost_for_tokens(500), dec!(0.000500));
        assert_eq!(cost_for_tokens(0), dec!(0));
    }

    #[test]
    fn cost_keeps_six_fractional_digits() {
        // 1 token rounds to the smallest representable USD step.
        assert_eq!(cost_for_tokens(1), dec!(0.000001));
        assert_eq!(cost_for_tokens(1).scale(), 6);
    }
}
