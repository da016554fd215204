// ============================================================================
// Accounting Engine - Asynchronous Post-Flight Billing and Usage Ingest
// ============================================================================
//
// Two responsibilities, both off the hot path:
//
// 1. **Usage ingest**: a bounded channel of UsageRecord feeds a batcher that
//    flushes on BATCH_SIZE or FLUSH_INTERVAL, whichever comes first. Failed
//    batches retry with exponential backoff (jittered ±20%); after the
//    retries are spent the batch falls back to single-row inserts and only
//    the rows that still fail are logged and dropped - the client is never
//    blocked on accounting.
//
// 2. **Post-flight settlement**: per request, one supervised task performs
//    the billing quartet: token quota increment (before the debit, so a
//    crash between the two leaves the token's own counter correct), balance
//    debit on 2xx, session success commit (failure bookkeeping belongs to
//    the dispatch loop, which sees every failed attempt), token last-used
//    touch. Each action is independent; a failure is logged and the rest
//    proceed.
//
// `shutdown()` drains both: the channel is flushed and in-flight settlement
// tasks are awaited.
//
// ============================================================================

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use rust_decimal::Decimal;
use tokio::sync::{mpsc, Mutex, RwLock, Semaphore};
use tokio::task::{JoinHandle, JoinSet};

use crate::config::UsageTrackingConfig;
use crate::middleware::metrics;
use crate::models::balance::cost_for_tokens;
use crate::models::canonical::TokenUsage;
use crate::models::usage::UsageRecord;
use crate::repositories::{BalanceRepository, TokenRepository, UsageRepository};
use crate::services::session_pool::SessionPool;

/// Concurrent batch writers.
const WORKER_POOL_SIZE: usize = 4;

/// How long an ingest may wait on a full channel before the record is
/// dropped and counted.
const INGEST_TIMEOUT: Duration = Duration::from_millis(50);

/// Everything settlement needs besides the audit record itself.
#[derive(Debug, Clone)]
pub struct SettleContext {
    pub user_id: Option<i64>,
    pub api_token: String,
    pub model: String,
    pub usage: TokenUsage,
    pub status_code: i32,
    /// `None` when the request ran on the human-fallback path.
    pub session_email: Option<String>,
    /// Transaction identity for the ledger debit.
    pub request_id: String,
}

impl SettleContext {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }
}

#[derive(Clone)]
pub struct AccountingEngine {
    config: UsageTrackingConfig,
    tx: Arc<RwLock<Option<mpsc::Sender<UsageRecord>>>>,
    batcher: Arc<Mutex<Option<JoinHandle<()>>>>,
    settle_tasks: Arc<Mutex<JoinSet<()>>>,
    token_repo: Arc<TokenRepository>,
    balance_repo: Arc<BalanceRepository>,
    session_pool: SessionPool,
}

impl AccountingEngine {
    pub fn new(
        config: UsageTrackingConfig,
        usage_repo: Arc<UsageRepository>,
        token_repo: Arc<TokenRepository>,
        balance_repo: Arc<BalanceRepository>,
        session_pool: SessionPool,
    ) -> Self {
        let (tx, rx) = mpsc::channel(config.channel_size.max(1));
        let batcher = tokio::spawn(run_batcher(config.clone(), rx, usage_repo));

        Self {
            config,
            tx: Arc::new(RwLock::new(Some(tx))),
            batcher: Arc::new(Mutex::new(Some(batcher))),
            settle_tasks: Arc::new(Mutex::new(JoinSet::new())),
            token_repo,
            balance_repo,
            session_pool,
        }
    }

    /// Best-effort, non-blocking ingest of one usage record. On a full
    /// channel the send gets a short timeout; past that the record is
    /// dropped and counted, never blocking the request path.
    pub fn ingest(&self, record: UsageRecord) {
        if !self.config.enabled {
            return;
        }
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let sender = { tx.read().await.clone() };
            let Some(sender) = sender else {
                metrics::ACCOUNTING_RECORDS_DROPPED.inc();
                tracing::warn!("Usage record dropped: accounting engine is shut down");
                return;
            };
            match sender.send_timeout(record, INGEST_TIMEOUT).await {
                Ok(()) => {}
                Err(err) => {
                    metrics::ACCOUNTING_RECORDS_DROPPED.inc();
                    tracing::warn!("Usage record dropped: {}", err);
                }
            }
        });
    }

    /// Launches the supervised settlement task for one finished request.
    pub fn settle(&self, ctx: SettleContext) {
        let token_repo = self.token_repo.clone();
        let balance_repo = self.balance_repo.clone();
        let session_pool = self.session_pool.clone();
        let tasks = self.settle_tasks.clone();

        tokio::spawn(async move {
            let mut set = tasks.lock().await;
            // Reap finished tasks so the set stays small.
            while set.try_join_next().is_some() {}
            set.spawn(run_settlement(ctx, token_repo, balance_repo, session_pool));
        });
    }

    /// Graceful drain: stop accepting records, flush the channel, await
    /// settlement tasks.
    pub async fn shutdown(&self) {
        {
            let mut tx = self.tx.write().await;
            tx.take();
        }
        if let Some(batcher) = self.batcher.lock().await.take() {
            if let Err(err) = batcher.await {
                tracing::error!("Accounting batcher panicked during drain: {}", err);
            }
        }
        let mut tasks = self.settle_tasks.lock().await;
        while tasks.join_next().await.is_some() {}
        tracing::info!("✅ Accounting engine drained");
    }
}

/// The post-flight billing quartet. Ordering matters only for the billing
/// pair: the token's own counter moves before the wallet debit.
async fn run_settlement(
    ctx: SettleContext,
    token_repo: Arc<TokenRepository>,
    balance_repo: Arc<BalanceRepository>,
    session_pool: SessionPool,
) {
    let total_tokens = ctx.usage.total();
    let billable = ctx.is_success() && total_tokens > 0;
    let cost = if billable {
        cost_for_tokens(total_tokens)
    } else {
        Decimal::ZERO
    };

    // (1) token quota counter, then the exceeded check.
    if let Err(err) = token_repo.add_token_quota_used(&ctx.api_token, cost).await {
        tracing::error!("Settlement: token quota increment failed: {}", err);
    }
    match token_repo.disable_if_quota_exceeded(&ctx.api_token).await {
        Ok(true) => {}
        Ok(false) => {}
        Err(err) => tracing::error!("Settlement: quota-exceeded check failed: {}", err),
    }

    // (2) wallet debit, 2xx with reported tokens only.
    if billable {
        if let Some(user_id) = ctx.user_id {
            if let Err(err) = balance_repo
                .debit(
                    user_id,
                    total_tokens,
                    &ctx.api_token,
                    &ctx.model,
                    Some(&ctx.request_id),
                )
                .await
            {
                tracing::error!("Settlement: balance debit failed for user {}: {}", user_id, err);
            }
        }
    }

    // (3) session bookkeeping, independent of client billing. Success only:
    // failed attempts already had their fail_count bumped by the dispatch
    // loop, which owns failure bookkeeping end-to-end.
    if ctx.is_success() {
        if let Some(email) = &ctx.session_email {
            if let Err(err) = session_pool
                .commit_usage(email, true, total_tokens)
                .await
            {
                tracing::error!("Settlement: session usage commit failed for {}: {}", email, err);
            }
        }
    }

    // (4) last-used touch on success.
    if ctx.is_success() {
        if let Err(err) = token_repo.update_last_used(&ctx.api_token).await {
            tracing::error!("Settlement: last-used update failed: {}", err);
        }
    }
}

async fn run_batcher(
    config: UsageTrackingConfig,
    mut rx: mpsc::Receiver<UsageRecord>,
    usage_repo: Arc<UsageRepository>,
) {
    let semaphore = Arc::new(Semaphore::new(WORKER_POOL_SIZE));
    let mut batch: Vec<UsageRecord> = Vec::with_capacity(config.batch_size);
    let mut flush_tick = tokio::time::interval(config.flush_interval);
    flush_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut writers: JoinSet<()> = JoinSet::new();

    loop {
        tokio::select! {
            maybe = rx.recv() => match maybe {
                Some(record) => {
                    batch.push(record);
                    if batch.len() >= config.batch_size {
                        dispatch_batch(&mut batch, &config, &usage_repo, &semaphore, &mut writers);
                    }
                }
                None => {
                    // Channel closed: final flush, then wait for writers.
                    dispatch_batch(&mut batch, &config, &usage_repo, &semaphore, &mut writers);
                    while writers.join_next().await.is_some() {}
                    return;
                }
            },
            _ = flush_tick.tick() => {
                dispatch_batch(&mut batch, &config, &usage_repo, &semaphore, &mut writers);
            }
        }
        while writers.try_join_next().is_some() {}
    }
}

fn dispatch_batch(
    batch: &mut Vec<UsageRecord>,
    config: &UsageTrackingConfig,
    usage_repo: &Arc<UsageRepository>,
    semaphore: &Arc<Semaphore>,
    writers: &mut JoinSet<()>,
) {
    if batch.is_empty() {
        return;
    }
    let records = std::mem::take(batch);
    let usage_repo = usage_repo.clone();
    let semaphore = semaphore.clone();
    let max_retries = config.max_retries;
    let backoff_ms = config.retry_backoff_ms;

    writers.spawn(async move {
        let _permit = semaphore.acquire_owned().await.expect("semaphore closed");
        write_with_retries(&records, &usage_repo, max_retries, backoff_ms).await;
    });
}

async fn write_with_retries(
    records: &[UsageRecord],
    usage_repo: &UsageRepository,
    max_retries: u32,
    backoff_ms: u64,
) {
    let mut attempt = 0u32;
    loop {
        match usage_repo.batch_insert_usage_records(records).await {
            Ok(()) => {
                tracing::debug!("📊 Usage batch of {} records written", records.len());
                return;
            }
            Err(err) if attempt < max_retries => {
                let delay = jittered_backoff(backoff_ms, attempt);
                tracing::warn!(
                    "Usage batch write failed (attempt {}/{}), retrying in {:?}: {}",
                    attempt + 1,
                    max_retries,
                    delay,
                    err
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => {
                // One poison row should not take the whole batch with it:
                // salvage what single-row inserts still can, drop the rest.
                tracing::error!(
                    "Usage batch of {} records failed after {} retries, salvaging row-by-row: {}",
                    records.len(),
                    max_retries,
                    err
                );
                let mut dropped = 0u64;
                for record in records {
                    if let Err(row_err) = usage_repo.insert_usage_record(record).await {
                        dropped += 1;
                        tracing::error!(
                            "Usage record for token {} dropped: {}",
                            record.api_token,
                            row_err
                        );
                    }
                }
                if dropped > 0 {
                    metrics::ACCOUNTING_RECORDS_DROPPED.inc_by(dropped as f64);
                    tracing::error!("❌ Dropped {} of {} usage records", dropped, records.len());
                }
                return;
            }
        }
    }
}

/// Base backoff doubled per attempt, jittered ±20%.
fn jittered_backoff(base_ms: u64, attempt: u32) -> Duration {
    let ms = base_ms.saturating_mul(1u64 << attempt.min(16)) as f64;
    let jitter = rand::thread_rng().gen_range(0.8..=1.2);
    Duration::from_millis((ms * jitter) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_with_bounded_jitter() {
        for attempt in 0..4u32 {
            let nominal = 500u64 * (1 << attempt);
            let delay = jittered_backoff(500, attempt).as_millis() as u64;
            let low = nominal * 8 / 10;
            let high = nominal * 12 / 10;
            assert!(
                (low..=high).contains(&delay),
                "attempt {attempt}: {delay} outside [{low}, {high}]"
            );
        }
    }

    #[test]
    fn settlement_bills_only_successful_nonzero_usage() {
        let success = SettleContext {
            user_id: Some(1),
            api_token: "sk-a".to_string(),
            model: "gpt-4o".to_string(),
            usage: TokenUsage {
                prompt_tokens: 100,
                completion_tokens: 400,
            },
            status_code: 200,
            session_email: None,
            request_id: "r1".to_string(),
        };
        assert!(success.is_success());

        let cancelled = SettleContext {
            status_code: 499,
            ..success.clone()
        };
        assert!(!cancelled.is_success());

        let zero_usage = SettleContext {
            usage: TokenUsage::default(),
            ..success
        };
        // 2xx with zero reported tokens stays unbilled.
        assert!(zero_usage.is_success() && zero_usage.usage.total() == 0);
    }
}
