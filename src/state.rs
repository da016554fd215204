//! Process-wide services, created once at startup and passed explicitly
//! through the router state. Lifecycle: `initialize -> ready -> shutdown`,
//! where shutdown drains the accounting channel before the process exits.

use std::sync::Arc;

use anyhow::Result;

use crate::config::AppConfig;
use crate::repositories::{
    schema, BalanceRepository, SessionRepository, TokenRepository, UsageRepository,
};
use crate::services::{
    AccountingEngine, EncryptionService, ProviderRegistry, RequestDispatcher, SchedulerService,
    SessionPool, TokenAuthorizer,
};

#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub authorizer: TokenAuthorizer,
    pub session_pool: SessionPool,
    pub registry: Arc<ProviderRegistry>,
    pub accounting: AccountingEngine,
    pub dispatcher: RequestDispatcher,
    pub scheduler: Arc<SchedulerService>,
}

impl AppState {
    pub async fn initialize(config: AppConfig) -> Result<Self> {
        let pool = config.database_pool.clone();

        // Schema first: everything below reads the tables it creates.
        schema::migrate(&pool).await?;

        let encryption = EncryptionService::new(&config.session_encryption_key)
            .map_err(|err| anyhow::anyhow!("invalid SESSION_ENCRYPTION_KEY: {err}"))?;

        let migrated = schema::reencrypt_plaintext_sessions(&pool, &encryption).await?;
        if migrated > 0 {
            tracing::info!("🔐 Credential migration touched {} sessions", migrated);
        }

        if let Some(admin_key) = &config.admin_key {
            schema::seed_admin_token(&pool, admin_key).await?;
        }

        let token_repo = Arc::new(TokenRepository::new(pool.clone()));
        let balance_repo = Arc::new(BalanceRepository::new(pool.clone()));
        let session_repo = Arc::new(SessionRepository::new(pool.clone(), encryption));
        let usage_repo = Arc::new(UsageRepository::new(pool.clone()));

        let authorizer = TokenAuthorizer::new(token_repo.clone());
        let cached = authorizer.warm_up().await?;
        tracing::info!("🔑 Token authorizer warmed up with {} active tokens", cached);

        let session_pool = SessionPool::new(session_repo.clone());
        let sessions = session_pool.reload().await?;
        tracing::info!("🎫 Session pool loaded {} upstream sessions", sessions);

        let registry = Arc::new(ProviderRegistry::from_config(&config.providers));

        let accounting = AccountingEngine::new(
            config.usage_tracking.clone(),
            usage_repo.clone(),
            token_repo.clone(),
            balance_repo,
            session_pool.clone(),
        );

        let dispatcher = RequestDispatcher::new(
            registry.clone(),
            authorizer.clone(),
            session_pool.clone(),
            accounting.clone(),
            config.request_timeout,
        );

        let scheduler = Arc::new(SchedulerService::new(
            config.quota.clone(),
            config.usage_tracking.clone(),
            session_repo,
            token_repo,
            usage_repo,
        ));

        Ok(Self {
            config,
            authorizer,
            session_pool,
            registry,
            accounting,
            dispatcher,
            scheduler,
        })
    }

    /// Graceful drain: stop background jobs, flush accounting.
    pub async fn shutdown(&self) {
        self.scheduler.shutdown();
        self.accounting.shutdown().await;
    }
}
