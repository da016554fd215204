// ============================================================================
// Token Authorizer - In-Memory Validation of Issued API Tokens
// ============================================================================
//
// Holds a process-wide snapshot of every active token, loaded at startup and
// flushed by `reload()` after admin CRUD. The cache is a soft optimization:
// every check that could cost money (quota, balance status, user liveness)
// re-validates against the store so stale reads never bill.
//
// Check order is fixed: existence → token active → user active → expiry →
// model access → quota remaining. The first failing check wins.
//
// ============================================================================

use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;

use crate::middleware::error_handling::{GatewayError, Result};
use crate::models::token::{mask_token, TokenSnapshot};
use crate::repositories::TokenRepository;

/// The authenticated identity handed to the dispatcher.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub token_value: String,
    pub masked_value: String,
    pub token_name: Option<String>,
    pub user_id: Option<i64>,
    pub username: String,
}

#[derive(Clone)]
pub struct TokenAuthorizer {
    repo: Arc<TokenRepository>,
    /// token value → cached snapshot. Advisory only.
    cache: Arc<DashMap<String, TokenSnapshot>>,
}

impl TokenAuthorizer {
    pub fn new(repo: Arc<TokenRepository>) -> Self {
        Self {
            repo,
            cache: Arc::new(DashMap::new()),
        }
    }

    /// Load all active tokens into the cache. Called once at startup.
    pub async fn warm_up(&self) -> Result<usize> {
        let tokens = self.repo.list_active().await?;
        self.cache.clear();
        for token in tokens {
            self.cache.insert(
                token.value.clone(),
                TokenSnapshot {
                    username: String::new(),
                    user_active: true,
                    token,
                },
            );
        }
        Ok(self.cache.len())
    }

    /// Flush the cache; the next authorize repopulates per token.
    pub fn reload(&self) {
        self.cache.clear();
        tracing::info!("🔄 Token authorizer cache flushed");
    }

    /// Full ordered authorization. `requested_model` is `None` when the
    /// model is not yet known (edge middleware); the dispatcher re-checks
    /// model access once the request is translated.
    pub async fn authorize(
        &self,
        value: &str,
        requested_model: Option<&str>,
    ) -> Result<AuthContext> {
        let value = value.trim();
        if value.is_empty() {
            return Err(GatewayError::KeyNotFound);
        }

        // Cache miss is not an error; unknown tokens may have been created
        // since the last reload. The store is authoritative either way:
        // validate_token covers existence, token-active, and user-active.
        let snapshot = self.repo.validate_token(value).await?;
        self.cache.insert(value.to_string(), snapshot.clone());

        if !snapshot.user_active {
            return Err(GatewayError::BalanceExhausted);
        }

        if snapshot.token.is_expired(Utc::now()) {
            return Err(GatewayError::KeyExpired);
        }

        if let Some(model) = requested_model {
            if !snapshot.token.allows_model(model) {
                return Err(GatewayError::ModelNotAllowed(model.to_string()));
            }
        }

        if snapshot.token.quota_exhausted() {
            return Err(GatewayError::QuotaExceeded);
        }

        Ok(AuthContext {
            token_value: snapshot.token.value.clone(),
            masked_value: snapshot.token.masked_value.clone(),
            token_name: snapshot.token.name.clone(),
            user_id: snapshot.token.owner_user_id,
            username: snapshot.username,
        })
    }

    /// Model re-check after translation normalized the model id.
    pub async fn check_model_access(&self, value: &str, model: &str) -> Result<()> {
        self.repo.check_model_access(value, model).await
    }

    pub fn mask(value: &str) -> String {
        mask_token(value)
    }

    /// Cached snapshot count, for the startup log line.
    pub fn cached_tokens(&self) -> usize {
        self.cache.len()
    }
}
