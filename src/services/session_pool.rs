// ============================================================================
// Upstream Session Pool - Rotating Selection of Upstream Account Credentials
// ============================================================================
//
// In-memory projection of `upstream_sessions`, refreshed from the store on
// demand. Readers dominate; mutations (admin imports, invalidations) trigger
// a reload, so the snapshot sits behind a read-write lock.
//
// Selection: filter eligible sessions for the requested model, order by
// (usage_count asc, last_used_at asc), break ties deterministically by the
// SHA-256 of the email, return up to N candidates for retry.
//
// ============================================================================

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::middleware::error_handling::Result;
use crate::models::catalog::ModelInfo;
use crate::models::session::{normalize_email, UpstreamSession};
use crate::repositories::SessionRepository;

/// A leased session with credentials decrypted, ready for a driver.
#[derive(Debug, Clone)]
pub struct SessionLease {
    pub email: String,
    pub token: String,
    pub user_agent: Option<String>,
    pub cookies: HashMap<String, String>,
}

/// Outcome of a lease attempt. `NoSession` is the sentinel the dispatcher
/// converts into the driver's fallback auth path.
pub enum LeaseOutcome {
    Leased(Vec<SessionLease>),
    NoSession,
}

/// Rows fetched on a cold refresh; wide enough to survive the account-type
/// filter.
const COLD_REFRESH_LIMIT: i64 = 32;

#[derive(Clone)]
pub struct SessionPool {
    repo: Arc<SessionRepository>,
    sessions: Arc<RwLock<Vec<UpstreamSession>>>,
}

impl SessionPool {
    pub fn new(repo: Arc<SessionRepository>) -> Self {
        Self {
            repo,
            sessions: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Refresh the in-memory snapshot from the store.
    pub async fn reload(&self) -> Result<usize> {
        let sessions = self.repo.list_all().await?;
        let count = sessions.len();
        *self.sessions.write().expect("session pool lock poisoned") = sessions;
        Ok(count)
    }

    /// Lease up to `candidates` sessions able to serve `model`, best first.
    /// Credentials are decrypted lazily, here and only here; a row whose
    /// ciphertext fails to decrypt is skipped rather than failing the lease.
    pub async fn lease(&self, model: &ModelInfo, candidates: usize) -> Result<LeaseOutcome> {
        let now = Utc::now();

        let mut eligible: Vec<UpstreamSession> = {
            let sessions = self.sessions.read().expect("session pool lock poisoned");
            sessions
                .iter()
                .filter(|s| s.is_eligible(now) && account_supports(s, model))
                .cloned()
                .collect()
        };

        if eligible.is_empty() {
            // The snapshot may be cold (startup or post-invalidation);
            // re-pull eligible rows from the store, which applies the lease
            // predicate in SQL. Account-type compatibility stays an
            // in-memory concern.
            eligible = self
                .repo
                .lease_session_candidates(COLD_REFRESH_LIMIT)
                .await?
                .into_iter()
                .filter(|s| account_supports(s, model))
                .collect();
        }

        order_candidates(&mut eligible);
        eligible.truncate(candidates.max(1));

        let mut leases = Vec::with_capacity(eligible.len());
        for session in &eligible {
            match self.decrypt_lease(session) {
                Ok(lease) => leases.push(lease),
                Err(err) => {
                    tracing::error!(
                        "❌ Failed to decrypt credentials for session {}: {:?}",
                        session.email,
                        err
                    );
                }
            }
        }

        if leases.is_empty() {
            Ok(LeaseOutcome::NoSession)
        } else {
            Ok(LeaseOutcome::Leased(leases))
        }
    }

    fn decrypt_lease(&self, session: &UpstreamSession) -> Result<SessionLease> {
        let encryption = self.repo.encryption();
        let token = encryption.decrypt_compat(&session.token)?;

        let cookies = match session.extra_cookies.as_deref() {
            Some(raw) if !raw.is_empty() => {
                let plain = encryption.decrypt_compat(raw)?;
                serde_json::from_str::<HashMap<String, String>>(&plain).unwrap_or_default()
            }
            _ => HashMap::new(),
        };

        Ok(SessionLease {
            email: normalize_email(&session.email),
            token,
            user_agent: session.user_agent.clone(),
            cookies,
        })
    }

    /// Post-call bookkeeping: persists counters, then refreshes the
    /// projection so subsequent selections see them.
    pub async fn commit_usage(&self, email: &str, success: bool, tokens_used: i64) -> Result<()> {
        self.repo
            .commit_session_usage(email, success, tokens_used)
            .await?;
        self.reload().await?;
        Ok(())
    }

    pub async fn invalidate(&self, email: &str) -> Result<()> {
        self.repo.invalidate_session(email).await?;
        self.reload().await?;
        Ok(())
    }

    pub fn size(&self) -> usize {
        self.sessions.read().expect("session pool lock poisoned").len()
    }
}

fn account_supports(session: &UpstreamSession, model: &ModelInfo) -> bool {
    !model.requires_pro_account || session.is_pro()
}

/// `(usage_count asc, last_used_at asc, sha256(email))`. Sessions never used
/// sort before any used one.
fn order_candidates(sessions: &mut [UpstreamSession]) {
    sessions.sort_by(|a, b| {
        a.usage_count
            .cmp(&b.usage_count)
            .then_with(|| cmp_last_used(a.last_used_at, b.last_used_at))
            .then_with(|| email_hash(&a.email).cmp(&email_hash(&b.email)))
    });
}

fn cmp_last_used(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> std::cmp::Ordering {
    match (a, b) {
        (None, None) => std::cmp::Ordering::Equal,
        (None, Some(_)) => std::cmp::Ordering::Less,
        (Some(_), None) => std::cmp::Ordering::Greater,
        (Some(a), Some(b)) => a.cmp(&b),
    }
}

fn email_hash(email: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(normalize_email(email).as_bytes());
    hasher.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::session::{SessionQuotaStatus, DEFAULT_DAILY_TOKEN_LIMIT};
    use chrono::Duration;

    fn session(email: &str, usage: i64, last_used: Option<DateTime<Utc>>) -> UpstreamSession {
        UpstreamSession {
            id: 0,
            email: email.to_string(),
            token: String::new(),
            user_agent: None,
            extra_cookies: None,
            expires_at: None,
            is_valid: true,
            usage_count: usage,
            fail_count: 0,
            daily_token_limit: DEFAULT_DAILY_TOKEN_LIMIT,
            daily_token_used: 0,
            last_used_at: last_used,
            last_check: None,
            last_reset_at: Utc::now(),
            quota_status: SessionQuotaStatus::Available,
            account_type: "free".to_string(),
        }
    }

    #[test]
    fn least_used_wins_then_least_recent() {
        let now = Utc::now();
        let mut sessions = vec![
            session("busy@x.com", 10, Some(now)),
            session("fresh@x.com", 2, Some(now - Duration::hours(2))),
            session("recent@x.com", 2, Some(now - Duration::minutes(5))),
        ];
        order_candidates(&mut sessions);
        assert_eq!(sessions[0].email, "fresh@x.com");
        assert_eq!(sessions[1].email, "recent@x.com");
        assert_eq!(sessions[2].email, "busy@x.com");
    }

    #[test]
    fn never_used_sessions_sort_first() {
        let now = Utc::now();
        let mut sessions = vec![
            session("used@x.com", 0, Some(now - Duration::days(30))),
            session("never@x.com", 0, None),
        ];
        order_candidates(&mut sessions);
        assert_eq!(sessions[0].email, "never@x.com");
    }

    #[test]
    fn ties_break_deterministically_by_email_hash() {
        let mut first = vec![session("a@x.com", 1, None), session("b@x.com", 1, None)];
        let mut second = vec![session("b@x.com", 1, None), session("a@x.com", 1, None)];
        order_candidates(&mut first);
        order_candidates(&mut second);
        assert_eq!(first[0].email, second[0].email);
        assert_eq!(first[1].email, second[1].email);
    }

    #[test]
    fn pro_models_need_pro_accounts() {
        let model = crate::models::catalog::find_model("claude-4-opus").unwrap();
        let mut s = session("a@x.com", 0, None);
        assert!(!account_supports(&s, model));
        s.account_type = "Pro".to_string();
        assert!(account_supports(&s, model));

        let open_model = crate::models::catalog::find_model("gpt-4o").unwrap();
        let free = session("b@x.com", 0, None);
        assert!(account_supports(&free, open_model));
    }
}
