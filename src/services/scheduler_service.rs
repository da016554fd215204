// ============================================================================
// Scheduler Service - One Owner for Every Background Job
// ============================================================================
//
// Jobs are idempotent, so running them on every instance is safe; they are
// registered with a name and a cadence, and all of them compose with a
// single shutdown signal. Per-job last-run / last-error state is kept for
// the startup/status log line.
//
// Registered jobs:
// - session_quota_reset  (10 min)  reset sessions 24h past last_reset_at
// - session_cleanup      (1 h)     delete sessions with a passed expiry
// - usage_retention      (daily)   aggregate + prune old usage records
// - token_auto_disable   (10 min)  disable tokens whose spend crossed quota
//
// ============================================================================

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{watch, Mutex};

use crate::config::{QuotaConfig, UsageTrackingConfig};
use crate::repositories::{SessionRepository, TokenRepository, UsageRepository};

type JobFuture = Pin<Box<dyn Future<Output = anyhow::Result<String>> + Send>>;
type JobFn = Arc<dyn Fn() -> JobFuture + Send + Sync>;

#[derive(Debug, Clone, Copy)]
enum Cadence {
    Every(Duration),
    DailyAt { hour: u32, minute: u32 },
}

#[derive(Debug, Default)]
struct JobState {
    last_run: Option<chrono::DateTime<Utc>>,
    last_error: Option<String>,
}

struct Job {
    name: &'static str,
    cadence: Cadence,
    run: JobFn,
    state: Arc<Mutex<JobState>>,
}

pub struct SchedulerService {
    jobs: Vec<Job>,
    shutdown_tx: watch::Sender<bool>,
}

impl SchedulerService {
    pub fn new(
        quota_config: QuotaConfig,
        usage_config: UsageTrackingConfig,
        session_repo: Arc<SessionRepository>,
        token_repo: Arc<TokenRepository>,
        usage_repo: Arc<UsageRepository>,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        let mut jobs = Vec::new();

        if quota_config.enabled {
            let repo = session_repo.clone();
            jobs.push(Job {
                name: "session_quota_reset",
                cadence: Cadence::Every(Duration::from_secs(600)),
                run: Arc::new(move || {
                    let repo = repo.clone();
                    Box::pin(async move {
                        let reset = repo.reset_daily_quotas().await?;
                        Ok(format!("{reset} sessions reset"))
                    })
                }),
                state: Arc::default(),
            });
        }

        {
            let repo = session_repo;
            jobs.push(Job {
                name: "session_cleanup",
                cadence: Cadence::Every(Duration::from_secs(3600)),
                run: Arc::new(move || {
                    let repo = repo.clone();
                    Box::pin(async move {
                        let deleted = repo.cleanup_expired_sessions().await?;
                        Ok(format!("{deleted} expired sessions deleted"))
                    })
                }),
                state: Arc::default(),
            });
        }

        if usage_config.enabled {
            let repo = usage_repo;
            let retention_days = usage_config.retention_days;
            jobs.push(Job {
                name: "usage_retention",
                cadence: Cadence::DailyAt {
                    hour: usage_config.cleanup_hour,
                    minute: usage_config.cleanup_minute,
                },
                run: Arc::new(move || {
                    let repo = repo.clone();
                    Box::pin(async move {
                        let pruned = repo.prune_old_records(retention_days).await?;
                        Ok(format!("{pruned} usage records pruned"))
                    })
                }),
                state: Arc::default(),
            });
        }

        {
            let repo = token_repo;
            jobs.push(Job {
                name: "token_auto_disable",
                cadence: Cadence::Every(Duration::from_secs(600)),
                run: Arc::new(move || {
                    let repo = repo.clone();
                    Box::pin(async move {
                        let disabled = repo.disable_exhausted_tokens().await?;
                        Ok(format!("{disabled} tokens disabled"))
                    })
                }),
                state: Arc::default(),
            });
        }

        Self { jobs, shutdown_tx }
    }

    /// Spawns one loop per job. Returns immediately.
    pub fn start(&self) {
        for job in &self.jobs {
            let name = job.name;
            let cadence = job.cadence;
            let run = job.run.clone();
            let state = job.state.clone();
            let mut shutdown_rx = self.shutdown_tx.subscribe();

            tokio::spawn(async move {
                tracing::info!("⏰ Scheduler job '{}' started ({:?})", name, cadence);
                loop {
                    let delay = match cadence {
                        Cadence::Every(period) => period,
                        Cadence::DailyAt { hour, minute } => delay_until_daily(hour, minute),
                    };

                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown_rx.changed() => {
                            tracing::info!("⏰ Scheduler job '{}' stopped", name);
                            return;
                        }
                    }

                    let result = run().await;
                    let mut state = state.lock().await;
                    state.last_run = Some(Utc::now());
                    match result {
                        Ok(summary) => {
                            state.last_error = None;
                            tracing::info!("✅ Job '{}' completed: {}", name, summary);
                        }
                        Err(err) => {
                            state.last_error = Some(err.to_string());
                            tracing::error!("❌ Job '{}' failed: {}", name, err);
                        }
                    }
                }
            });
        }
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub fn job_names(&self) -> Vec<&'static str> {
        self.jobs.iter().map(|job| job.name).collect()
    }
}

/// Time until the next wall-clock occurrence of `hour:minute` UTC.
fn delay_until_daily(hour: u32, minute: u32) -> Duration {
    let now = Utc::now();
    let today_target = now
        .date_naive()
        .and_hms_opt(hour.min(23), minute.min(59), 0)
        .expect("valid wall-clock time")
        .and_utc();
    let target = if today_target > now {
        today_target
    } else {
        today_target + chrono::Duration::days(1)
    };
    (target - now).to_std().unwrap_or(Duration::from_secs(60))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;

    #[test]
    fn daily_delay_is_positive_and_under_a_day() {
        let now = Utc::now();
        let delay = delay_until_daily(now.hour(), now.minute());
        // The current minute has already started, so the next run is ~24h out.
        assert!(delay <= Duration::from_secs(24 * 3600));
        assert!(delay > Duration::from_secs(0));
    }
}
