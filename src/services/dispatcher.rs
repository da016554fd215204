// ============================================================================
// Request Dispatcher - the per-request state machine
// ============================================================================
//
// received -> authorized -> translated -> driver_selected -> upstream_opened
//          -> streaming -> terminated (ok | error | cancelled)
//
// The edge middleware handles `received -> authorized` (sans model check, the
// model is only known after translation) and the handlers produce the
// canonical request; everything from driver selection onward lives here.
//
// Failure semantics:
// - no driver for the model        -> 503, no usage record
// - upstream open 401              -> session failure bookkeeping + invalidate,
//                                     retry on the next candidate
// - upstream open 429 / 5xx / net  -> retry with backoff
// - other upstream 4xx             -> surfaced as 502 immediately
// - retries exhausted              -> 502, exactly ONE usage record with the
//                                     final status
//
// Every terminal path funnels through `finalize`, so usage recording and
// post-flight settlement happen exactly once per request.
//
// ============================================================================

use std::sync::Arc;
use std::time::Duration;

use axum::response::{IntoResponse, Response};
use chrono::Utc;
use uuid::Uuid;

use crate::middleware::error_handling::GatewayError;
use crate::models::canonical::{CanonicalRequest, StreamEvent, TokenUsage};
use crate::models::catalog::find_model;
use crate::models::usage::{UsageRecord, HUMAN_FALLBACK_SESSION};
use crate::services::accounting_service::{AccountingEngine, SettleContext};
use crate::services::provider_registry::{retry_backoff, ProviderRegistry, MAX_RETRIES};
use crate::services::session_pool::{LeaseOutcome, SessionLease, SessionPool};
use crate::services::streaming::{drain_to_events, run_streaming, StreamOutcome};
use crate::services::token_authorizer::{AuthContext, TokenAuthorizer};
use crate::services::translator::{anthropic, openai, Protocol};
use crate::services::upstream::{EventStream, ProviderDriver, UpstreamError};

#[derive(Clone)]
pub struct RequestDispatcher {
    registry: Arc<ProviderRegistry>,
    authorizer: TokenAuthorizer,
    session_pool: SessionPool,
    accounting: AccountingEngine,
    request_timeout: Duration,
}

impl RequestDispatcher {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        authorizer: TokenAuthorizer,
        session_pool: SessionPool,
        accounting: AccountingEngine,
        request_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            authorizer,
            session_pool,
            accounting,
            request_timeout,
        }
    }

    /// Drives one translated request to termination and returns the client
    /// response.
    pub async fn dispatch(
        &self,
        auth: AuthContext,
        request: CanonicalRequest,
        protocol: Protocol,
    ) -> Result<Response, GatewayError> {
        // Model access could not be checked at the edge; the model id only
        // exists after translation.
        self.authorizer
            .check_model_access(&auth.token_value, &request.model)
            .await?;

        let model_info = find_model(&request.model)
            .ok_or_else(|| GatewayError::InvalidModel(request.model.clone()))?;

        let drivers = self.registry.list_available_for_model(&request.model);
        if drivers.is_empty() {
            return Err(GatewayError::ProviderNotAvailable(request.model.clone()));
        }

        // driver_selected -> upstream_opened, with failover.
        let attempts = self.build_attempt_plan(&drivers, model_info).await?;
        let requested_at = Utc::now();
        let request_id = Uuid::new_v4().simple().to_string();

        let mut last_error: Option<UpstreamError> = None;
        let mut last_session: Option<String> = None;

        for (attempt, (driver, lease)) in attempts.iter().enumerate() {
            if attempt > 0 {
                tokio::time::sleep(retry_backoff(attempt as u32 - 1)).await;
            }

            let session_email = lease.as_ref().map(|l| l.email.clone());
            match driver.open(&request, lease.as_ref()).await {
                Ok(stream) => {
                    crate::middleware::metrics::UPSTREAM_ATTEMPTS
                        .with_label_values(&[driver.name(), "ok"])
                        .inc();
                    return Ok(self
                        .relay(
                            auth,
                            request,
                            protocol,
                            stream,
                            session_email,
                            driver.is_session_backed(),
                            requested_at,
                            request_id,
                        )
                        .await);
                }
                Err(err) => {
                    crate::middleware::metrics::UPSTREAM_ATTEMPTS
                        .with_label_values(&[driver.name(), "error"])
                        .inc();
                    tracing::warn!(
                        "Upstream open failed (attempt {}/{}, driver {}): {}",
                        attempt + 1,
                        attempts.len(),
                        driver.name(),
                        err
                    );

                    // Failed session attempts feed the pool's failure
                    // counters; a credential rejection also invalidates.
                    if let Some(email) = &session_email {
                        if let Err(commit_err) =
                            self.session_pool.commit_usage(email, false, 0).await
                        {
                            tracing::error!(
                                "Session failure bookkeeping failed for {}: {}",
                                email,
                                commit_err
                            );
                        }
                        if err.is_auth_rejection() {
                            if let Err(inv_err) = self.session_pool.invalidate(email).await {
                                tracing::error!(
                                    "Session invalidation failed for {}: {}",
                                    email,
                                    inv_err
                                );
                            }
                        }
                    }

                    last_session = session_email;
                    let fatal = !err.is_retryable() && !err.is_auth_rejection();
                    last_error = Some(err);
                    if fatal {
                        break;
                    }
                }
            }
        }

        // Retries exhausted: one usage record with the final status.
        let err = last_error
            .unwrap_or_else(|| UpstreamError::new(
                crate::services::upstream::UpstreamErrorKind::Network,
                "no upstream attempt was possible",
            ));
        let status = 502;
        self.finalize(
            &auth,
            &request.model,
            last_session,
            StreamOutcome {
                usage: TokenUsage::default(),
                status_code: status,
                error_message: Some(err.to_string()),
            },
            requested_at,
            request_id,
        );
        Err(GatewayError::Upstream(err.to_string()))
    }

    /// Expands the driver list into concrete attempts, leasing sessions for
    /// the session-backed driver. At most `MAX_RETRIES` retries after the
    /// first attempt.
    async fn build_attempt_plan(
        &self,
        drivers: &[Arc<ProviderDriver>],
        model_info: &'static crate::models::catalog::ModelInfo,
    ) -> Result<Vec<(Arc<ProviderDriver>, Option<SessionLease>)>, GatewayError> {
        let mut attempts: Vec<(Arc<ProviderDriver>, Option<SessionLease>)> = Vec::new();

        for driver in drivers {
            if driver.is_session_backed() {
                match self
                    .session_pool
                    .lease(model_info, MAX_RETRIES as usize + 1)
                    .await?
                {
                    LeaseOutcome::Leased(leases) => {
                        for lease in leases {
                            attempts.push((driver.clone(), Some(lease)));
                        }
                    }
                    // no_session sentinel: the driver falls back to its
                    // unauthenticated path.
                    LeaseOutcome::NoSession => attempts.push((driver.clone(), None)),
                }
            } else {
                attempts.push((driver.clone(), None));
            }
        }

        attempts.truncate(MAX_RETRIES as usize + 1);
        Ok(attempts)
    }

    /// upstream_opened -> streaming -> terminated.
    #[allow(clippy::too_many_arguments)]
    async fn relay(
        &self,
        auth: AuthContext,
        request: CanonicalRequest,
        protocol: Protocol,
        stream: EventStream,
        session_email: Option<String>,
        session_backed: bool,
        requested_at: chrono::DateTime<Utc>,
        request_id: String,
    ) -> Response {
        let scan_tool_calls = !request.tools.is_empty();
        let model = request.model.clone();
        // Fallback-path requests record the sentinel instead of an email.
        let recorded_session = match (&session_email, session_backed) {
            (Some(email), _) => Some(email.clone()),
            (None, true) => Some(HUMAN_FALLBACK_SESSION.to_string()),
            (None, false) => None,
        };

        if request.stream {
            let dispatcher = self.clone();
            let auth_for_cb = auth;
            let model_for_cb = model.clone();
            run_streaming(
                stream,
                protocol,
                model,
                self.request_timeout,
                scan_tool_calls,
                move |outcome| {
                    dispatcher.finalize(
                        &auth_for_cb,
                        &model_for_cb,
                        recorded_session,
                        outcome,
                        requested_at,
                        request_id,
                    );
                },
            )
        } else {
            // The buffered wrapper still terminates through the same single
            // finalize step.
            let (events, outcome) =
                drain_to_events(stream, self.request_timeout, scan_tool_calls).await;
            let response = render_buffered(&model, protocol, &events, &outcome);
            self.finalize(
                &auth,
                &model,
                recorded_session,
                outcome,
                requested_at,
                request_id,
            );
            response
        }
    }

    /// The single emit-final-state step: one usage record, one settlement.
    fn finalize(
        &self,
        auth: &AuthContext,
        model: &str,
        session_email: Option<String>,
        outcome: StreamOutcome,
        requested_at: chrono::DateTime<Utc>,
        request_id: String,
    ) {
        let responded_at = Utc::now();
        let record = UsageRecord {
            id: 0,
            user_id: auth.user_id,
            username: auth.username.clone(),
            api_token: auth.token_value.clone(),
            token_name: auth.token_name.clone(),
            model: model.to_string(),
            prompt_tokens: outcome.usage.prompt_tokens,
            completion_tokens: outcome.usage.completion_tokens,
            total_tokens: outcome.usage.total(),
            session_email: session_email
                .clone()
                .unwrap_or_else(|| HUMAN_FALLBACK_SESSION.to_string()),
            status_code: outcome.status_code,
            error_message: outcome.error_message.clone(),
            requested_at,
            responded_at,
            duration_ms: (responded_at - requested_at).num_milliseconds(),
        };

        self.accounting.ingest(record);
        self.accounting.settle(SettleContext {
            user_id: auth.user_id,
            api_token: auth.token_value.clone(),
            model: model.to_string(),
            usage: outcome.usage,
            status_code: outcome.status_code,
            // Settlement only touches real sessions, never the sentinel.
            session_email: session_email.filter(|email| email != HUMAN_FALLBACK_SESSION),
            request_id,
        });
    }
}

/// Synthesizes the non-streaming client response from the drained events.
fn render_buffered(
    model: &str,
    protocol: Protocol,
    events: &[StreamEvent],
    outcome: &StreamOutcome,
) -> Response {
    if outcome.status_code == 200 {
        match protocol {
            Protocol::OpenAi => {
                let body =
                    openai::synthesize_response(model, Utc::now().timestamp(), events);
                axum::Json(body).into_response()
            }
            Protocol::Anthropic => {
                let body = anthropic::synthesize_response(model, events);
                axum::Json(body).into_response()
            }
        }
    } else {
        let message = outcome
            .error_message
            .clone()
            .unwrap_or_else(|| "upstream stream failed".to_string());
        let err = if outcome.status_code == 499 {
            GatewayError::Cancelled(message)
        } else {
            GatewayError::Upstream(message)
        };
        err.into_response()
    }
}

