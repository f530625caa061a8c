//! Relay dispatch loop
//!
//! One submission gets up to `max_attempts` tries, each against a freshly
//! selected channel. Every failed attempt feeds the health tracker (which
//! may cool the channel for the next selection) and appends a zero-cost
//! ledger entry; a success records latency, bills the call and returns the
//! annotated outcome. Having no selectable channel is not retried: waiting
//! out a cooldown inside the request would just burn the client's timeout.

use chrono::Utc;
use reqwest::{Client, StatusCode};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::channel::ChannelRegistry;
use crate::config::RelayConfig;
use crate::cost::{calculate_cost, CostEvent, CostTracker};
use crate::error::AppError;
use crate::health::HealthTracker;
use crate::providers::{make_adapter, GenerationRequest, GenerationResponse};
use crate::store::CoordStore;

/// A relayed submission, annotated with how it got through
#[derive(Debug, Clone, Serialize)]
pub struct RelayOutcome {
    #[serde(flatten)]
    pub response: GenerationResponse,
    pub channel_id: String,
    pub channel_name: String,
    pub attempts: u32,
    pub cost: f64,
}

pub struct Dispatcher {
    registry: Arc<ChannelRegistry>,
    health: Arc<HealthTracker>,
    cost: Arc<CostTracker>,
    store: Arc<dyn CoordStore>,
    client: Client,
    config: RelayConfig,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<ChannelRegistry>,
        health: Arc<HealthTracker>,
        cost: Arc<CostTracker>,
        store: Arc<dyn CoordStore>,
        client: Client,
        config: RelayConfig,
    ) -> Self {
        Self {
            registry,
            health,
            cost,
            store,
            client,
            config,
        }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Relay one generation request for (tenant, user), retrying across
    /// channels until one succeeds or the attempt budget runs out.
    pub async fn relay(
        &self,
        request_id: &str,
        tenant: &str,
        user_id: &str,
        group: &str,
        request: &GenerationRequest,
    ) -> Result<RelayOutcome, AppError> {
        let timeout = Duration::from_secs(self.config.request_timeout_seconds);
        let mut last_error: Option<AppError> = None;

        for attempt in 1..=self.config.max_attempts {
            let Some(channel) = self
                .registry
                .select(&self.health, tenant, &request.model, group)
                .await
            else {
                // Nothing selectable: fail now rather than after more tries
                // that would see the same empty pool.
                return Err(Self::exhausted(last_error, attempt - 1, &request.model));
            };

            tracing::info!(
                request_id = request_id,
                attempt = attempt,
                channel = %channel.id,
                model = %request.model,
                "Dispatching generation request"
            );

            let busy_key = format!("busy:{}", channel.id);
            if let Err(e) = self.store.incr_i64(&busy_key, 1, None).await {
                tracing::debug!(channel = %channel.id, error = %e, "Busy counter bump failed");
            }

            let started = Instant::now();
            let started_at = Utc::now();
            let adapter = make_adapter(Arc::clone(&channel));
            let payload = adapter.convert_request(request);
            let url = adapter.full_url(&adapter.submit_path());
            let result = adapter.do_request(&self.client, &url, &payload, timeout).await;

            if let Err(e) = self.store.incr_i64(&busy_key, -1, None).await {
                tracing::debug!(channel = %channel.id, error = %e, "Busy counter release failed");
            }

            let latency_ms = started.elapsed().as_millis() as u64;
            let finished_at = Utc::now();

            let raw = match result {
                Ok(raw) => raw,
                Err(e) => {
                    // Transport-level failure; count it like a gateway error
                    let status = match &e {
                        AppError::Timeout(_) => 408,
                        _ => 503,
                    };
                    self.health
                        .record_failure(&channel.id, &request.model, status)
                        .await;
                    self.cost
                        .track_cost(self.failure_event(
                            request_id,
                            &channel.id,
                            user_id,
                            request,
                            started_at,
                            finished_at,
                            Some(status),
                            e.to_string(),
                        ))
                        .await;
                    tracing::warn!(
                        request_id = request_id,
                        attempt = attempt,
                        channel = %channel.id,
                        error = %e,
                        "Attempt failed before a response arrived"
                    );
                    last_error = Some(e);
                    continue;
                }
            };

            if raw.is_error() {
                let message = raw.error_message();
                self.health
                    .record_failure(&channel.id, &request.model, raw.status)
                    .await;
                self.cost
                    .track_cost(self.failure_event(
                        request_id,
                        &channel.id,
                        user_id,
                        request,
                        started_at,
                        finished_at,
                        Some(raw.status),
                        message.clone(),
                    ))
                    .await;
                tracing::warn!(
                    request_id = request_id,
                    attempt = attempt,
                    channel = %channel.id,
                    status = raw.status,
                    error = %message,
                    "Upstream rejected the attempt"
                );
                // Status classification only decides cooldown eligibility;
                // every failure keeps consuming attempts.
                last_error = Some(AppError::Upstream {
                    status: StatusCode::from_u16(raw.status)
                        .unwrap_or(StatusCode::BAD_GATEWAY),
                    message,
                });
                continue;
            }

            let response = adapter.convert_response(&raw.body);
            let prompt_units = estimate_prompt_units(&request.prompt);
            let cost = response
                .cost
                .unwrap_or_else(|| calculate_cost(&request.model, prompt_units, 0));

            self.health.record_success(&channel.id, latency_ms).await;
            self.cost
                .track_cost(CostEvent {
                    request_id: request_id.to_string(),
                    channel_id: channel.id.to_string(),
                    user_id: user_id.to_string(),
                    model: request.model.clone(),
                    prompt_units,
                    completion_units: 0,
                    cost,
                    started_at,
                    finished_at,
                    success: true,
                    http_status: Some(raw.status),
                    error_message: None,
                })
                .await;

            tracing::info!(
                request_id = request_id,
                attempt = attempt,
                channel = %channel.id,
                task_id = %response.task_id,
                latency_ms = latency_ms,
                "Generation request accepted upstream"
            );

            return Ok(RelayOutcome {
                response,
                channel_id: channel.id.to_string(),
                channel_name: channel.name.clone(),
                attempts: attempt,
                cost,
            });
        }

        Err(Self::exhausted(
            last_error,
            self.config.max_attempts,
            &request.model,
        ))
    }

    /// Terminal relay error: the last attempt's cause annotated with how
    /// many attempts were spent, or no-channel when none was ever tried.
    fn exhausted(last_error: Option<AppError>, attempts: u32, model: &str) -> AppError {
        match last_error {
            Some(last) => AppError::RelayExhausted {
                attempts,
                last: Box::new(last),
            },
            None => AppError::NoChannelAvailable(format!(
                "no eligible channel for model '{}'",
                model
            )),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn failure_event(
        &self,
        request_id: &str,
        channel_id: &str,
        user_id: &str,
        request: &GenerationRequest,
        started_at: chrono::DateTime<Utc>,
        finished_at: chrono::DateTime<Utc>,
        http_status: Option<u16>,
        error_message: String,
    ) -> CostEvent {
        CostEvent {
            request_id: request_id.to_string(),
            channel_id: channel_id.to_string(),
            user_id: user_id.to_string(),
            model: request.model.clone(),
            prompt_units: 0,
            completion_units: 0,
            cost: 0.0,
            started_at,
            finished_at,
            success: false,
            http_status,
            error_message: Some(error_message),
        }
    }
}

/// Rough unit estimate for prompt-billed models (4 chars per unit)
fn estimate_prompt_units(prompt: &str) -> u64 {
    (prompt.len() as u64).div_ceil(4).max(1)
}
