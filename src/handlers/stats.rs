//! Health and spend reporting

use axum::extract::{Query, State};
use axum::{Extension, Json};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::auth::AuthContext;
use crate::error::AppError;
use crate::server::AppState;

/// GET /health (unauthenticated liveness probe)
pub async fn liveness() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// GET /stats/health
pub async fn channel_health(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
) -> Json<Value> {
    let channels = state.registry.all(&auth.tenant);
    let snapshots = state.health.snapshot(&channels).await;
    Json(json!({ "channels": snapshots }))
}

#[derive(Debug, Deserialize)]
pub struct CostsParams {
    pub channel_id: Option<String>,
}

/// GET /stats/costs
///
/// Fast counters from the coordination store plus durable totals from the
/// ledger; the two can briefly disagree while detached writes drain.
pub async fn costs(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Query(params): Query<CostsParams>,
) -> Result<Json<Value>, AppError> {
    let channels: Vec<_> = state
        .registry
        .all(&auth.tenant)
        .into_iter()
        .filter(|c| {
            params
                .channel_id
                .as_deref()
                .map_or(true, |wanted| c.id.as_ref() == wanted)
        })
        .collect();

    let mut entries = Vec::with_capacity(channels.len());
    for channel in &channels {
        let durable = state
            .db
            .channel_spend(Some(channel.id.as_ref()))
            .await?
            .into_iter()
            .next();

        entries.push(json!({
            "channel_id": channel.id.as_ref(),
            "channel_name": channel.name,
            "today": state.cost.spend_today(&channel.id).await,
            "period": state.cost.spend_this_period(&channel.id).await,
            "total": state.cost.spend_total(&channel.id).await,
            "durable_calls": durable.as_ref().map(|d| d.total_calls).unwrap_or(0),
            "durable_cost": durable.as_ref().map(|d| d.total_cost).unwrap_or(0.0),
        }));
    }

    Ok(Json(json!({ "channels": entries })))
}
