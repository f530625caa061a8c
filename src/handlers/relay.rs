//! Generation submission and job endpoints

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::{Extension, Json};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::auth::AuthContext;
use crate::db::JobRecord;
use crate::error::AppError;
use crate::poller::{JobState, PollJob};
use crate::providers::GenerationRequest;
use crate::server::AppState;

#[derive(Debug, Deserialize)]
pub struct GenerateBody {
    pub prompt: String,
    pub model: String,
    pub size: Option<String>,
    pub duration: Option<u32>,
    pub aspect_ratio: Option<String>,
    pub reference_image: Option<String>,
    /// Channel group to draw from; "default" when omitted
    pub group: Option<String>,
    /// End-user identity for push events; the key name when omitted
    pub user_id: Option<String>,
    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

/// POST /relay/generate
///
/// Submits upstream through a selected channel, persists the job record
/// and starts the poll loop. Responds 202: the result arrives later via
/// polling or the push stream.
pub async fn generate(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Json(body): Json<GenerateBody>,
) -> Result<impl IntoResponse, AppError> {
    if body.prompt.trim().is_empty() {
        return Err(AppError::InvalidRequest("prompt must not be empty".to_string()));
    }
    if body.model.trim().is_empty() {
        return Err(AppError::InvalidRequest("model must not be empty".to_string()));
    }

    let job_id = Uuid::new_v4().to_string();
    let user_id = body.user_id.clone().unwrap_or_else(|| auth.key_name.clone());
    let group = body.group.clone().unwrap_or_else(|| "default".to_string());

    let request = GenerationRequest {
        prompt: body.prompt,
        model: body.model,
        size: body.size,
        duration: body.duration,
        aspect_ratio: body.aspect_ratio,
        reference_image: body.reference_image,
        extra: body.extra,
    };

    let outcome = state
        .dispatcher
        .relay(&job_id, &auth.tenant, &user_id, &group, &request)
        .await?;

    let status = JobState::parse(&outcome.response.status);
    let job = JobRecord {
        job_id: job_id.clone(),
        upstream_task_id: outcome.response.task_id.clone(),
        tenant: auth.tenant.clone(),
        user_id: user_id.clone(),
        channel_id: outcome.channel_id.clone(),
        model: request.model.clone(),
        prompt: request.prompt.clone(),
        status,
        progress: outcome.response.progress.unwrap_or(0),
        video_url: outcome.response.video_url.clone(),
        image_url: outcome.response.image_url.clone(),
        error_message: None,
        error_code: None,
        created_at: Utc::now(),
        completed_at: None,
    };
    state.db.insert_job(&job).await?;

    if !status.is_terminal() {
        state
            .poller
            .start_polling(PollJob {
                job_id: job_id.clone(),
                upstream_task_id: outcome.response.task_id.clone(),
                channel_id: outcome.channel_id.clone(),
                tenant: auth.tenant.clone(),
                user_id: user_id.clone(),
                group,
                request,
                resubmits: 0,
            })
            .await;
    }

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "job_id": job_id,
            "task_id": outcome.response.task_id,
            "status": status.as_str(),
            "progress": outcome.response.progress.unwrap_or(0),
            "channel": {
                "id": outcome.channel_id,
                "name": outcome.channel_name,
            },
            "attempts": outcome.attempts,
            "cost": outcome.cost,
        })),
    ))
}

/// GET /relay/jobs/{job_id}
pub async fn get_job(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path(job_id): Path<String>,
) -> Result<Json<JobRecord>, AppError> {
    let job = fetch_tenant_job(&state, &auth, &job_id).await?;
    Ok(Json(job))
}

/// POST /relay/jobs/{job_id}/cancel
///
/// Cancelling a job that already went terminal is a no-op: the record
/// comes back unchanged.
pub async fn cancel_job(
    State(state): State<Arc<AppState>>,
    Extension(auth): Extension<AuthContext>,
    Path(job_id): Path<String>,
) -> Result<Json<JobRecord>, AppError> {
    let job = fetch_tenant_job(&state, &auth, &job_id).await?;

    if job.status.is_terminal() {
        return Ok(Json(job));
    }

    state.poller.cancel(&job_id, &job.user_id).await;

    let job = fetch_tenant_job(&state, &auth, &job_id).await?;
    Ok(Json(job))
}

/// Jobs are tenant-scoped; a foreign job id reads as absent
async fn fetch_tenant_job(
    state: &AppState,
    auth: &AuthContext,
    job_id: &str,
) -> Result<JobRecord, AppError> {
    state
        .db
        .get_job(job_id)
        .await?
        .filter(|job| job.tenant == auth.tenant)
        .ok_or_else(|| AppError::NotFound(format!("job '{}' not found", job_id)))
}
