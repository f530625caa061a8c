//! Job event stream (SSE)
//!
//! EventSource clients cannot set headers, so the API key arrives as a
//! `token` query parameter. The first frame is an `: ok` comment so the
//! client knows the subscription is live before any job event fires.

use axum::extract::{Query, State};
use axum::response::sse::{Event, Sse};
use futures::stream::Stream;
use futures::StreamExt;
use serde::Deserialize;
use std::convert::Infallible;
use std::sync::Arc;

use crate::error::AppError;
use crate::push::PushHub;
use crate::server::AppState;

#[derive(Debug, Deserialize)]
pub struct StreamParams {
    pub token: String,
    /// Identity to subscribe as; the key name when omitted
    pub user_id: Option<String>,
}

/// Removes the session on every disconnect path, including client aborts
/// that drop the response stream mid-flight.
struct SessionGuard {
    hub: Arc<PushHub>,
    session_id: String,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.hub.remove_connection(&self.session_id);
    }
}

/// GET /jobs/stream?token=...
pub async fn stream(
    State(state): State<Arc<AppState>>,
    Query(params): Query<StreamParams>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
    let auth = state
        .auth
        .verify(&params.token)
        .ok_or_else(|| AppError::Unauthorized("invalid stream token".to_string()))?;
    let user_id = params.user_id.unwrap_or_else(|| auth.key_name.clone());

    let (session_id, receiver) = state.push.add_connection(&user_id);
    let guard = SessionGuard {
        hub: Arc::clone(&state.push),
        session_id,
    };

    tracing::info!(user = %user_id, "Job stream opened");

    let ack = futures::stream::once(async { Ok(Event::default().comment("ok")) });
    let events = futures::stream::unfold((receiver, guard), |(mut receiver, guard)| async move {
        receiver
            .recv()
            .await
            .map(|event| (Ok(event), (receiver, guard)))
    });

    Ok(Sse::new(ack.chain(events)))
}
