//! Upstream job polling
//!
//! Generation is asynchronous upstream: a submission returns a task id and
//! the gateway polls the status endpoint until the job goes terminal. Each
//! job is polled by exactly one gateway instance, guarded by a store lock
//! with a TTL; poll metadata and the poll counter also live in the store so
//! a restarted instance can pick up orphaned jobs via [`Poller::recover`].
//!
//! An upstream-reported failure gets one whole-job resubmission (budget
//! configurable) after a short grace period; a second failure is final.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::channel::ChannelRegistry;
use crate::config::PollerConfig;
use crate::db::GatewayDb;
use crate::dispatcher::Dispatcher;
use crate::providers::{make_adapter, GenerationRequest};
use crate::push::PushHub;
use crate::store::CoordStore;

const METADATA_TTL_SECONDS: u64 = 3_600;
const COUNT_TTL_SECONDS: u64 = 7_200;
const RESUBMIT_GRACE: Duration = Duration::from_secs(10);

/// Lifecycle state of an async generation job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Queued,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Processing => "processing",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        }
    }

    /// Upstream status strings vary by provider; unknown ones are treated
    /// as still in flight.
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "pending" | "queued" => JobState::Queued,
            "completed" | "succeeded" => JobState::Completed,
            "failed" | "error" => JobState::Failed,
            "cancelled" | "canceled" => JobState::Cancelled,
            _ => JobState::Processing,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Cancelled
        )
    }
}

/// Everything needed to resume polling a job, stored under `poll:{job_id}`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollJob {
    pub job_id: String,
    pub upstream_task_id: String,
    pub channel_id: String,
    pub tenant: String,
    pub user_id: String,
    pub group: String,
    pub request: GenerationRequest,
    /// Whole-job resubmissions already consumed
    #[serde(default)]
    pub resubmits: u32,
}

pub struct Poller {
    store: Arc<dyn CoordStore>,
    db: Arc<GatewayDb>,
    registry: Arc<ChannelRegistry>,
    dispatcher: Arc<Dispatcher>,
    push: Arc<PushHub>,
    config: PollerConfig,
    tasks: DashMap<String, JoinHandle<()>>,
}

fn lock_key(job_id: &str) -> String {
    format!("lock:poll:{}", job_id)
}

fn metadata_key(job_id: &str) -> String {
    format!("poll:{}", job_id)
}

fn count_key(job_id: &str) -> String {
    format!("poll:count:{}", job_id)
}

impl Poller {
    pub fn new(
        store: Arc<dyn CoordStore>,
        db: Arc<GatewayDb>,
        registry: Arc<ChannelRegistry>,
        dispatcher: Arc<Dispatcher>,
        push: Arc<PushHub>,
        config: PollerConfig,
    ) -> Self {
        Self {
            store,
            db,
            registry,
            dispatcher,
            push,
            config,
            tasks: DashMap::new(),
        }
    }

    /// Start polling `job` on this instance. Returns false when another
    /// instance already holds the poll lock.
    pub async fn start_polling(self: &Arc<Self>, job: PollJob) -> bool {
        let job_id = job.job_id.clone();

        if let Err(e) = self.persist_metadata(&job).await {
            tracing::warn!(job = %job_id, error = %e, "Failed to persist poll metadata");
        }

        let acquired = match self
            .store
            .set_nx_ex(
                &lock_key(&job_id),
                &chrono::Utc::now().timestamp_millis().to_string(),
                self.config.lock_ttl_seconds,
            )
            .await
        {
            Ok(acquired) => acquired,
            Err(e) => {
                tracing::warn!(job = %job_id, error = %e, "Poll lock acquisition failed, polling anyway");
                true
            }
        };

        if !acquired {
            tracing::debug!(job = %job_id, "Poll lock held elsewhere");
            return false;
        }

        let poller = Arc::clone(self);
        let handle = tokio::spawn(async move {
            poller.poll_loop(job).await;
        });
        self.tasks.insert(job_id, handle);
        true
    }

    async fn persist_metadata(&self, job: &PollJob) -> anyhow::Result<()> {
        let payload = serde_json::to_string(job)?;
        self.store
            .set_ex(&metadata_key(&job.job_id), &payload, METADATA_TTL_SECONDS)
            .await?;
        Ok(())
    }

    async fn poll_loop(self: Arc<Self>, mut job: PollJob) {
        let mut ticker =
            tokio::time::interval(Duration::from_secs(self.config.interval_seconds));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; skip it so the upstream has a
        // full interval before the first status query.
        ticker.tick().await;

        let status_timeout = Duration::from_secs(self.config.status_timeout_seconds);
        let mut local_count: i64 = 0;
        let mut query_failures: u32 = 0;

        loop {
            ticker.tick().await;

            let polls = match self
                .store
                .incr_i64(&count_key(&job.job_id), 1, Some(COUNT_TTL_SECONDS))
                .await
            {
                Ok(n) => n,
                Err(e) => {
                    tracing::warn!(job = %job.job_id, error = %e, "Poll counter bump failed");
                    local_count += 1;
                    local_count
                }
            };

            if polls > i64::from(self.config.max_polls) {
                self.finish_failed(&job, "polling timed out", Some("poll_timeout"))
                    .await;
                break;
            }

            let Some(channel) = self.registry.get(&job.channel_id) else {
                self.finish_failed(&job, "channel no longer configured", Some("channel_gone"))
                    .await;
                break;
            };

            let adapter = make_adapter(channel);
            let raw = match adapter
                .query_status(self.dispatcher.client(), &job.upstream_task_id, status_timeout)
                .await
            {
                Ok(raw) => raw,
                Err(e) => {
                    // Transient transport problem; keep the job alive but
                    // let subscribers know it is still being watched.
                    query_failures += 1;
                    tracing::warn!(
                        job = %job.job_id,
                        failures = query_failures,
                        error = %e,
                        "Status query failed"
                    );
                    if query_failures % 5 == 0 {
                        self.push.push(
                            &job.user_id,
                            "job.update",
                            &json!({
                                "job_id": job.job_id,
                                "status": JobState::Processing.as_str(),
                                "stalled": true,
                            }),
                        );
                    }
                    continue;
                }
            };
            query_failures = 0;

            if raw.is_error() {
                let message = raw.error_message();
                if job.resubmits < self.config.max_job_retries {
                    tracing::warn!(
                        job = %job.job_id,
                        error = %message,
                        "Upstream reported failure, resubmitting job"
                    );
                    if self.resubmit(&mut job).await {
                        continue;
                    }
                }
                self.finish_failed(&job, &message, raw.error_code().as_deref())
                    .await;
                break;
            }

            let response = adapter.convert_response(&raw.body);
            let state = JobState::parse(&response.status);
            let progress = response.progress.unwrap_or(0);

            if let Err(e) = self
                .db
                .update_job_status(
                    &job.job_id,
                    state,
                    progress,
                    response.video_url.as_deref(),
                    response.image_url.as_deref(),
                    None,
                    None,
                )
                .await
            {
                tracing::error!(job = %job.job_id, error = %e, "Job status write failed");
            }

            match state {
                JobState::Completed => {
                    tracing::info!(job = %job.job_id, polls = polls, "Job completed");
                    self.push.push(
                        &job.user_id,
                        "job.completed",
                        &json!({
                            "job_id": job.job_id,
                            "status": state.as_str(),
                            "video_url": response.video_url,
                            "image_url": response.image_url,
                        }),
                    );
                    self.cleanup(&job.job_id).await;
                    break;
                }
                JobState::Cancelled => {
                    tracing::info!(job = %job.job_id, "Job cancelled upstream");
                    self.push.push(
                        &job.user_id,
                        "job.cancelled",
                        &json!({"job_id": job.job_id, "status": state.as_str()}),
                    );
                    self.cleanup(&job.job_id).await;
                    break;
                }
                // Failed is handled above through the error shape; a bare
                // failed status without an error body lands here.
                JobState::Failed => {
                    self.finish_failed(&job, "upstream reported failure", None)
                        .await;
                    break;
                }
                JobState::Queued | JobState::Processing => {
                    self.push.push(
                        &job.user_id,
                        "job.update",
                        &json!({
                            "job_id": job.job_id,
                            "status": state.as_str(),
                            "progress": progress,
                        }),
                    );
                }
            }
        }

        self.tasks.remove(&job.job_id);
    }

    /// One whole-job retry: give the upstream a grace period, then relay
    /// the original request again and repoint the job at the new task.
    async fn resubmit(&self, job: &mut PollJob) -> bool {
        tokio::time::sleep(RESUBMIT_GRACE).await;

        let outcome = match self
            .dispatcher
            .relay(&job.job_id, &job.tenant, &job.user_id, &job.group, &job.request)
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::warn!(job = %job.job_id, error = %e, "Job resubmission failed");
                return false;
            }
        };

        job.upstream_task_id = outcome.response.task_id.clone();
        job.channel_id = outcome.channel_id.clone();
        job.resubmits += 1;

        if let Err(e) = self
            .db
            .update_job_upstream_id(&job.job_id, &job.upstream_task_id)
            .await
        {
            tracing::error!(job = %job.job_id, error = %e, "Job upstream id write failed");
        }
        if let Err(e) = self.persist_metadata(job).await {
            tracing::warn!(job = %job.job_id, error = %e, "Poll metadata refresh failed");
        }
        // The new task starts its poll budget from zero, and gets a fresh
        // lock lease so the extended lifetime cannot outlive the lock and
        // let another instance double-poll it.
        if let Err(e) = self.store.del(&count_key(&job.job_id)).await {
            tracing::warn!(job = %job.job_id, error = %e, "Poll counter reset failed");
        }
        if let Err(e) = self
            .store
            .set_ex(
                &lock_key(&job.job_id),
                &chrono::Utc::now().timestamp_millis().to_string(),
                self.config.lock_ttl_seconds,
            )
            .await
        {
            tracing::warn!(job = %job.job_id, error = %e, "Poll lock refresh failed");
        }

        self.push.push(
            &job.user_id,
            "job.update",
            &json!({
                "job_id": job.job_id,
                "status": JobState::Processing.as_str(),
                "progress": 0,
                "resubmitted": true,
            }),
        );

        tracing::info!(
            job = %job.job_id,
            channel = %job.channel_id,
            task = %job.upstream_task_id,
            "Job resubmitted"
        );
        true
    }

    async fn finish_failed(&self, job: &PollJob, message: &str, code: Option<&str>) {
        tracing::warn!(job = %job.job_id, error = message, "Job failed");

        if let Err(e) = self
            .db
            .update_job_status(&job.job_id, JobState::Failed, 0, None, None, Some(message), code)
            .await
        {
            tracing::error!(job = %job.job_id, error = %e, "Job failure write failed");
        }

        self.push.push(
            &job.user_id,
            "job.failed",
            &json!({
                "job_id": job.job_id,
                "status": JobState::Failed.as_str(),
                "error": message,
            }),
        );
        self.cleanup(&job.job_id).await;
    }

    /// Stop polling and mark the job cancelled. Idempotent.
    pub async fn cancel(&self, job_id: &str, user_id: &str) {
        if let Some((_, handle)) = self.tasks.remove(job_id) {
            handle.abort();
        }

        if let Err(e) = self
            .db
            .update_job_status(job_id, JobState::Cancelled, 0, None, None, None, None)
            .await
        {
            tracing::error!(job = job_id, error = %e, "Job cancel write failed");
        }

        self.push.push(
            user_id,
            "job.cancelled",
            &json!({"job_id": job_id, "status": JobState::Cancelled.as_str()}),
        );
        self.cleanup(job_id).await;
        tracing::info!(job = job_id, "Job cancelled");
    }

    async fn cleanup(&self, job_id: &str) {
        for key in [lock_key(job_id), metadata_key(job_id), count_key(job_id)] {
            if let Err(e) = self.store.del(&key).await {
                tracing::warn!(key = %key, error = %e, "Poll key cleanup failed");
            }
        }
    }

    /// Resume polling for jobs whose metadata survived a restart but whose
    /// lock holder is gone. Returns how many jobs were picked up.
    pub async fn recover(self: &Arc<Self>) -> usize {
        let keys = match self.store.scan_prefix("poll:").await {
            Ok(keys) => keys,
            Err(e) => {
                tracing::error!(error = %e, "Poll recovery scan failed");
                return 0;
            }
        };

        let mut resumed = 0;
        for key in keys {
            // Counter keys share the prefix
            if key.starts_with("poll:count:") {
                continue;
            }
            let job_id = &key["poll:".len()..];

            match self.store.exists(&lock_key(job_id)).await {
                Ok(true) => continue, // someone is polling it
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(job = job_id, error = %e, "Lock check failed during recovery");
                    continue;
                }
            }

            let payload = match self.store.get(&key).await {
                Ok(Some(payload)) => payload,
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!(job = job_id, error = %e, "Poll metadata read failed");
                    continue;
                }
            };

            let job: PollJob = match serde_json::from_str(&payload) {
                Ok(job) => job,
                Err(e) => {
                    tracing::warn!(job = job_id, error = %e, "Corrupt poll metadata, dropping");
                    let _ = self.store.del(&key).await;
                    continue;
                }
            };

            if self.start_polling(job).await {
                resumed += 1;
            }
        }

        if resumed > 0 {
            tracing::info!(jobs = resumed, "Resumed polling after restart");
        }
        resumed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_parse_and_terminality() {
        assert_eq!(JobState::parse("pending"), JobState::Queued);
        assert_eq!(JobState::parse("queued"), JobState::Queued);
        assert_eq!(JobState::parse("in_progress"), JobState::Processing);
        assert_eq!(JobState::parse("Completed"), JobState::Completed);
        assert_eq!(JobState::parse("succeeded"), JobState::Completed);
        assert_eq!(JobState::parse("canceled"), JobState::Cancelled);
        assert_eq!(JobState::parse("something-new"), JobState::Processing);

        assert!(!JobState::Queued.is_terminal());
        assert!(!JobState::Processing.is_terminal());
        assert!(JobState::Completed.is_terminal());
        assert!(JobState::Failed.is_terminal());
        assert!(JobState::Cancelled.is_terminal());
    }

    #[test]
    fn test_state_roundtrips_through_as_str() {
        for state in [
            JobState::Queued,
            JobState::Processing,
            JobState::Completed,
            JobState::Failed,
            JobState::Cancelled,
        ] {
            assert_eq!(JobState::parse(state.as_str()), state);
        }
    }

    #[test]
    fn test_poll_metadata_roundtrip_tolerates_missing_resubmits() {
        // Metadata written before the resubmit counter existed
        let job: PollJob = serde_json::from_str(
            r#"{"job_id":"j1","upstream_task_id":"t1","channel_id":"ch-1",
                "tenant":"t1","user_id":"u1","group":"default",
                "request":{"prompt":"a fox","model":"sora-1.0"}}"#,
        )
        .unwrap();
        assert_eq!(job.resubmits, 0);
        assert_eq!(job.request.model, "sora-1.0");
    }
}
