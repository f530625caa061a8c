//! Cost calculation and spend tracking
//!
//! Cost math uses a per-model price table (per 1,000 units, separate
//! prompt/completion rates). Spend tracking has two paths: fast counters
//! in the coordination store (read by the stats surface and quota logic),
//! and a detached durable write that bumps the channel's persisted totals
//! and appends one ledger row. The durable path is never awaited by the
//! request path; its failures are logged and dropped.

use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::db::{GatewayDb, LedgerEntry};
use crate::store::CoordStore;

const TTL_TODAY_SECONDS: u64 = 86_400;
const TTL_PERIOD_SECONDS: u64 = 2_592_000; // 30 days

/// (prompt, completion) price per 1,000 units
fn model_pricing(model: &str) -> (f64, f64) {
    match model {
        "gpt-4" => (0.03, 0.06),
        "gpt-4-turbo" => (0.01, 0.03),
        "gpt-4o" => (0.005, 0.015),
        "gpt-3.5-turbo" => (0.0005, 0.0015),
        "claude-3-opus" => (0.015, 0.075),
        "claude-3-sonnet" => (0.003, 0.015),
        // Video generation bills prompt units only
        "sora_video2" | "sora-1.0" => (0.1, 0.0),
        _ => (0.001, 0.002),
    }
}

/// Cost of one request. Unknown models use the default rate.
pub fn calculate_cost(model: &str, prompt_units: u64, completion_units: u64) -> f64 {
    let (prompt_rate, completion_rate) = model_pricing(model);
    let prompt_cost = (prompt_units as f64 / 1000.0) * prompt_rate;
    let completion_cost = (completion_units as f64 / 1000.0) * completion_rate;
    prompt_cost + completion_cost
}

/// Everything one completed attempt contributes to the ledger
#[derive(Debug, Clone)]
pub struct CostEvent {
    pub request_id: String,
    pub channel_id: String,
    pub user_id: String,
    pub model: String,
    pub prompt_units: u64,
    pub completion_units: u64,
    pub cost: f64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub success: bool,
    pub http_status: Option<u16>,
    pub error_message: Option<String>,
}

pub struct CostTracker {
    store: Arc<dyn CoordStore>,
    db: Arc<GatewayDb>,
}

impl CostTracker {
    pub fn new(store: Arc<dyn CoordStore>, db: Arc<GatewayDb>) -> Self {
        Self { store, db }
    }

    /// Record one attempt's cost.
    ///
    /// The fast counters are written inline (store failures are logged,
    /// not propagated); the durable write is a detached task the caller
    /// can never observe failing.
    pub async fn track_cost(&self, event: CostEvent) {
        let channel_id = event.channel_id.clone();

        if event.cost > 0.0 {
            let today_key = format!("spend:today:{}", channel_id);
            let period_key = format!("spend:period:{}", channel_id);
            let total_key = format!("spend:total:{}", channel_id);

            for (key, ttl) in [
                (today_key, Some(TTL_TODAY_SECONDS)),
                (period_key, Some(TTL_PERIOD_SECONDS)),
                (total_key, None),
            ] {
                if let Err(e) = self.store.incr_f64(&key, event.cost, ttl).await {
                    tracing::warn!(key = %key, error = %e, "Fast-path spend write dropped");
                }
            }
        }

        // Durable path: fire and forget
        let db = Arc::clone(&self.db);
        tokio::spawn(async move {
            let latency_ms = (event.finished_at - event.started_at)
                .num_milliseconds()
                .max(0);
            let entry = LedgerEntry {
                request_id: event.request_id.clone(),
                channel_id: event.channel_id.clone(),
                user_id: event.user_id,
                model: event.model,
                prompt_units: event.prompt_units,
                completion_units: event.completion_units,
                total_units: event.prompt_units + event.completion_units,
                cost: event.cost,
                started_at: event.started_at,
                finished_at: event.finished_at,
                latency_ms,
                status: if event.success { "success" } else { "error" }.to_string(),
                http_status: event.http_status,
                error_message: event.error_message,
            };

            if event.success {
                if let Err(e) = db.increment_channel_totals(&event.channel_id, event.cost).await {
                    tracing::error!(
                        channel = %event.channel_id,
                        error = %e,
                        "Durable channel-total update failed"
                    );
                }
            }
            if let Err(e) = db.insert_ledger_entry(&entry).await {
                tracing::error!(
                    request_id = %entry.request_id,
                    error = %e,
                    "Durable ledger append failed"
                );
            }
        });
    }

    pub async fn spend_today(&self, channel_id: &str) -> f64 {
        self.read_counter(&format!("spend:today:{}", channel_id)).await
    }

    pub async fn spend_this_period(&self, channel_id: &str) -> f64 {
        self.read_counter(&format!("spend:period:{}", channel_id)).await
    }

    pub async fn spend_total(&self, channel_id: &str) -> f64 {
        self.read_counter(&format!("spend:total:{}", channel_id)).await
    }

    async fn read_counter(&self, key: &str) -> f64 {
        match self.store.get(key).await {
            Ok(Some(value)) => value.parse().unwrap_or(0.0),
            Ok(None) => 0.0,
            Err(e) => {
                tracing::warn!(key = key, error = %e, "Spend counter read failed");
                0.0
            }
        }
    }

    /// Clear all today's-spend counters (midnight boundary task)
    pub async fn reset_daily_spend(&self) {
        match self.store.scan_prefix("spend:today:").await {
            Ok(keys) => {
                let count = keys.len();
                for key in keys {
                    if let Err(e) = self.store.del(&key).await {
                        tracing::warn!(key = %key, error = %e, "Daily spend reset failed for key");
                    }
                }
                tracing::info!(channels = count, "Daily spend counters reset");
            }
            Err(e) => {
                tracing::error!(error = %e, "Daily spend reset scan failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[test]
    fn test_gpt4_reference_cost() {
        // 1000 prompt + 1000 completion at 0.03/0.06 per 1K
        let cost = calculate_cost("gpt-4", 1000, 1000);
        assert!((cost - 0.09).abs() < 1e-9);
    }

    #[test]
    fn test_unknown_model_uses_default_rate() {
        let cost = calculate_cost("some-unknown-model", 1000, 1000);
        assert!((cost - 0.003).abs() < 1e-9);
    }

    #[test]
    fn test_video_model_bills_prompt_only() {
        let cost = calculate_cost("sora-1.0", 2000, 500);
        assert!((cost - 0.2).abs() < 1e-9);
    }

    async fn tracker() -> CostTracker {
        let db = Arc::new(GatewayDb::new("sqlite::memory:").await.unwrap());
        CostTracker::new(MemoryStore::shared(), db)
    }

    fn event(channel: &str, cost: f64) -> CostEvent {
        let now = Utc::now();
        CostEvent {
            request_id: "req-1".to_string(),
            channel_id: channel.to_string(),
            user_id: "u1".to_string(),
            model: "sora-1.0".to_string(),
            prompt_units: 1000,
            completion_units: 0,
            cost,
            started_at: now,
            finished_at: now,
            success: true,
            http_status: Some(200),
            error_message: None,
        }
    }

    #[tokio::test]
    async fn test_fast_counters_accumulate() {
        let tracker = tracker().await;
        tracker.track_cost(event("ch-1", 0.10)).await;
        tracker.track_cost(event("ch-1", 0.05)).await;

        assert!((tracker.spend_today("ch-1").await - 0.15).abs() < 1e-9);
        assert!((tracker.spend_this_period("ch-1").await - 0.15).abs() < 1e-9);
        assert!((tracker.spend_total("ch-1").await - 0.15).abs() < 1e-9);
        assert_eq!(tracker.spend_today("ch-other").await, 0.0);
    }

    #[tokio::test]
    async fn test_daily_reset_clears_only_today() {
        let tracker = tracker().await;
        tracker.track_cost(event("ch-1", 0.10)).await;
        tracker.reset_daily_spend().await;

        assert_eq!(tracker.spend_today("ch-1").await, 0.0);
        assert!((tracker.spend_total("ch-1").await - 0.10).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_zero_cost_failure_skips_counters() {
        let tracker = tracker().await;
        let mut failed = event("ch-1", 0.0);
        failed.success = false;
        failed.http_status = Some(500);
        tracker.track_cost(failed).await;

        assert_eq!(tracker.spend_today("ch-1").await, 0.0);
    }
}
