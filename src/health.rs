//! Channel health tracking and cooldown circuit breaker
//!
//! Per-channel state machine: Healthy -> (eligible failures reach the
//! threshold) -> Cooling -> (marker TTL lapses) -> Healthy. The cooldown
//! marker lives in the coordination store so every gateway instance sees
//! it; recovery is lazy: the next `is_healthy` check after expiry clears
//! the marker and resets the failure counter, no background sweep.

use chrono::Utc;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;

use crate::channel::Channel;
use crate::store::CoordStore;

/// Statuses that indicate channel unhealthiness rather than a bad request.
/// Other 4xx are the caller's fault and must not penalize the channel.
pub fn is_cooldown_eligible(status: u16) -> bool {
    matches!(status, 401 | 408 | 429) || status >= 500
}

#[derive(Debug, Default, Clone)]
struct ChannelHealth {
    healthy: bool,
    consecutive_failures: u32,
    last_failure_at_ms: Option<i64>,
    last_used_at_ms: Option<i64>,
    success_count: u64,
    failure_count: u64,
    total_latency_ms: u64,
}

impl ChannelHealth {
    fn fresh() -> Self {
        Self {
            healthy: true,
            ..Default::default()
        }
    }

    fn success_rate(&self) -> f64 {
        let total = self.success_count + self.failure_count;
        if total == 0 {
            1.0
        } else {
            self.success_count as f64 / total as f64
        }
    }

    fn avg_latency_ms(&self) -> u64 {
        if self.success_count == 0 {
            0
        } else {
            self.total_latency_ms / self.success_count
        }
    }
}

/// Per-channel health snapshot for the stats surface
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub channel_id: String,
    pub channel_name: String,
    pub healthy: bool,
    pub consecutive_failures: u32,
    pub cooldown_remaining_seconds: u64,
    pub success_rate: f64,
    pub avg_latency_ms: u64,
}

pub struct HealthTracker {
    store: Arc<dyn CoordStore>,
    cooldown_seconds: u64,
    failure_threshold: u32,
    channels: DashMap<String, ChannelHealth>,
}

impl HealthTracker {
    pub fn new(store: Arc<dyn CoordStore>, cooldown_seconds: u64, failure_threshold: u32) -> Self {
        Self {
            store,
            cooldown_seconds,
            failure_threshold: failure_threshold.max(1),
            channels: DashMap::new(),
        }
    }

    fn cooldown_key(channel_id: &str, model: &str) -> String {
        format!("cooldown:{}:{}", channel_id, model)
    }

    /// Record a failed attempt. Writes the cooldown marker once the
    /// consecutive-failure count reaches the threshold, but only for
    /// eligible statuses. The counter update is atomic per channel.
    pub async fn record_failure(&self, channel_id: &str, model: &str, status: u16) {
        let failures = {
            let mut entry = self
                .channels
                .entry(channel_id.to_string())
                .or_insert_with(ChannelHealth::fresh);
            entry.consecutive_failures += 1;
            entry.failure_count += 1;
            entry.last_failure_at_ms = Some(Utc::now().timestamp_millis());
            entry.consecutive_failures
        };

        if !is_cooldown_eligible(status) {
            tracing::debug!(
                channel = channel_id,
                status = status,
                "Failure not cooldown-eligible"
            );
            return;
        }

        if failures < self.failure_threshold {
            tracing::debug!(
                channel = channel_id,
                failures = failures,
                threshold = self.failure_threshold,
                "Failure below cooldown threshold"
            );
            return;
        }

        let expires_at_ms =
            Utc::now().timestamp_millis() + (self.cooldown_seconds as i64) * 1000;
        let key = Self::cooldown_key(channel_id, model);
        if let Err(e) = self
            .store
            .set_ex(&key, &expires_at_ms.to_string(), self.cooldown_seconds)
            .await
        {
            tracing::warn!(channel = channel_id, error = %e, "Failed to write cooldown marker");
        }

        if let Some(mut entry) = self.channels.get_mut(channel_id) {
            entry.healthy = false;
        }

        tracing::warn!(
            channel = channel_id,
            model = model,
            status = status,
            cooldown_seconds = self.cooldown_seconds,
            "Channel entered cooldown"
        );
    }

    /// Record a successful attempt: failure counter resets, rolling
    /// success rate and latency update.
    pub async fn record_success(&self, channel_id: &str, latency_ms: u64) {
        let mut entry = self
            .channels
            .entry(channel_id.to_string())
            .or_insert_with(ChannelHealth::fresh);
        entry.healthy = true;
        entry.consecutive_failures = 0;
        entry.success_count += 1;
        entry.total_latency_ms += latency_ms;
        entry.last_used_at_ms = Some(Utc::now().timestamp_millis());
    }

    /// Is the channel eligible for selection for this model?
    ///
    /// A lapsed marker is cleared here and the failure counter zeroed
    /// (self-healing on read). Store errors assume healthy: a flaky
    /// coordination store must not take every channel out of rotation.
    pub async fn is_healthy(&self, channel_id: &str, model: &str) -> bool {
        let key = Self::cooldown_key(channel_id, model);
        let marker = match self.store.get(&key).await {
            Ok(marker) => marker,
            Err(e) => {
                tracing::warn!(channel = channel_id, error = %e, "Cooldown check failed, assuming healthy");
                return true;
            }
        };

        let Some(marker) = marker else {
            self.restore(channel_id).await;
            return true;
        };

        let expires_at_ms: i64 = marker.parse().unwrap_or(0);
        if Utc::now().timestamp_millis() > expires_at_ms {
            // TTL should have removed the key; clear it and recover anyway
            if let Err(e) = self.store.del(&key).await {
                tracing::warn!(channel = channel_id, error = %e, "Failed to clear lapsed cooldown");
            }
            self.restore(channel_id).await;
            return true;
        }

        false
    }

    async fn restore(&self, channel_id: &str) {
        if let Some(mut entry) = self.channels.get_mut(channel_id) {
            if !entry.healthy || entry.consecutive_failures > 0 {
                entry.healthy = true;
                entry.consecutive_failures = 0;
                tracing::info!(channel = channel_id, "Channel recovered from cooldown");
            }
        }
    }

    /// Remaining cooldown for (channel, model), zero when healthy
    pub async fn cooldown_remaining(&self, channel_id: &str, model: &str) -> u64 {
        let key = Self::cooldown_key(channel_id, model);
        match self.store.get(&key).await {
            Ok(Some(marker)) => {
                let expires_at_ms: i64 = marker.parse().unwrap_or(0);
                let remaining_ms = expires_at_ms - Utc::now().timestamp_millis();
                if remaining_ms > 0 {
                    (remaining_ms as u64).div_ceil(1000)
                } else {
                    0
                }
            }
            _ => 0,
        }
    }

    /// Snapshot for `/stats/health`; cooldown remaining is the maximum
    /// across the channel's supported models.
    pub async fn snapshot(&self, channels: &[Arc<Channel>]) -> Vec<HealthSnapshot> {
        let mut out = Vec::with_capacity(channels.len());
        for channel in channels {
            let mut cooldown_remaining = 0u64;
            for model in &channel.models {
                cooldown_remaining =
                    cooldown_remaining.max(self.cooldown_remaining(&channel.id, model).await);
            }

            let state = self
                .channels
                .get(channel.id.as_ref())
                .map(|e| e.clone())
                .unwrap_or_else(ChannelHealth::fresh);

            out.push(HealthSnapshot {
                channel_id: channel.id.to_string(),
                channel_name: channel.name.clone(),
                healthy: cooldown_remaining == 0,
                consecutive_failures: state.consecutive_failures,
                cooldown_remaining_seconds: cooldown_remaining,
                success_rate: state.success_rate(),
                avg_latency_ms: state.avg_latency_ms(),
            });
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::time::Duration;

    fn tracker_with(cooldown: u64) -> HealthTracker {
        HealthTracker::new(MemoryStore::shared(), cooldown, 1)
    }

    #[test]
    fn test_cooldown_eligibility() {
        for status in [401u16, 408, 429, 500, 502, 503, 504, 599] {
            assert!(is_cooldown_eligible(status), "{} should cool", status);
        }
        for status in [400u16, 403, 404, 409, 422] {
            assert!(!is_cooldown_eligible(status), "{} should not cool", status);
        }
    }

    #[tokio::test]
    async fn test_eligible_failure_sets_cooldown() {
        let tracker = tracker_with(60);
        tracker.record_failure("ch-1", "sora-1.0", 500).await;
        assert!(!tracker.is_healthy("ch-1", "sora-1.0").await);
        // Cooldown is per (channel, model)
        assert!(tracker.is_healthy("ch-1", "other-model").await);
    }

    #[tokio::test]
    async fn test_client_error_does_not_cool() {
        let tracker = tracker_with(60);
        tracker.record_failure("ch-1", "sora-1.0", 404).await;
        assert!(tracker.is_healthy("ch-1", "sora-1.0").await);
    }

    #[tokio::test]
    async fn test_self_heal_after_expiry() {
        let tracker = tracker_with(1);
        tracker.record_failure("ch-1", "sora-1.0", 500).await;
        assert!(!tracker.is_healthy("ch-1", "sora-1.0").await);

        tokio::time::sleep(Duration::from_millis(1100)).await;

        // Next check self-heals: healthy again, failure counter reset
        assert!(tracker.is_healthy("ch-1", "sora-1.0").await);
        let snap = tracker.snapshot(&[test_channel_arc("ch-1")]).await;
        assert_eq!(snap[0].consecutive_failures, 0);
        assert!(snap[0].healthy);
    }

    fn test_channel_arc(id: &str) -> Arc<Channel> {
        use crate::channel::{ChannelStatus, ProviderKind};
        Arc::new(Channel {
            id: Arc::from(id),
            tenant: "t1".to_string(),
            name: id.to_string(),
            provider: ProviderKind::Sora,
            base_url: "https://api.example.com".to_string(),
            api_key: "sk-test".to_string(),
            models: vec!["sora-1.0".to_string()],
            priority: 1,
            group: "default".to_string(),
            status: ChannelStatus::Active,
        })
    }

    #[tokio::test]
    async fn test_success_resets_failures() {
        let tracker = HealthTracker::new(MemoryStore::shared(), 60, 3);
        tracker.record_failure("ch-1", "m", 500).await;
        tracker.record_failure("ch-1", "m", 500).await;
        tracker.record_success("ch-1", 120).await;
        // Threshold 3 never reached; counter was reset by the success
        tracker.record_failure("ch-1", "m", 500).await;
        assert!(tracker.is_healthy("ch-1", "m").await);
    }

    #[tokio::test]
    async fn test_threshold_gates_cooldown() {
        let tracker = HealthTracker::new(MemoryStore::shared(), 60, 2);
        tracker.record_failure("ch-1", "m", 500).await;
        assert!(tracker.is_healthy("ch-1", "m").await);
        tracker.record_failure("ch-1", "m", 500).await;
        assert!(!tracker.is_healthy("ch-1", "m").await);
    }

    #[tokio::test]
    async fn test_cooldown_remaining_reported() {
        let tracker = tracker_with(60);
        tracker.record_failure("ch-1", "m", 429).await;
        let remaining = tracker.cooldown_remaining("ch-1", "m").await;
        assert!(remaining > 0 && remaining <= 60);
    }
}
