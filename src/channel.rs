//! Channel registry and selection
//!
//! A channel is one configured upstream generation endpoint. Selection
//! walks priority tiers (lower number = preferred), filters channels that
//! are cooling down for the requested model, then picks within the tier by
//! weighted random with `weight = max(1, 100 - priority)`.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::config::ChannelConfig;
use crate::health::HealthTracker;

/// Closed set of supported upstream families
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Sora,
    OpenAi,
    Custom,
}

impl ProviderKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "sora" => Some(Self::Sora),
            "openai" | "azure" => Some(Self::OpenAi),
            "custom" => Some(Self::Custom),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sora => "sora",
            Self::OpenAi => "openai",
            Self::Custom => "custom",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelStatus {
    Active,
    Disabled,
}

/// One configured upstream endpoint. Immutable after load; running totals
/// and the health snapshot live in the cost tracker and health tracker.
#[derive(Debug, Clone)]
pub struct Channel {
    pub id: Arc<str>,
    pub tenant: String,
    pub name: String,
    pub provider: ProviderKind,
    pub base_url: String,
    pub api_key: String,
    pub models: Vec<String>,
    pub priority: u32,
    pub group: String,
    pub status: ChannelStatus,
}

impl Channel {
    pub fn from_config(cfg: &ChannelConfig) -> Option<Self> {
        Some(Self {
            id: Arc::from(cfg.id.as_str()),
            tenant: cfg.tenant.clone(),
            name: cfg.name.clone(),
            provider: ProviderKind::parse(&cfg.provider)?,
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            api_key: cfg.api_key.clone(),
            models: cfg.models.clone(),
            priority: cfg.priority,
            group: cfg.group.clone(),
            status: if cfg.enabled {
                ChannelStatus::Active
            } else {
                ChannelStatus::Disabled
            },
        })
    }

    pub fn supports_model(&self, model: &str) -> bool {
        self.models.iter().any(|m| m == model)
    }

    /// Selection weight: lower priority number means higher weight
    pub fn weight(&self) -> u32 {
        100u32.saturating_sub(self.priority).max(1)
    }
}

/// Registry of configured channels (immutable, Arc-shared)
pub struct ChannelRegistry {
    channels: Arc<Vec<Arc<Channel>>>,
}

impl ChannelRegistry {
    pub fn new(configs: &[ChannelConfig]) -> Self {
        let channels = configs
            .iter()
            .filter_map(Channel::from_config)
            .map(Arc::new)
            .collect();
        Self {
            channels: Arc::new(channels),
        }
    }

    pub fn from_channels(channels: Vec<Channel>) -> Self {
        Self {
            channels: Arc::new(channels.into_iter().map(Arc::new).collect()),
        }
    }

    pub fn get(&self, channel_id: &str) -> Option<Arc<Channel>> {
        self.channels
            .iter()
            .find(|c| c.id.as_ref() == channel_id)
            .cloned()
    }

    pub fn all(&self, tenant: &str) -> Vec<Arc<Channel>> {
        self.channels
            .iter()
            .filter(|c| c.tenant == tenant)
            .cloned()
            .collect()
    }

    /// Select a channel for (tenant, model, group).
    ///
    /// Side-effect free and safe to call from many in-flight requests;
    /// only the health tracker is consulted (read + lazy cooldown cleanup).
    pub async fn select(
        &self,
        health: &HealthTracker,
        tenant: &str,
        model: &str,
        group: &str,
    ) -> Option<Arc<Channel>> {
        // Partition matching channels into priority tiers
        let mut tiers: BTreeMap<u32, Vec<&Arc<Channel>>> = BTreeMap::new();
        for channel in self.channels.iter() {
            if channel.status != ChannelStatus::Active
                || channel.tenant != tenant
                || channel.group != group
                || !channel.supports_model(model)
            {
                continue;
            }
            tiers.entry(channel.priority).or_default().push(channel);
        }

        // Most-preferred tier first; fall through tiers emptied by cooldowns
        for (priority, tier) in tiers {
            let mut eligible = Vec::with_capacity(tier.len());
            for channel in tier {
                if health.is_healthy(&channel.id, model).await {
                    eligible.push(channel);
                } else {
                    tracing::debug!(
                        channel = %channel.name,
                        model = model,
                        "Skipping channel in cooldown"
                    );
                }
            }

            if let Some(selected) = weighted_pick(&eligible) {
                tracing::debug!(
                    channel = %selected.name,
                    priority = priority,
                    "Selected channel"
                );
                return Some(Arc::clone(selected));
            }
        }

        tracing::warn!(tenant = tenant, model = model, "No eligible channel");
        None
    }
}

/// Weighted random pick; uniform among equal weights by construction
fn weighted_pick<'a>(channels: &'a [&'a Arc<Channel>]) -> Option<&'a Arc<Channel>> {
    match channels.len() {
        0 => return None,
        1 => return Some(channels[0]),
        _ => {}
    }

    let total_weight: u64 = channels.iter().map(|c| c.weight() as u64).sum();
    let mut choice = rand::thread_rng().gen_range(0..total_weight) as i64;
    for channel in channels {
        choice -= channel.weight() as i64;
        if choice < 0 {
            return Some(channel);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::collections::HashMap;

    pub(crate) fn test_channel(id: &str, priority: u32, models: &[&str]) -> Channel {
        Channel {
            id: Arc::from(id),
            tenant: "t1".to_string(),
            name: id.to_string(),
            provider: ProviderKind::Sora,
            base_url: "https://api.example.com".to_string(),
            api_key: "sk-test".to_string(),
            models: models.iter().map(|m| m.to_string()).collect(),
            priority,
            group: "default".to_string(),
            status: ChannelStatus::Active,
        }
    }

    fn tracker() -> HealthTracker {
        HealthTracker::new(MemoryStore::shared(), 60, 1)
    }

    #[tokio::test]
    async fn test_prefers_lower_priority_tier() {
        let registry = ChannelRegistry::from_channels(vec![
            test_channel("backup", 2, &["sora-1.0"]),
            test_channel("primary", 1, &["sora-1.0"]),
        ]);
        let health = tracker();

        for _ in 0..20 {
            let selected = registry
                .select(&health, "t1", "sora-1.0", "default")
                .await
                .unwrap();
            assert_eq!(selected.id.as_ref(), "primary");
        }
    }

    #[tokio::test]
    async fn test_model_and_group_filtering() {
        let registry = ChannelRegistry::from_channels(vec![
            test_channel("video", 1, &["sora-1.0"]),
            test_channel("image", 1, &["dall-e-3"]),
        ]);
        let health = tracker();

        let selected = registry
            .select(&health, "t1", "dall-e-3", "default")
            .await
            .unwrap();
        assert_eq!(selected.id.as_ref(), "image");

        assert!(registry
            .select(&health, "t1", "gpt-4", "default")
            .await
            .is_none());
        assert!(registry
            .select(&health, "t1", "sora-1.0", "other-group")
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_falls_through_cooled_tier() {
        let registry = ChannelRegistry::from_channels(vec![
            test_channel("primary", 1, &["sora-1.0"]),
            test_channel("backup", 2, &["sora-1.0"]),
        ]);
        let health = tracker();

        health.record_failure("primary", "sora-1.0", 500).await;

        let selected = registry
            .select(&health, "t1", "sora-1.0", "default")
            .await
            .unwrap();
        assert_eq!(selected.id.as_ref(), "backup");
    }

    #[tokio::test]
    async fn test_all_tiers_exhausted_returns_none() {
        let registry = ChannelRegistry::from_channels(vec![
            test_channel("a", 1, &["sora-1.0"]),
            test_channel("b", 2, &["sora-1.0"]),
        ]);
        let health = tracker();

        health.record_failure("a", "sora-1.0", 500).await;
        health.record_failure("b", "sora-1.0", 503).await;

        assert!(registry
            .select(&health, "t1", "sora-1.0", "default")
            .await
            .is_none());
    }

    #[test]
    fn test_weighted_pick_follows_weight_share() {
        // weight(10) = 90, weight(40) = 60: expect a 60/40 split
        let heavy = Arc::new(test_channel("heavy", 10, &["sora-1.0"]));
        let light = Arc::new(test_channel("light", 40, &["sora-1.0"]));
        let candidates = vec![&heavy, &light];

        let mut counts: HashMap<String, u32> = HashMap::new();
        let rounds = 20_000;
        for _ in 0..rounds {
            let picked = weighted_pick(&candidates).unwrap();
            *counts.entry(picked.id.to_string()).or_default() += 1;
        }

        let heavy_share = *counts.get("heavy").unwrap() as f64 / rounds as f64;
        assert!(
            (heavy_share - 0.6).abs() < 0.03,
            "heavy share {} out of tolerance",
            heavy_share
        );
    }

    #[tokio::test]
    async fn test_uniform_tier_is_uniform() {
        // Equal priority means equal weight, selection approaches 50/50
        let registry = ChannelRegistry::from_channels(vec![
            test_channel("a", 1, &["sora-1.0"]),
            test_channel("b", 1, &["sora-1.0"]),
        ]);
        let health = tracker();

        let mut counts: HashMap<String, u32> = HashMap::new();
        let rounds = 10_000;
        for _ in 0..rounds {
            let selected = registry
                .select(&health, "t1", "sora-1.0", "default")
                .await
                .unwrap();
            *counts.entry(selected.id.to_string()).or_default() += 1;
        }

        let a_share = *counts.get("a").unwrap() as f64 / rounds as f64;
        assert!((a_share - 0.5).abs() < 0.05, "a share {}", a_share);
    }

    #[test]
    fn test_weight_floor() {
        let ch = test_channel("x", 150, &["m"]);
        assert_eq!(ch.weight(), 1);
    }

    #[test]
    fn test_provider_kind_parse() {
        assert_eq!(ProviderKind::parse("sora"), Some(ProviderKind::Sora));
        assert_eq!(ProviderKind::parse("azure"), Some(ProviderKind::OpenAi));
        assert_eq!(ProviderKind::parse("replicate"), None);
    }
}
