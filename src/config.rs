use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub server: ServerConfig,
    pub store: StoreConfig,
    pub database: DatabaseConfig,
    pub relay: RelayConfig,
    pub poller: PollerConfig,
    pub rate_limits: RateLimitsConfig,
    pub api_keys: Vec<ApiKeyConfig>,
    pub channels: Vec<ChannelConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub log_format: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StoreConfig {
    /// redis:// connection string; empty selects the in-process store
    #[serde(default)]
    pub redis_url: String,
    /// Key namespace prefix shared by all gateway instances
    #[serde(default = "default_namespace")]
    pub namespace: String,
}

fn default_namespace() -> String {
    "relay".to_string()
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    /// SQLite path, e.g. "sqlite:./data/gateway.db"
    pub url: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RelayConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_cooldown_seconds")]
    pub cooldown_seconds: u64,
    /// Consecutive eligible failures before a channel is cooled down
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Upstream submission timeout
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_cooldown_seconds() -> u64 {
    60
}
fn default_failure_threshold() -> u32 {
    1
}
fn default_request_timeout() -> u64 {
    30
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PollerConfig {
    #[serde(default = "default_poll_interval")]
    pub interval_seconds: u64,
    #[serde(default = "default_max_polls")]
    pub max_polls: u32,
    #[serde(default = "default_lock_ttl")]
    pub lock_ttl_seconds: u64,
    /// Upstream status query timeout (shorter than submission)
    #[serde(default = "default_status_timeout")]
    pub status_timeout_seconds: u64,
    /// Whole-job automatic resubmissions on upstream-reported failure
    #[serde(default = "default_max_job_retries")]
    pub max_job_retries: u32,
}

fn default_poll_interval() -> u64 {
    5
}
fn default_max_polls() -> u32 {
    120
}
fn default_lock_ttl() -> u64 {
    600
}
fn default_status_timeout() -> u64 {
    15
}
fn default_max_job_retries() -> u32 {
    1
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RateLimitsConfig {
    #[serde(default = "default_relay_limit")]
    pub relay: RateLimitConfig,
    #[serde(default = "default_api_limit")]
    pub api: RateLimitConfig,
    #[serde(default = "default_polling_limit")]
    pub polling: RateLimitConfig,
}

impl Default for RateLimitsConfig {
    fn default() -> Self {
        Self {
            relay: default_relay_limit(),
            api: default_api_limit(),
            polling: default_polling_limit(),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct RateLimitConfig {
    pub max_requests: u32,
    pub window_seconds: u64,
}

fn default_relay_limit() -> RateLimitConfig {
    // Strict: generation submissions are expensive upstream
    RateLimitConfig {
        max_requests: 20,
        window_seconds: 1200,
    }
}
fn default_api_limit() -> RateLimitConfig {
    RateLimitConfig {
        max_requests: 300,
        window_seconds: 180,
    }
}
fn default_polling_limit() -> RateLimitConfig {
    // Loose: status endpoints are hit on every UI refresh
    RateLimitConfig {
        max_requests: 600,
        window_seconds: 60,
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ApiKeyConfig {
    pub key: String,
    pub name: String,
    pub enabled: bool,
    /// Tenant whose channels this key relays through
    pub tenant: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChannelConfig {
    pub id: String,
    pub tenant: String,
    pub name: String,
    pub provider: String,
    pub base_url: String,
    pub api_key: String,
    pub models: Vec<String>,
    #[serde(default = "default_priority")]
    pub priority: u32,
    #[serde(default = "default_group")]
    pub group: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_priority() -> u32 {
    1
}
fn default_group() -> String {
    "default".to_string()
}
fn default_true() -> bool {
    true
}

pub fn load_config() -> anyhow::Result<Config> {
    let config = config::Config::builder()
        .add_source(config::File::with_name("config"))
        .add_source(config::Environment::with_prefix("RELAY_GATEWAY").separator("__"))
        .build()?;

    let cfg: Config = config.try_deserialize()?;
    validate_config(&cfg)?;

    Ok(cfg)
}

pub fn validate_config(cfg: &Config) -> anyhow::Result<()> {
    if cfg.api_keys.is_empty() {
        anyhow::bail!("At least one API key must be configured");
    }

    for key in &cfg.api_keys {
        if key.name.is_empty() {
            anyhow::bail!("API key name cannot be empty");
        }
        if key.tenant.is_empty() {
            anyhow::bail!("API key '{}' has no tenant", key.name);
        }
    }

    if cfg.channels.iter().all(|c| !c.enabled) {
        anyhow::bail!("At least one channel must be enabled");
    }

    for channel in &cfg.channels {
        if channel.models.is_empty() {
            anyhow::bail!("Channel '{}' supports no models", channel.id);
        }
        match channel.provider.as_str() {
            "sora" | "openai" | "azure" | "custom" => {}
            other => anyhow::bail!("Channel '{}' has unknown provider: {}", channel.id, other),
        }
        if !channel.base_url.starts_with("http") {
            anyhow::bail!("Channel '{}' base_url must be http(s)", channel.id);
        }
    }

    if cfg.relay.max_attempts == 0 {
        anyhow::bail!("relay.max_attempts must be at least 1");
    }
    if cfg.poller.interval_seconds == 0 {
        anyhow::bail!("poller.interval_seconds must be at least 1");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_channel(id: &str) -> ChannelConfig {
        ChannelConfig {
            id: id.to_string(),
            tenant: "t1".to_string(),
            name: id.to_string(),
            provider: "sora".to_string(),
            base_url: "https://api.example.com".to_string(),
            api_key: "sk-test".to_string(),
            models: vec!["sora-1.0".to_string()],
            priority: 1,
            group: "default".to_string(),
            enabled: true,
        }
    }

    fn base_config() -> Config {
        Config {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
                log_level: "info".to_string(),
                log_format: "text".to_string(),
            },
            store: StoreConfig {
                redis_url: String::new(),
                namespace: "relay".to_string(),
            },
            database: DatabaseConfig {
                url: "sqlite::memory:".to_string(),
            },
            relay: RelayConfig {
                max_attempts: 3,
                cooldown_seconds: 60,
                failure_threshold: 1,
                request_timeout_seconds: 30,
            },
            poller: PollerConfig {
                interval_seconds: 5,
                max_polls: 120,
                lock_ttl_seconds: 600,
                status_timeout_seconds: 15,
                max_job_retries: 1,
            },
            rate_limits: RateLimitsConfig::default(),
            api_keys: vec![ApiKeyConfig {
                key: "test-key".to_string(),
                name: "tester".to_string(),
                enabled: true,
                tenant: "t1".to_string(),
            }],
            channels: vec![test_channel("ch-1")],
        }
    }

    #[test]
    fn test_valid_config_passes() {
        assert!(validate_config(&base_config()).is_ok());
    }

    #[test]
    fn test_rejects_empty_api_keys() {
        let mut cfg = base_config();
        cfg.api_keys.clear();
        assert!(validate_config(&cfg).is_err());
    }

    #[test]
    fn test_rejects_unknown_provider() {
        let mut cfg = base_config();
        cfg.channels[0].provider = "replicate".to_string();
        assert!(validate_config(&cfg).is_err());
    }

    #[test]
    fn test_rejects_channel_without_models() {
        let mut cfg = base_config();
        cfg.channels[0].models.clear();
        assert!(validate_config(&cfg).is_err());
    }

    #[test]
    fn test_rejects_all_channels_disabled() {
        let mut cfg = base_config();
        cfg.channels[0].enabled = false;
        assert!(validate_config(&cfg).is_err());
    }
}
