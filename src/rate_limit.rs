//! Sliding-window rate limiting
//!
//! Each (class, client) pair keeps a capped list of admission timestamps in
//! the coordination store. Admission looks at the list length first; at
//! capacity the oldest entry decides whether the window has slid far enough.
//! Store failures always admit, so a coordination outage degrades to an
//! unlimited gateway rather than a dead one.

use axum::extract::{ConnectInfo, Request, State};
use axum::middleware::Next;
use axum::response::Response;
use chrono::Utc;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::config::RateLimitsConfig;
use crate::error::AppError;
use crate::store::CoordStore;

/// Which limit bucket a route belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimiterClass {
    /// Generation submissions
    Relay,
    /// General API traffic
    Api,
    /// Job status reads
    Polling,
}

impl LimiterClass {
    fn as_str(&self) -> &'static str {
        match self {
            LimiterClass::Relay => "relay",
            LimiterClass::Api => "api",
            LimiterClass::Polling => "polling",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Decision {
    pub allowed: bool,
    /// Seconds until the oldest entry leaves the window, when rejected
    pub retry_after: u64,
}

impl Decision {
    fn admit() -> Self {
        Self { allowed: true, retry_after: 0 }
    }
}

pub struct RateLimiter {
    store: Arc<dyn CoordStore>,
    config: RateLimitsConfig,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn CoordStore>, config: RateLimitsConfig) -> Self {
        Self { store, config }
    }

    fn limits(&self, class: LimiterClass) -> (u64, u64) {
        let rule = match class {
            LimiterClass::Relay => self.config.relay,
            LimiterClass::Api => self.config.api,
            LimiterClass::Polling => self.config.polling,
        };
        (u64::from(rule.max_requests), rule.window_seconds)
    }

    /// Admit or reject one request from `client` in `class`'s bucket
    pub async fn allow(&self, class: LimiterClass, client: &str) -> Decision {
        let (max_requests, window_seconds) = self.limits(class);
        if max_requests == 0 {
            return Decision::admit();
        }

        let key = format!("ratelimit:{}:{}", class.as_str(), client);
        let now_ms = Utc::now().timestamp_millis();
        let window_ms = (window_seconds * 1000) as i64;

        match self.try_allow(&key, now_ms, window_ms, max_requests, window_seconds).await {
            Ok(decision) => decision,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Rate limit check failed, admitting");
                Decision::admit()
            }
        }
    }

    async fn try_allow(
        &self,
        key: &str,
        now_ms: i64,
        window_ms: i64,
        max_requests: u64,
        window_seconds: u64,
    ) -> Result<Decision, AppError> {
        let len = self.store.list_len(key).await?;

        if len < max_requests {
            self.store.list_push_front(key, &now_ms.to_string()).await?;
            self.store.expire(key, window_seconds * 2).await?;
            return Ok(Decision::admit());
        }

        let oldest_ms = self
            .store
            .list_back(key)
            .await?
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(0);
        let elapsed_ms = now_ms - oldest_ms;

        if elapsed_ms < window_ms {
            // Rejections re-arm the key TTL too, so a client hammering the
            // limit never sees its window quietly lapse
            self.store.expire(key, window_seconds * 2).await?;
            let retry_after = ((window_ms - elapsed_ms) as u64).div_ceil(1000).max(1);
            return Ok(Decision { allowed: false, retry_after });
        }

        // The window has slid past the oldest entry; admit and re-cap
        self.store.list_push_front(key, &now_ms.to_string()).await?;
        self.store.list_trim_front(key, max_requests).await?;
        self.store.expire(key, window_seconds * 2).await?;
        Ok(Decision::admit())
    }
}

/// Client identity for limiting: forwarded header first, then peer address
fn client_key(request: &Request) -> String {
    if let Some(forwarded) = request
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
    {
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Middleware layer; mount with the class the route group belongs to
pub async fn limit(
    State((limiter, class)): State<(Arc<RateLimiter>, LimiterClass)>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let client = client_key(&request);
    let decision = limiter.allow(class, &client).await;

    if !decision.allowed {
        tracing::debug!(
            class = class.as_str(),
            client = %client,
            retry_after = decision.retry_after,
            "Request rate limited"
        );
        return Err(AppError::RateLimited {
            retry_after: decision.retry_after,
        });
    }

    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RateLimitConfig;
    use crate::store::MemoryStore;
    use std::time::Duration;

    fn limiter(max_requests: u32, window_seconds: u64) -> RateLimiter {
        let rule = RateLimitConfig { max_requests, window_seconds };
        RateLimiter::new(
            MemoryStore::shared(),
            RateLimitsConfig {
                relay: rule,
                api: rule,
                polling: rule,
            },
        )
    }

    #[tokio::test]
    async fn test_admits_up_to_max_then_rejects() {
        let limiter = limiter(3, 60);

        for _ in 0..3 {
            assert!(limiter.allow(LimiterClass::Relay, "1.2.3.4").await.allowed);
        }
        let rejected = limiter.allow(LimiterClass::Relay, "1.2.3.4").await;
        assert!(!rejected.allowed);
        assert!(rejected.retry_after >= 1);
    }

    #[tokio::test]
    async fn test_clients_and_classes_are_independent() {
        let limiter = limiter(1, 60);

        assert!(limiter.allow(LimiterClass::Relay, "1.2.3.4").await.allowed);
        assert!(!limiter.allow(LimiterClass::Relay, "1.2.3.4").await.allowed);
        assert!(limiter.allow(LimiterClass::Relay, "5.6.7.8").await.allowed);
        assert!(limiter.allow(LimiterClass::Api, "1.2.3.4").await.allowed);
    }

    #[tokio::test]
    async fn test_admits_again_after_window_slides() {
        let limiter = limiter(2, 1);

        assert!(limiter.allow(LimiterClass::Api, "1.2.3.4").await.allowed);
        assert!(limiter.allow(LimiterClass::Api, "1.2.3.4").await.allowed);
        assert!(!limiter.allow(LimiterClass::Api, "1.2.3.4").await.allowed);

        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert!(limiter.allow(LimiterClass::Api, "1.2.3.4").await.allowed);
    }

    #[tokio::test]
    async fn test_rejection_refreshes_the_window_key() {
        let rule = RateLimitConfig { max_requests: 1, window_seconds: 2 };
        let store = MemoryStore::shared();
        let limiter = RateLimiter::new(
            store.clone(),
            RateLimitsConfig {
                relay: rule,
                api: rule,
                polling: rule,
            },
        );

        assert!(limiter.allow(LimiterClass::Relay, "9.9.9.9").await.allowed);
        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert!(!limiter.allow(LimiterClass::Relay, "9.9.9.9").await.allowed);

        // The admission armed the key for 4s; the rejection at t+1s re-armed
        // it, so it must still be live past the original expiry.
        tokio::time::sleep(Duration::from_millis(3400)).await;
        assert!(store.exists("ratelimit:relay:9.9.9.9").await.unwrap());
    }

    #[tokio::test]
    async fn test_zero_max_disables_the_limit() {
        let limiter = limiter(0, 60);
        for _ in 0..10 {
            assert!(limiter.allow(LimiterClass::Polling, "1.2.3.4").await.allowed);
        }
    }
}
