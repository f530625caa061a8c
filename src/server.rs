//! Server assembly
//!
//! Builds the shared state graph from configuration, wires the router with
//! per-route-group rate limits and key auth, resumes orphaned poll loops,
//! and runs until SIGINT/SIGTERM.

use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use chrono::{Timelike, Utc};
use reqwest::Client;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::auth::{require_api_key, ApiKeyAuth};
use crate::channel::ChannelRegistry;
use crate::config::Config;
use crate::cost::CostTracker;
use crate::db::GatewayDb;
use crate::dispatcher::Dispatcher;
use crate::handlers;
use crate::health::HealthTracker;
use crate::poller::Poller;
use crate::push::PushHub;
use crate::rate_limit::{self, LimiterClass, RateLimiter};
use crate::store::{CoordStore, MemoryStore, RedisStore};

pub struct AppState {
    pub config: Config,
    pub store: Arc<dyn CoordStore>,
    pub db: Arc<GatewayDb>,
    pub registry: Arc<ChannelRegistry>,
    pub health: Arc<HealthTracker>,
    pub cost: Arc<CostTracker>,
    pub dispatcher: Arc<Dispatcher>,
    pub poller: Arc<Poller>,
    pub push: Arc<PushHub>,
    pub auth: Arc<ApiKeyAuth>,
    pub limiter: Arc<RateLimiter>,
}

impl AppState {
    pub async fn from_config(config: Config) -> anyhow::Result<Arc<Self>> {
        let store: Arc<dyn CoordStore> = if config.store.redis_url.is_empty() {
            tracing::info!("Using in-process coordination store");
            MemoryStore::shared()
        } else {
            tracing::info!(url = %config.store.redis_url, "Connecting to Redis");
            Arc::new(RedisStore::connect(&config.store.redis_url, &config.store.namespace).await?)
        };

        let db = Arc::new(GatewayDb::new(&config.database.url).await?);
        let registry = Arc::new(ChannelRegistry::new(&config.channels));
        let health = Arc::new(HealthTracker::new(
            Arc::clone(&store),
            config.relay.cooldown_seconds,
            config.relay.failure_threshold,
        ));
        let cost = Arc::new(CostTracker::new(Arc::clone(&store), Arc::clone(&db)));

        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&registry),
            Arc::clone(&health),
            Arc::clone(&cost),
            Arc::clone(&store),
            client,
            config.relay.clone(),
        ));

        let push = Arc::new(PushHub::new());
        let poller = Arc::new(Poller::new(
            Arc::clone(&store),
            Arc::clone(&db),
            Arc::clone(&registry),
            Arc::clone(&dispatcher),
            Arc::clone(&push),
            config.poller.clone(),
        ));

        let auth = Arc::new(ApiKeyAuth::new(config.api_keys.clone()));
        let limiter = Arc::new(RateLimiter::new(
            Arc::clone(&store),
            config.rate_limits.clone(),
        ));

        Ok(Arc::new(Self {
            config,
            store,
            db,
            registry,
            health,
            cost,
            dispatcher,
            poller,
            push,
            auth,
            limiter,
        }))
    }
}

pub fn build_router(state: Arc<AppState>) -> Router {
    let relay = Router::new()
        .route("/relay/generate", post(handlers::relay::generate))
        .route_layer(middleware::from_fn_with_state(
            (Arc::clone(&state.limiter), LimiterClass::Relay),
            rate_limit::limit,
        ));

    let jobs = Router::new()
        .route("/relay/jobs/:job_id", get(handlers::relay::get_job))
        .route_layer(middleware::from_fn_with_state(
            (Arc::clone(&state.limiter), LimiterClass::Polling),
            rate_limit::limit,
        ));

    let general = Router::new()
        .route("/relay/jobs/:job_id/cancel", post(handlers::relay::cancel_job))
        .route("/stats/health", get(handlers::stats::channel_health))
        .route("/stats/costs", get(handlers::stats::costs))
        .route_layer(middleware::from_fn_with_state(
            (Arc::clone(&state.limiter), LimiterClass::Api),
            rate_limit::limit,
        ));

    let authed = relay
        .merge(jobs)
        .merge(general)
        .route_layer(middleware::from_fn_with_state(
            Arc::clone(&state.auth),
            require_api_key,
        ));

    // Authenticated by query token inside the handler
    let stream = Router::new()
        .route("/jobs/stream", get(handlers::stream::stream))
        .route_layer(middleware::from_fn_with_state(
            (Arc::clone(&state.limiter), LimiterClass::Api),
            rate_limit::limit,
        ));

    Router::new()
        .merge(authed)
        .merge(stream)
        .route("/health", get(handlers::stats::liveness))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn run(config: Config) -> anyhow::Result<()> {
    let state = AppState::from_config(config).await?;

    let resumed = state.poller.recover().await;
    if resumed > 0 {
        tracing::info!(jobs = resumed, "Recovered in-flight jobs");
    }

    let push = Arc::clone(&state.push);
    tokio::spawn(async move {
        push.run_heartbeat().await;
    });

    let cost = Arc::clone(&state.cost);
    tokio::spawn(async move {
        daily_reset_loop(cost).await;
    });

    let addr: SocketAddr = format!(
        "{}:{}",
        state.config.server.host, state.config.server.port
    )
    .parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %addr, "Relay gateway listening");

    axum::serve(
        listener,
        build_router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    tracing::info!("Relay gateway stopped");
    Ok(())
}

/// Clear today's spend counters at each UTC midnight
async fn daily_reset_loop(cost: Arc<CostTracker>) {
    loop {
        let elapsed_today = u64::from(Utc::now().time().num_seconds_from_midnight());
        let until_midnight = 86_400u64.saturating_sub(elapsed_today).max(1);
        tokio::time::sleep(Duration::from_secs(until_midnight)).await;
        cost.reset_daily_spend().await;
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received ctrl-c, shutting down"),
        _ = terminate => tracing::info!("Received SIGTERM, shutting down"),
    }
}
