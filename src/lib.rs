//! Relay gateway for asynchronous AI generation APIs
//!
//! Accepts generation requests, relays them through a prioritized pool of
//! upstream channels with failover and cooldown, polls the upstream job to
//! completion, tracks spend, and pushes lifecycle events to subscribers.

pub mod auth;
pub mod channel;
pub mod cli;
pub mod config;
pub mod cost;
pub mod db;
pub mod dispatcher;
pub mod error;
pub mod handlers;
pub mod health;
pub mod poller;
pub mod providers;
pub mod push;
pub mod rate_limit;
pub mod server;
pub mod store;

use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber. `RUST_LOG` overrides the
/// configured level.
pub fn init_tracing(level: &str, format: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    if format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}
