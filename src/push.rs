//! Server-push hub
//!
//! Fan-out point for job lifecycle events. One user may hold several live
//! SSE connections (tabs, devices); each gets its own session with a
//! bounded channel. Delivery is best effort: a session whose channel is
//! closed or full is dropped from the table on the next push, and removal
//! is idempotent so disconnect paths can all call it.

use axum::response::sse::Event;
use dashmap::DashMap;
use serde::Serialize;
use std::collections::HashSet;
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

const SESSION_BUFFER: usize = 32;
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);

struct Session {
    user_id: String,
    sender: mpsc::Sender<Event>,
}

#[derive(Default)]
pub struct PushHub {
    sessions: DashMap<String, Session>,
    /// user id -> live session ids
    users: DashMap<String, HashSet<String>>,
}

impl PushHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection for `user_id`; the receiver feeds the SSE body
    pub fn add_connection(&self, user_id: &str) -> (String, mpsc::Receiver<Event>) {
        let session_id = Uuid::new_v4().to_string();
        let (sender, receiver) = mpsc::channel(SESSION_BUFFER);

        self.sessions.insert(
            session_id.clone(),
            Session {
                user_id: user_id.to_string(),
                sender,
            },
        );
        self.users
            .entry(user_id.to_string())
            .or_default()
            .insert(session_id.clone());

        tracing::debug!(user = user_id, session = %session_id, "Push session opened");
        (session_id, receiver)
    }

    /// Drop a session. Safe to call from every disconnect path.
    pub fn remove_connection(&self, session_id: &str) {
        let Some((_, session)) = self.sessions.remove(session_id) else {
            return;
        };

        if let Some(mut sessions) = self.users.get_mut(&session.user_id) {
            sessions.remove(session_id);
        }
        self.users
            .remove_if(&session.user_id, |_, sessions| sessions.is_empty());

        tracing::debug!(user = %session.user_id, session = session_id, "Push session closed");
    }

    /// Deliver one event to every live session of `user_id`.
    /// Returns how many sessions received it.
    pub fn push<T: Serialize>(&self, user_id: &str, event_name: &str, data: &T) -> usize {
        let payload = match serde_json::to_string(data) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!(user = user_id, event = event_name, error = %e, "Unserializable push event");
                return 0;
            }
        };

        let session_ids: Vec<String> = self
            .users
            .get(user_id)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default();

        let mut delivered = 0;
        for session_id in session_ids {
            let sent = self
                .sessions
                .get(&session_id)
                .map(|session| {
                    session
                        .sender
                        .try_send(Event::default().event(event_name).data(&payload))
                        .is_ok()
                })
                .unwrap_or(false);

            if sent {
                delivered += 1;
            } else {
                self.remove_connection(&session_id);
            }
        }

        tracing::debug!(
            user = user_id,
            event = event_name,
            delivered = delivered,
            "Push event fanned out"
        );
        delivered
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Periodic comment frame on every session so idle proxies keep the
    /// connections open. Runs until the hub is dropped by the caller.
    pub async fn run_heartbeat(&self) {
        let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let session_ids: Vec<String> =
                self.sessions.iter().map(|e| e.key().clone()).collect();
            for session_id in session_ids {
                let alive = self
                    .sessions
                    .get(&session_id)
                    .map(|session| {
                        session
                            .sender
                            .try_send(Event::default().comment("ping"))
                            .is_ok()
                    })
                    .unwrap_or(false);
                if !alive {
                    self.remove_connection(&session_id);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_fan_out_to_all_user_sessions() {
        let hub = PushHub::new();
        let (_s1, mut r1) = hub.add_connection("u1");
        let (_s2, mut r2) = hub.add_connection("u1");
        let (_s3, mut r3) = hub.add_connection("u2");

        let delivered = hub.push("u1", "job.update", &json!({"progress": 50}));
        assert_eq!(delivered, 2);
        assert!(r1.try_recv().is_ok());
        assert!(r2.try_recv().is_ok());
        assert!(r3.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_dead_session_is_pruned_on_push() {
        let hub = PushHub::new();
        let (_s1, r1) = hub.add_connection("u1");
        let (_s2, mut r2) = hub.add_connection("u1");
        drop(r1);

        let delivered = hub.push("u1", "job.completed", &json!({"job_id": "j1"}));
        assert_eq!(delivered, 1);
        assert!(r2.try_recv().is_ok());
        assert_eq!(hub.session_count(), 1);
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let hub = PushHub::new();
        let (session_id, _receiver) = hub.add_connection("u1");

        hub.remove_connection(&session_id);
        hub.remove_connection(&session_id);
        assert_eq!(hub.session_count(), 0);
        assert_eq!(hub.push("u1", "job.update", &json!({})), 0);
    }

    #[tokio::test]
    async fn test_push_to_unknown_user_delivers_nothing() {
        let hub = PushHub::new();
        assert_eq!(hub.push("nobody", "job.update", &json!({})), 0);
    }
}
