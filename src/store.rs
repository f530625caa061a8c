//! Coordination store abstraction
//!
//! The store holds all cross-instance state: cooldown markers, rate-limit
//! windows, distributed poll locks, job metadata and spend counters. Redis
//! is the deployment backend; an in-process implementation backs tests and
//! single-node setups.

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::time::{Duration, Instant};

use crate::error::AppError;

pub type StoreResult<T> = Result<T, AppError>;

#[async_trait]
pub trait CoordStore: Send + Sync + 'static {
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// SET without expiry
    async fn set(&self, key: &str, value: &str) -> StoreResult<()>;

    /// SET with TTL in seconds
    async fn set_ex(&self, key: &str, value: &str, ttl_seconds: u64) -> StoreResult<()>;

    /// SET NX EX; returns true when the key was created (lock acquired)
    async fn set_nx_ex(&self, key: &str, value: &str, ttl_seconds: u64) -> StoreResult<bool>;

    async fn del(&self, key: &str) -> StoreResult<()>;

    async fn exists(&self, key: &str) -> StoreResult<bool>;

    /// INCRBYFLOAT, optionally refreshing a TTL; returns the new value
    async fn incr_f64(&self, key: &str, by: f64, ttl_seconds: Option<u64>) -> StoreResult<f64>;

    /// INCRBY, optionally refreshing a TTL; returns the new value
    async fn incr_i64(&self, key: &str, by: i64, ttl_seconds: Option<u64>) -> StoreResult<i64>;

    async fn list_len(&self, key: &str) -> StoreResult<u64>;

    async fn list_push_front(&self, key: &str, value: &str) -> StoreResult<()>;

    /// Last (oldest, when pushed at the front) element of the list
    async fn list_back(&self, key: &str) -> StoreResult<Option<String>>;

    /// Keep only the first `max` elements
    async fn list_trim_front(&self, key: &str, max: u64) -> StoreResult<()>;

    async fn expire(&self, key: &str, ttl_seconds: u64) -> StoreResult<()>;

    /// All keys starting with `prefix` (un-namespaced)
    async fn scan_prefix(&self, prefix: &str) -> StoreResult<Vec<String>>;
}

// ============================================================
// Redis implementation
// ============================================================

pub struct RedisStore {
    manager: redis::aio::ConnectionManager,
    namespace: String,
}

impl RedisStore {
    pub async fn connect(url: &str, namespace: &str) -> StoreResult<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| AppError::Store(format!("invalid redis url: {}", e)))?;
        let manager = client
            .get_connection_manager()
            .await
            .map_err(|e| AppError::Store(format!("redis connect failed: {}", e)))?;

        Ok(Self {
            manager,
            namespace: namespace.to_string(),
        })
    }

    fn ns(&self, key: &str) -> String {
        format!("{}:{}", self.namespace, key)
    }

    fn err(e: redis::RedisError) -> AppError {
        AppError::Store(e.to_string())
    }
}

#[async_trait]
impl CoordStore for RedisStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut conn = self.manager.clone();
        redis::cmd("GET")
            .arg(self.ns(key))
            .query_async(&mut conn)
            .await
            .map_err(Self::err)
    }

    async fn set(&self, key: &str, value: &str) -> StoreResult<()> {
        let mut conn = self.manager.clone();
        redis::cmd("SET")
            .arg(self.ns(key))
            .arg(value)
            .query_async::<()>(&mut conn)
            .await
            .map_err(Self::err)
    }

    async fn set_ex(&self, key: &str, value: &str, ttl_seconds: u64) -> StoreResult<()> {
        let mut conn = self.manager.clone();
        redis::cmd("SET")
            .arg(self.ns(key))
            .arg(value)
            .arg("EX")
            .arg(ttl_seconds)
            .query_async::<()>(&mut conn)
            .await
            .map_err(Self::err)
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl_seconds: u64) -> StoreResult<bool> {
        let mut conn = self.manager.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(self.ns(key))
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl_seconds)
            .query_async(&mut conn)
            .await
            .map_err(Self::err)?;
        Ok(reply.is_some())
    }

    async fn del(&self, key: &str) -> StoreResult<()> {
        let mut conn = self.manager.clone();
        redis::cmd("DEL")
            .arg(self.ns(key))
            .query_async::<()>(&mut conn)
            .await
            .map_err(Self::err)
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        let mut conn = self.manager.clone();
        let n: u64 = redis::cmd("EXISTS")
            .arg(self.ns(key))
            .query_async(&mut conn)
            .await
            .map_err(Self::err)?;
        Ok(n > 0)
    }

    async fn incr_f64(&self, key: &str, by: f64, ttl_seconds: Option<u64>) -> StoreResult<f64> {
        let mut conn = self.manager.clone();
        let key = self.ns(key);
        let value: f64 = redis::cmd("INCRBYFLOAT")
            .arg(&key)
            .arg(by)
            .query_async(&mut conn)
            .await
            .map_err(Self::err)?;
        if let Some(ttl) = ttl_seconds {
            redis::cmd("EXPIRE")
                .arg(&key)
                .arg(ttl)
                .query_async::<()>(&mut conn)
                .await
                .map_err(Self::err)?;
        }
        Ok(value)
    }

    async fn incr_i64(&self, key: &str, by: i64, ttl_seconds: Option<u64>) -> StoreResult<i64> {
        let mut conn = self.manager.clone();
        let key = self.ns(key);
        let value: i64 = redis::cmd("INCRBY")
            .arg(&key)
            .arg(by)
            .query_async(&mut conn)
            .await
            .map_err(Self::err)?;
        if let Some(ttl) = ttl_seconds {
            redis::cmd("EXPIRE")
                .arg(&key)
                .arg(ttl)
                .query_async::<()>(&mut conn)
                .await
                .map_err(Self::err)?;
        }
        Ok(value)
    }

    async fn list_len(&self, key: &str) -> StoreResult<u64> {
        let mut conn = self.manager.clone();
        redis::cmd("LLEN")
            .arg(self.ns(key))
            .query_async(&mut conn)
            .await
            .map_err(Self::err)
    }

    async fn list_push_front(&self, key: &str, value: &str) -> StoreResult<()> {
        let mut conn = self.manager.clone();
        redis::cmd("LPUSH")
            .arg(self.ns(key))
            .arg(value)
            .query_async::<()>(&mut conn)
            .await
            .map_err(Self::err)
    }

    async fn list_back(&self, key: &str) -> StoreResult<Option<String>> {
        let mut conn = self.manager.clone();
        redis::cmd("LINDEX")
            .arg(self.ns(key))
            .arg(-1)
            .query_async(&mut conn)
            .await
            .map_err(Self::err)
    }

    async fn list_trim_front(&self, key: &str, max: u64) -> StoreResult<()> {
        let mut conn = self.manager.clone();
        redis::cmd("LTRIM")
            .arg(self.ns(key))
            .arg(0)
            .arg(max as i64 - 1)
            .query_async::<()>(&mut conn)
            .await
            .map_err(Self::err)
    }

    async fn expire(&self, key: &str, ttl_seconds: u64) -> StoreResult<()> {
        let mut conn = self.manager.clone();
        redis::cmd("EXPIRE")
            .arg(self.ns(key))
            .arg(ttl_seconds)
            .query_async::<()>(&mut conn)
            .await
            .map_err(Self::err)
    }

    async fn scan_prefix(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let mut conn = self.manager.clone();
        let pattern = format!("{}:{}*", self.namespace, prefix);
        let keys: Vec<String> = redis::cmd("KEYS")
            .arg(&pattern)
            .query_async(&mut conn)
            .await
            .map_err(Self::err)?;

        let strip = format!("{}:", self.namespace);
        Ok(keys
            .into_iter()
            .filter_map(|k| k.strip_prefix(&strip).map(str::to_string))
            .collect())
    }
}

// ============================================================
// In-process implementation
// ============================================================

enum MemoryValue {
    Scalar(String),
    List(VecDeque<String>),
}

struct MemoryEntry {
    value: MemoryValue,
    expires_at: Option<Instant>,
}

impl MemoryEntry {
    fn expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

/// DashMap-backed store for tests and single-node deployments.
///
/// TTLs use `tokio::time::Instant`, so paused-clock tests observe
/// expiry deterministically. Expired entries are dropped lazily on access.
#[derive(Default)]
pub struct MemoryStore {
    entries: DashMap<String, MemoryEntry>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn ttl_to_deadline(ttl_seconds: u64) -> Instant {
        Instant::now() + Duration::from_secs(ttl_seconds)
    }

    fn live_scalar(&self, key: &str) -> Option<String> {
        let entry = self.entries.get(key)?;
        if entry.expired() {
            drop(entry);
            self.entries.remove(key);
            return None;
        }
        match &entry.value {
            MemoryValue::Scalar(s) => Some(s.clone()),
            MemoryValue::List(_) => None,
        }
    }
}

#[async_trait]
impl CoordStore for MemoryStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        Ok(self.live_scalar(key))
    }

    async fn set(&self, key: &str, value: &str) -> StoreResult<()> {
        self.entries.insert(
            key.to_string(),
            MemoryEntry {
                value: MemoryValue::Scalar(value.to_string()),
                expires_at: None,
            },
        );
        Ok(())
    }

    async fn set_ex(&self, key: &str, value: &str, ttl_seconds: u64) -> StoreResult<()> {
        self.entries.insert(
            key.to_string(),
            MemoryEntry {
                value: MemoryValue::Scalar(value.to_string()),
                expires_at: Some(Self::ttl_to_deadline(ttl_seconds)),
            },
        );
        Ok(())
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl_seconds: u64) -> StoreResult<bool> {
        // Entry-based to keep check-and-set atomic across tasks
        let mut acquired = false;
        let entry = self
            .entries
            .entry(key.to_string())
            .and_modify(|existing| {
                if existing.expired() {
                    existing.value = MemoryValue::Scalar(value.to_string());
                    existing.expires_at = Some(Self::ttl_to_deadline(ttl_seconds));
                    acquired = true;
                }
            })
            .or_insert_with(|| {
                acquired = true;
                MemoryEntry {
                    value: MemoryValue::Scalar(value.to_string()),
                    expires_at: Some(Self::ttl_to_deadline(ttl_seconds)),
                }
            });
        drop(entry);
        Ok(acquired)
    }

    async fn del(&self, key: &str) -> StoreResult<()> {
        self.entries.remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        if let Some(entry) = self.entries.get(key) {
            if !entry.expired() {
                return Ok(true);
            }
            drop(entry);
            self.entries.remove(key);
        }
        Ok(false)
    }

    async fn incr_f64(&self, key: &str, by: f64, ttl_seconds: Option<u64>) -> StoreResult<f64> {
        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| MemoryEntry {
                value: MemoryValue::Scalar("0".to_string()),
                expires_at: None,
            });
        if entry.expired() {
            entry.value = MemoryValue::Scalar("0".to_string());
            entry.expires_at = None;
        }
        let current = match &entry.value {
            MemoryValue::Scalar(s) => s.parse::<f64>().unwrap_or(0.0),
            MemoryValue::List(_) => {
                return Err(AppError::Store("WRONGTYPE: list".to_string()));
            }
        };
        let next = current + by;
        entry.value = MemoryValue::Scalar(next.to_string());
        if let Some(ttl) = ttl_seconds {
            entry.expires_at = Some(Self::ttl_to_deadline(ttl));
        }
        Ok(next)
    }

    async fn incr_i64(&self, key: &str, by: i64, ttl_seconds: Option<u64>) -> StoreResult<i64> {
        let next = self.incr_f64(key, by as f64, ttl_seconds).await?;
        Ok(next as i64)
    }

    async fn list_len(&self, key: &str) -> StoreResult<u64> {
        if let Some(entry) = self.entries.get(key) {
            if entry.expired() {
                drop(entry);
                self.entries.remove(key);
                return Ok(0);
            }
            if let MemoryValue::List(list) = &entry.value {
                return Ok(list.len() as u64);
            }
        }
        Ok(0)
    }

    async fn list_push_front(&self, key: &str, value: &str) -> StoreResult<()> {
        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| MemoryEntry {
                value: MemoryValue::List(VecDeque::new()),
                expires_at: None,
            });
        if entry.expired() {
            entry.value = MemoryValue::List(VecDeque::new());
            entry.expires_at = None;
        }
        match &mut entry.value {
            MemoryValue::List(list) => {
                list.push_front(value.to_string());
                Ok(())
            }
            MemoryValue::Scalar(_) => Err(AppError::Store("WRONGTYPE: scalar".to_string())),
        }
    }

    async fn list_back(&self, key: &str) -> StoreResult<Option<String>> {
        if let Some(entry) = self.entries.get(key) {
            if entry.expired() {
                drop(entry);
                self.entries.remove(key);
                return Ok(None);
            }
            if let MemoryValue::List(list) = &entry.value {
                return Ok(list.back().cloned());
            }
        }
        Ok(None)
    }

    async fn list_trim_front(&self, key: &str, max: u64) -> StoreResult<()> {
        if let Some(mut entry) = self.entries.get_mut(key) {
            if let MemoryValue::List(list) = &mut entry.value {
                list.truncate(max as usize);
            }
        }
        Ok(())
    }

    async fn expire(&self, key: &str, ttl_seconds: u64) -> StoreResult<()> {
        if let Some(mut entry) = self.entries.get_mut(key) {
            entry.expires_at = Some(Self::ttl_to_deadline(ttl_seconds));
        }
        Ok(())
    }

    async fn scan_prefix(&self, prefix: &str) -> StoreResult<Vec<String>> {
        Ok(self
            .entries
            .iter()
            .filter(|e| !e.expired() && e.key().starts_with(prefix))
            .map(|e| e.key().clone())
            .collect())
    }
}
