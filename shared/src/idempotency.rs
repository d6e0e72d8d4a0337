//! Consumer-side idempotency gate.
//!
//! The gate is advisory: it short-circuits most duplicate deliveries, but
//! correctness rests on the unique `idempotency_key` columns in each
//! service's own tables.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use uuid::Uuid;

/// Gate TTL, long enough to absorb replay windows.
pub const PROCESSED_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Key under which a consumed event is recorded: `<service>:<eventId>`.
pub fn event_key(service: &str, event_id: Uuid) -> String {
    format!("{service}:{event_id}")
}

#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    async fn is_processed(&self, key: &str) -> Result<bool>;

    /// Records the key for `ttl`. Returns false when it was already present.
    async fn reserve(&self, key: &str, ttl: Duration) -> Result<bool>;
}

/// Redis-backed store shared by all handlers of one service process.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
}

impl RedisStore {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).context("invalid redis url")?;
        let conn = ConnectionManager::new(client)
            .await
            .context("failed to connect to redis")?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl IdempotencyStore for RedisStore {
    async fn is_processed(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let exists: i64 = redis::cmd("EXISTS")
            .arg(key)
            .query_async(&mut conn)
            .await
            .context("failed to check idempotency key")?;
        Ok(exists > 0)
    }

    async fn reserve(&self, key: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();
        let set: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg("1")
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await
            .context("failed to reserve idempotency key")?;
        Ok(set.is_some())
    }
}

/// In-memory store for tests and local runs without Redis.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    entries: Arc<Mutex<HashMap<String, Instant>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryStore {
    async fn is_processed(&self, key: &str) -> Result<bool> {
        let mut entries = self.entries.lock().unwrap();
        match entries.get(key) {
            Some(expires_at) if *expires_at > Instant::now() => Ok(true),
            Some(_) => {
                entries.remove(key);
                Ok(false)
            }
            None => Ok(false),
        }
    }

    async fn reserve(&self, key: &str, ttl: Duration) -> Result<bool> {
        let mut entries = self.entries.lock().unwrap();
        let now = Instant::now();
        match entries.get(key) {
            Some(expires_at) if *expires_at > now => Ok(false),
            _ => {
                entries.insert(key.to_string(), now + ttl);
                Ok(true)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_key_is_service_scoped() {
        let id = Uuid::new_v4();
        assert_eq!(
            event_key("payment-service", id),
            format!("payment-service:{id}")
        );
    }

    #[tokio::test]
    async fn reserve_succeeds_once() {
        let store = InMemoryStore::new();
        assert!(!store.is_processed("k").await.unwrap());
        assert!(store.reserve("k", Duration::from_secs(60)).await.unwrap());
        assert!(store.is_processed("k").await.unwrap());
        assert!(!store.reserve("k", Duration::from_secs(60)).await.unwrap());
    }

    #[tokio::test]
    async fn expired_keys_are_forgotten() {
        let store = InMemoryStore::new();
        assert!(store.reserve("k", Duration::ZERO).await.unwrap());
        assert!(!store.is_processed("k").await.unwrap());
        assert!(store.reserve("k", Duration::from_secs(60)).await.unwrap());
    }
}
