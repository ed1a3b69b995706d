use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::time::interval;
use tracing::debug;

use crate::metrics::STORE_KEYS;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("store call timed out after {0:?}")]
    Timeout(Duration),

    #[error("malformed store value: {0}")]
    Serialization(#[from] serde_json::Error),
}

// Shared key-value cache holding rate window records
#[async_trait]
pub trait KvStore: Send + Sync + 'static {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn put(&self, key: &str, value: String, ttl: Duration) -> Result<(), StoreError>;
}

// Stored value with its expiry
#[derive(Clone)]
struct StoreEntry {
    value: String,
    expires_at: Instant,
}

impl StoreEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

// In-process store; expired entries are dropped on read and by sweep_expired
#[derive(Default)]
pub struct MemoryStore {
    entries: DashMap<String, StoreEntry>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn remove_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        let removed = before.saturating_sub(self.entries.len());
        STORE_KEYS.set(self.entries.len() as f64);
        removed
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let now = Instant::now();
        let expired = match self.entries.get(key) {
            Some(entry) if !entry.is_expired(now) => return Ok(Some(entry.value.clone())),
            Some(_) => true,
            None => false,
        };
        // shard guard from `get` must be released before removing
        if expired {
            self.entries.remove_if(key, |_, entry| entry.is_expired(now));
        }
        Ok(None)
    }

    async fn put(&self, key: &str, value: String, ttl: Duration) -> Result<(), StoreError> {
        self.entries.insert(
            key.to_string(),
            StoreEntry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
        STORE_KEYS.set(self.entries.len() as f64);
        Ok(())
    }
}

// Housekeeping for the in-memory store - runs every `sweep_interval`
pub async fn sweep_expired(store: Arc<MemoryStore>, sweep_interval: Duration) {
    let mut interval = interval(sweep_interval);

    loop {
        interval.tick().await;

        let removed = store.remove_expired();
        if removed > 0 {
            debug!(removed, remaining = store.len(), "swept expired rate-limit records");
        }
    }
}
