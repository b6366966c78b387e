//! The ephemeral cache holding hot telemetry snapshots.

use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tokio::time::Instant;

use crate::error::Result;

/// A key/value cache whose entries expire on their own.
///
/// Nothing lifecycle-relevant is ever read back from here.
#[async_trait]
pub trait SnapshotCache: Send + Sync {
    /// Store `value` under `key` for `ttl`.
    async fn set(&self, key: &str, value: Value, ttl: Duration) -> Result<()>;

    /// The value under `key`, unless it expired.
    async fn get(&self, key: &str) -> Result<Option<Value>>;
}

/// A [`SnapshotCache`] held in process memory.
///
/// A TTL too long to represent keeps the entry until it is overwritten.
#[derive(Default)]
pub struct MemoryCache {
    entries: DashMap<String, (Value, Option<Instant>)>,
}

impl MemoryCache {
    /// An empty cache.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SnapshotCache for MemoryCache {
    async fn set(&self, key: &str, value: Value, ttl: Duration) -> Result<()> {
        self.entries
            .insert(key.to_string(), (value, Instant::now().checked_add(ttl)));
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Value>> {
        let now = Instant::now();
        let expired = match self.entries.get(key) {
            Some(entry) if entry.1.is_none_or(|expires| expires > now) => return Ok(Some(entry.0.clone())),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.entries
                .remove_if(key, |_, (_, expires)| expires.is_some_and(|expires| expires <= now));
        }
        Ok(None)
    }
}
