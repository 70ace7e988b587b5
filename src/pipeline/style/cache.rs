//! Style retrieval cache with TTL expiration.
//!
//! Keys are (user id, embedding hash); expired entries are dropped on read.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use lru::LruCache;
use tokio::sync::Mutex;
use uuid::Uuid;
use xxhash_rust::xxh3::Xxh3;

use super::StylePatterns;
use crate::util::time::Clock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct CacheKey {
    user_id: Uuid,
    embedding_hash: u64,
}

impl CacheKey {
    fn new(user_id: Uuid, embedding: &[f32]) -> Self {
        let mut hasher = Xxh3::new();
        for value in embedding {
            hasher.update(&value.to_le_bytes());
        }
        Self {
            user_id,
            embedding_hash: hasher.digest(),
        }
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    patterns: StylePatterns,
    inserted_at: DateTime<Utc>,
}

/// LRU cache for retrieved style patterns.
pub struct StyleCache {
    entries: Mutex<LruCache<CacheKey, CacheEntry>>,
    ttl: chrono::Duration,
    clock: Arc<dyn Clock>,
}

impl StyleCache {
    #[must_use]
    pub fn new(capacity: NonZeroUsize, ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            ttl: chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX),
            clock,
        }
    }

    /// 期限内のエントリを返す。期限切れのエントリはその場で削除する。
    pub async fn get(&self, user_id: Uuid, embedding: &[f32]) -> Option<StylePatterns> {
        let key = CacheKey::new(user_id, embedding);
        let now = self.clock.now();
        let mut entries = self.entries.lock().await;

        let fresh = entries
            .get(&key)
            .map(|entry| now - entry.inserted_at < self.ttl)?;
        if fresh {
            entries.get(&key).map(|entry| entry.patterns.clone())
        } else {
            entries.pop(&key);
            None
        }
    }

    pub async fn insert(&self, user_id: Uuid, embedding: &[f32], patterns: StylePatterns) {
        let key = CacheKey::new(user_id, embedding);
        let entry = CacheEntry {
            patterns,
            inserted_at: self.clock.now(),
        };
        self.entries.lock().await.put(key, entry);
    }

    /// ユーザーの全エントリを破棄する。エグザンプラ追加時に呼ぶ。
    pub async fn invalidate_user(&self, user_id: Uuid) -> usize {
        let mut entries = self.entries.lock().await;
        let stale: Vec<CacheKey> = entries
            .iter()
            .filter(|(key, _)| key.user_id == user_id)
            .map(|(key, _)| *key)
            .collect();
        for key in &stale {
            entries.pop(key);
        }
        stale.len()
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }
}
