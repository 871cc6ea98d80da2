//! Ephemeral key/value store with per-key expiry.

use crate::error::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;

/// Short-lived key/value storage shared by the poll cycle and the read layer.
///
/// Values are opaque strings; callers serialize.
#[async_trait]
pub trait EphemeralCache: Send + Sync {
    /// Read a value. Expired keys read as absent.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing store is unreachable.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Store a value with no expiry.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing store is unreachable.
    async fn set(&self, key: &str, value: String) -> Result<()>;

    /// Store a value that expires after `ttl`.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing store is unreachable.
    async fn set_with_ttl(&self, key: &str, value: String, ttl: Duration) -> Result<()>;

    /// Remove a key. Removing an absent key is not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing store is unreachable.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Remaining lifetime of a key. `None` when absent or persistent.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing store is unreachable.
    async fn ttl(&self, key: &str) -> Result<Option<Duration>>;
}

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

/// In-process cache. Expired entries are dropped lazily on access.
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: RwLock<HashMap<String, Entry>>,
}

impl MemoryCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    async fn live_entry(&self, key: &str) -> Option<Entry> {
        let now = Instant::now();
        {
            let entries = self.entries.read().await;
            match entries.get(key) {
                Some(entry) if entry.is_live(now) => return Some(entry.clone()),
                Some(_) => {}
                None => return None,
            }
        }

        let mut entries = self.entries.write().await;
        if entries.get(key).is_some_and(|e| !e.is_live(now)) {
            entries.remove(key);
        }
        None
    }
}

#[async_trait]
impl EphemeralCache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.live_entry(key).await.map(|e| e.value))
    }

    async fn set(&self, key: &str, value: String) -> Result<()> {
        self.entries.write().await.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: None,
            },
        );
        Ok(())
    }

    async fn set_with_ttl(&self, key: &str, value: String, ttl: Duration) -> Result<()> {
        self.entries.write().await.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.write().await.remove(key);
        Ok(())
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>> {
        Ok(self
            .live_entry(key)
            .await
            .and_then(|e| e.expires_at)
            .map(|at| at.saturating_duration_since(Instant::now())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_entry_expires_after_ttl() {
        let cache = MemoryCache::new();
        cache
            .set_with_ttl("k", "v".into(), Duration::from_secs(60))
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(59)).await;
        assert_eq!(cache.get("k").await.unwrap().as_deref(), Some("v"));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(cache.get("k").await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_reports_remaining() {
        let cache = MemoryCache::new();
        cache
            .set_with_ttl("k", "v".into(), Duration::from_secs(90))
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(30)).await;

        assert_eq!(
            cache.ttl("k").await.unwrap(),
            Some(Duration::from_secs(60))
        );
    }

    #[tokio::test]
    async fn test_persistent_set_and_delete() {
        let cache = MemoryCache::new();
        cache.set("marker", "t1".into()).await.unwrap();
        assert!(cache.ttl("marker").await.unwrap().is_none());
        assert_eq!(cache.get("marker").await.unwrap().as_deref(), Some("t1"));

        cache.delete("marker").await.unwrap();
        cache.delete("marker").await.unwrap();
        assert!(cache.get("marker").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_overwrite_replaces_expiry() {
        let cache = MemoryCache::new();
        cache
            .set_with_ttl("k", "old".into(), Duration::from_secs(5))
            .await
            .unwrap();
        cache.set("k", "new".into()).await.unwrap();

        assert!(cache.ttl("k").await.unwrap().is_none());
        assert_eq!(cache.get("k").await.unwrap().as_deref(), Some("new"));
    }
}
