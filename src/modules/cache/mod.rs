//! Resolution result cache.
//!
//! Maps the hash of a normalised URL to the destination it resolved to.
//! Entries expire after a fixed window; expired entries are purged lazily on
//! lookup. An optional [`CacheStore`] persists entries across restarts and is
//! consulted on memory misses.

mod store;

pub use store::{CacheStore, CacheStoreError, MemoryCacheStore, RedbCacheStore};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use url::Url;

const HASH_LEN: usize = 32;

/// Canonical form used for hashing: scheme and host lowercased, default
/// port and fragment dropped, trailing slash removed from non-root paths.
pub fn normalize_url(raw: &str) -> Option<String> {
    let mut url = Url::parse(raw.trim()).ok()?;
    url.set_fragment(None);

    let path = url.path().to_string();
    if path.len() > 1 && path.ends_with('/') {
        url.set_path(path.trim_end_matches('/'));
    }

    Some(url.to_string())
}

/// First 32 hex characters of SHA-256 over the normalised URL.
pub fn hash_url(raw: &str) -> String {
    let canonical = normalize_url(raw).unwrap_or_else(|| raw.trim().to_string());
    let digest = Sha256::digest(canonical.as_bytes());
    let mut hex = String::with_capacity(HASH_LEN);
    for byte in digest.iter() {
        if hex.len() >= HASH_LEN {
            break;
        }
        hex.push_str(&format!("{byte:02x}"));
    }
    hex.truncate(HASH_LEN);
    hex
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub url_hash: String,
    pub original_url: String,
    pub resolved_url: String,
    pub strategy_used: String,
    pub success: bool,
    pub domain: String,
    pub created_at: DateTime<Utc>,
    pub access_count: u64,
    pub last_accessed_at: Option<DateTime<Utc>>,
}

impl CacheEntry {
    pub fn new(original: &Url, resolved: &Url, strategy: impl Into<String>) -> Self {
        Self {
            url_hash: hash_url(original.as_str()),
            original_url: original.to_string(),
            resolved_url: resolved.to_string(),
            strategy_used: strategy.into(),
            success: true,
            domain: original.host_str().unwrap_or_default().to_ascii_lowercase(),
            created_at: Utc::now(),
            access_count: 0,
            last_accessed_at: None,
        }
    }

    pub fn age(&self) -> Duration {
        (Utc::now() - self.created_at).to_std().unwrap_or(Duration::ZERO)
    }

    pub fn is_valid(&self, max_age: Duration) -> bool {
        self.success && self.age() < max_age
    }

    pub fn record_access(&mut self) {
        self.access_count = self.access_count.saturating_add(1);
        self.last_accessed_at = Some(Utc::now());
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
}

/// In-memory result cache with optional write-through persistence.
pub struct ResultCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
    max_age: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
    store: Option<Arc<dyn CacheStore>>,
}

impl std::fmt::Debug for ResultCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultCache")
            .field("max_age", &self.max_age)
            .field("entries", &self.len())
            .field("persistent", &self.store.is_some())
            .finish()
    }
}

impl ResultCache {
    pub fn new(max_age: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            max_age,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            store: None,
        }
    }

    pub fn with_store(mut self, store: Arc<dyn CacheStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn max_age(&self) -> Duration {
        self.max_age
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, CacheEntry>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, CacheEntry>> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Valid entry for the hash, if any. Expired entries are removed.
    pub async fn get(&self, url_hash: &str) -> Option<CacheEntry> {
        let cached = self.read().get(url_hash).cloned();

        let found = match cached {
            Some(entry) if entry.is_valid(self.max_age) => Some(entry),
            Some(_) => {
                self.write().remove(url_hash);
                self.remove_from_store(url_hash).await;
                log::debug!("[cache] purged expired entry {}", url_hash);
                None
            }
            None => self.load_from_store(url_hash).await,
        };

        match found {
            Some(entry) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    async fn load_from_store(&self, url_hash: &str) -> Option<CacheEntry> {
        let store = self.store.as_ref()?;
        match store.load(url_hash).await {
            Ok(Some(entry)) if entry.is_valid(self.max_age) => {
                self.write().insert(url_hash.to_string(), entry.clone());
                Some(entry)
            }
            Ok(Some(_)) => {
                self.remove_from_store(url_hash).await;
                None
            }
            Ok(None) => None,
            Err(err) => {
                log::warn!("[cache] store load failed for {}: {}", url_hash, err);
                None
            }
        }
    }

    async fn remove_from_store(&self, url_hash: &str) {
        if let Some(store) = &self.store
            && let Err(err) = store.remove(url_hash).await
        {
            log::warn!("[cache] store remove failed for {}: {}", url_hash, err);
        }
    }

    async fn save_to_store(&self, entry: &CacheEntry) {
        if let Some(store) = &self.store
            && let Err(err) = store.save(entry).await
        {
            log::warn!("[cache] store save failed for {}: {}", entry.url_hash, err);
        }
    }

    /// Insert or replace an entry. Last write wins.
    pub async fn set(&self, entry: CacheEntry) {
        self.write().insert(entry.url_hash.clone(), entry.clone());
        self.save_to_store(&entry).await;
    }

    /// Bump access statistics; returns the updated entry.
    pub async fn record_hit(&self, url_hash: &str) -> Option<CacheEntry> {
        let updated = {
            let mut entries = self.write();
            let entry = entries.get_mut(url_hash)?;
            entry.record_access();
            entry.clone()
        };
        self.save_to_store(&updated).await;
        Some(updated)
    }

    pub async fn invalidate(&self, url_hash: &str) -> bool {
        let removed = self.write().remove(url_hash).is_some();
        self.remove_from_store(url_hash).await;
        removed
    }

    pub async fn clear(&self) {
        self.write().clear();
        if let Some(store) = &self.store
            && let Err(err) = store.clear().await
        {
            log::warn!("[cache] store clear failed: {}", err);
        }
    }

    /// Drop every expired in-memory entry; returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let mut entries = self.write();
        let before = entries.len();
        entries.retain(|_, entry| entry.is_valid(self.max_age));
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;
        CacheStats {
            entries: self.len(),
            hits,
            misses,
            hit_rate: if lookups == 0 {
                0.0
            } else {
                hits as f64 / lookups as f64
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(original: &str, resolved: &str) -> CacheEntry {
        CacheEntry::new(
            &Url::parse(original).unwrap(),
            &Url::parse(resolved).unwrap(),
            "html_forms",
        )
    }

    #[test]
    fn equivalent_urls_share_a_hash() {
        let reference = hash_url("https://short.test/abc");
        assert_eq!(reference.len(), 32);
        assert_eq!(hash_url("  HTTPS://Short.TEST:443/abc/#frag "), reference);
        assert_ne!(hash_url("https://short.test/abd"), reference);
    }

    #[test]
    fn root_path_keeps_its_slash() {
        assert_eq!(
            normalize_url("https://short.test").as_deref(),
            Some("https://short.test/")
        );
    }

    #[tokio::test]
    async fn hit_returns_entry_and_counts() {
        let cache = ResultCache::new(Duration::from_secs(60));
        let e = entry("https://short.test/abc", "https://dest.test/file");
        let hash = e.url_hash.clone();
        cache.set(e).await;

        let found = cache.get(&hash).await.unwrap();
        assert_eq!(found.resolved_url, "https://dest.test/file");

        let bumped = cache.record_hit(&hash).await.unwrap();
        assert_eq!(bumped.access_count, 1);
        assert!(bumped.last_accessed_at.is_some());
        assert_eq!(cache.stats().hits, 1);
    }

    #[tokio::test]
    async fn expired_entries_are_purged_on_get() {
        let cache = ResultCache::new(Duration::from_secs(60));
        let mut e = entry("https://short.test/old", "https://dest.test/old");
        e.created_at = Utc::now() - chrono::Duration::seconds(120);
        let hash = e.url_hash.clone();
        cache.set(e).await;
        assert_eq!(cache.len(), 1);

        assert!(cache.get(&hash).await.is_none());
        assert_eq!(cache.len(), 0);
        assert_eq!(cache.stats().misses, 1);
    }

    #[tokio::test]
    async fn purge_expired_keeps_fresh_entries() {
        let cache = ResultCache::new(Duration::from_secs(60));
        let mut stale = entry("https://short.test/1", "https://dest.test/1");
        stale.created_at = Utc::now() - chrono::Duration::seconds(61);
        cache.set(stale).await;
        cache
            .set(entry("https://short.test/2", "https://dest.test/2"))
            .await;

        assert_eq!(cache.purge_expired(), 1);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn memory_miss_reads_through_store() {
        let store = Arc::new(MemoryCacheStore::default());
        let e = entry("https://short.test/p", "https://dest.test/p");
        store.save(&e).await.unwrap();

        let cache = ResultCache::new(Duration::from_secs(60)).with_store(store.clone());
        assert!(cache.is_empty());
        assert!(cache.get(&e.url_hash).await.is_some());
        assert_eq!(cache.len(), 1);

        assert!(cache.invalidate(&e.url_hash).await);
        assert!(store.load(&e.url_hash).await.unwrap().is_none());
    }
}
