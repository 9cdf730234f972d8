//! Persistent backing for the result cache.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use redb::{Database, ReadableTable, TableDefinition};
use thiserror::Error;

use super::CacheEntry;

const RESOLUTIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("resolutions");

#[derive(Debug, Error)]
pub enum CacheStoreError {
    #[error("cache database error: {0}")]
    Database(#[from] redb::Error),
    #[error("cache entry encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("cache worker failed: {0}")]
    Worker(String),
}

impl From<tokio::task::JoinError> for CacheStoreError {
    fn from(err: tokio::task::JoinError) -> Self {
        CacheStoreError::Worker(err.to_string())
    }
}

#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn load(&self, url_hash: &str) -> Result<Option<CacheEntry>, CacheStoreError>;
    async fn save(&self, entry: &CacheEntry) -> Result<(), CacheStoreError>;
    async fn remove(&self, url_hash: &str) -> Result<(), CacheStoreError>;
    async fn clear(&self) -> Result<(), CacheStoreError>;
}

/// Process-local store, mostly useful for tests.
#[derive(Debug, Default)]
pub struct MemoryCacheStore {
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl MemoryCacheStore {
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn load(&self, url_hash: &str) -> Result<Option<CacheEntry>, CacheStoreError> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(entries.get(url_hash).cloned())
    }

    async fn save(&self, entry: &CacheEntry) -> Result<(), CacheStoreError> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.insert(entry.url_hash.clone(), entry.clone());
        Ok(())
    }

    async fn remove(&self, url_hash: &str) -> Result<(), CacheStoreError> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.remove(url_hash);
        Ok(())
    }

    async fn clear(&self) -> Result<(), CacheStoreError> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        Ok(())
    }
}

/// Single-file store backed by redb. Entries are JSON encoded.
///
/// redb is synchronous, so every operation runs on the blocking pool.
#[derive(Clone)]
pub struct RedbCacheStore {
    db: Arc<Database>,
}

impl std::fmt::Debug for RedbCacheStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedbCacheStore").finish_non_exhaustive()
    }
}

impl RedbCacheStore {
    /// Open or create the database file and make sure the table exists.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CacheStoreError> {
        let db = Database::create(path.as_ref()).map_err(redb::Error::from)?;
        create_table(&db)?;
        log::debug!("[cache] opened store at {}", path.as_ref().display());
        Ok(Self { db: Arc::new(db) })
    }

    async fn run<T, F>(&self, op: F) -> Result<T, CacheStoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Database) -> Result<T, CacheStoreError> + Send + 'static,
    {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || op(&db)).await?
    }
}

fn create_table(db: &Database) -> Result<(), redb::Error> {
    let txn = db.begin_write()?;
    txn.open_table(RESOLUTIONS)?;
    txn.commit()?;
    Ok(())
}

fn read_entry(db: &Database, key: &str) -> Result<Option<Vec<u8>>, redb::Error> {
    let txn = db.begin_read()?;
    let table = txn.open_table(RESOLUTIONS)?;
    Ok(table.get(key)?.map(|guard| guard.value().to_vec()))
}

fn write_entry(db: &Database, key: &str, value: &[u8]) -> Result<(), redb::Error> {
    let txn = db.begin_write()?;
    {
        let mut table = txn.open_table(RESOLUTIONS)?;
        table.insert(key, value)?;
    }
    txn.commit()?;
    Ok(())
}

fn delete_entry(db: &Database, key: &str) -> Result<(), redb::Error> {
    let txn = db.begin_write()?;
    {
        let mut table = txn.open_table(RESOLUTIONS)?;
        table.remove(key)?;
    }
    txn.commit()?;
    Ok(())
}

fn reset_table(db: &Database) -> Result<(), redb::Error> {
    let txn = db.begin_write()?;
    txn.delete_table(RESOLUTIONS)?;
    txn.open_table(RESOLUTIONS)?;
    txn.commit()?;
    Ok(())
}

#[async_trait]
impl CacheStore for RedbCacheStore {
    async fn load(&self, url_hash: &str) -> Result<Option<CacheEntry>, CacheStoreError> {
        let key = url_hash.to_string();
        self.run(move |db| match read_entry(db, &key)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        })
        .await
    }

    async fn save(&self, entry: &CacheEntry) -> Result<(), CacheStoreError> {
        let key = entry.url_hash.clone();
        let value = serde_json::to_vec(entry)?;
        self.run(move |db| Ok(write_entry(db, &key, &value)?))
            .await
    }

    async fn remove(&self, url_hash: &str) -> Result<(), CacheStoreError> {
        let key = url_hash.to_string();
        self.run(move |db| Ok(delete_entry(db, &key)?)).await
    }

    async fn clear(&self) -> Result<(), CacheStoreError> {
        self.run(|db| Ok(reset_table(db)?)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use url::Url;

    fn sample() -> CacheEntry {
        CacheEntry::new(
            &Url::parse("https://short.test/x1").unwrap(),
            &Url::parse("https://dest.test/file.zip").unwrap(),
            "shortener",
        )
    }

    #[tokio::test]
    async fn redb_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.redb");
        let entry = sample();

        {
            let store = RedbCacheStore::open(&path).unwrap();
            store.save(&entry).await.unwrap();
        }

        let store = RedbCacheStore::open(&path).unwrap();
        let loaded = store.load(&entry.url_hash).await.unwrap().unwrap();
        assert_eq!(loaded.resolved_url, entry.resolved_url);
        assert_eq!(loaded.strategy_used, "shortener");

        store.remove(&entry.url_hash).await.unwrap();
        assert!(store.load(&entry.url_hash).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn redb_clear_empties_table() {
        let dir = tempfile::tempdir().unwrap();
        let store = RedbCacheStore::open(dir.path().join("c.redb")).unwrap();
        let entry = sample();
        store.save(&entry).await.unwrap();

        store.clear().await.unwrap();
        assert!(store.load(&entry.url_hash).await.unwrap().is_none());
    }
}
