//! Cache backend boundary: trait plus in-memory and filesystem stores.

use crate::keys::sanitize_key;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gantry_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

/// A stored cache entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
}

/// Content-addressed cache store.
///
/// `lookup_by_prefix` returns the most recent entry whose key starts with
/// the prefix. Recency only matters within a single prefix; ordering across
/// prefixes is the resolver's concern.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn lookup(&self, key: &str) -> Result<Option<CacheEntry>>;

    async fn lookup_by_prefix(&self, prefix: &str) -> Result<Option<CacheEntry>>;

    async fn store(&self, key: &str, content: &[u8]) -> Result<CacheEntry>;
}

/// In-memory store, used by tests and single-run local executions.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, (DateTime<Utc>, u64)>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an entry with an explicit creation time.
    pub fn insert_at(&self, key: &str, created_at: DateTime<Utc>) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.insert(key.to_string(), (created_at, 0));
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn lookup(&self, key: &str) -> Result<Option<CacheEntry>> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        Ok(entries.get(key).map(|(created_at, size)| CacheEntry {
            key: key.to_string(),
            size_bytes: *size,
            created_at: *created_at,
        }))
    }

    async fn lookup_by_prefix(&self, prefix: &str) -> Result<Option<CacheEntry>> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        Ok(entries
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .max_by_key(|(_, (created_at, _))| *created_at)
            .map(|(key, (created_at, size))| CacheEntry {
                key: key.clone(),
                size_bytes: *size,
                created_at: *created_at,
            }))
    }

    async fn store(&self, key: &str, content: &[u8]) -> Result<CacheEntry> {
        let entry = CacheEntry {
            key: key.to_string(),
            size_bytes: content.len() as u64,
            created_at: Utc::now(),
        };
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.insert(key.to_string(), (entry.created_at, entry.size_bytes));
        Ok(entry)
    }
}

/// Filesystem-backed store for local runs. One file per key.
pub struct FilesystemStore {
    root_dir: PathBuf,
}

impl FilesystemStore {
    pub fn new(root_dir: PathBuf) -> Self {
        Self { root_dir }
    }

    fn key_path(&self, key: &str) -> PathBuf {
        self.root_dir.join(sanitize_key(key))
    }

    async fn entry_for(&self, key: &str, path: &PathBuf) -> Result<CacheEntry> {
        let metadata = tokio::fs::metadata(path)
            .await
            .map_err(|e| Error::CacheBackend(format!("failed to stat cache entry: {}", e)))?;
        let created_at = metadata
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());
        Ok(CacheEntry {
            key: key.to_string(),
            size_bytes: metadata.len(),
            created_at,
        })
    }
}

#[async_trait]
impl CacheStore for FilesystemStore {
    async fn lookup(&self, key: &str) -> Result<Option<CacheEntry>> {
        let path = self.key_path(key);
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(self.entry_for(key, &path).await?))
    }

    async fn lookup_by_prefix(&self, prefix: &str) -> Result<Option<CacheEntry>> {
        if !self.root_dir.exists() {
            return Ok(None);
        }
        let sanitized = sanitize_key(prefix);
        let mut best: Option<CacheEntry> = None;

        let mut read_dir = tokio::fs::read_dir(&self.root_dir)
            .await
            .map_err(|e| Error::CacheBackend(format!("failed to read cache dir: {}", e)))?;
        while let Some(dirent) = read_dir
            .next_entry()
            .await
            .map_err(|e| Error::CacheBackend(format!("failed to read cache dir: {}", e)))?
        {
            let name = dirent.file_name().to_string_lossy().to_string();
            if !name.starts_with(&sanitized) {
                continue;
            }
            let entry = self.entry_for(&name, &dirent.path()).await?;
            let newer = best
                .as_ref()
                .is_none_or(|b| entry.created_at > b.created_at);
            if newer {
                best = Some(entry);
            }
        }
        Ok(best)
    }

    async fn store(&self, key: &str, content: &[u8]) -> Result<CacheEntry> {
        tokio::fs::create_dir_all(&self.root_dir)
            .await
            .map_err(|e| Error::CacheBackend(format!("failed to create cache dir: {}", e)))?;
        let path = self.key_path(key);
        tokio::fs::write(&path, content)
            .await
            .map_err(|e| Error::CacheBackend(format!("failed to write cache entry: {}", e)))?;
        self.entry_for(key, &path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[tokio::test]
    async fn test_memory_store_exact_lookup() {
        let store = MemoryStore::new();
        store.store("cargo-abc", b"x").await.unwrap();

        assert!(store.lookup("cargo-abc").await.unwrap().is_some());
        assert!(store.lookup("cargo-def").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_memory_store_prefix_returns_most_recent() {
        let store = MemoryStore::new();
        let base = Utc::now();
        store.insert_at("cargo-old", base - Duration::hours(2));
        store.insert_at("cargo-new", base - Duration::hours(1));

        let hit = store.lookup_by_prefix("cargo-").await.unwrap().unwrap();
        assert_eq!(hit.key, "cargo-new");
    }

    #[tokio::test]
    async fn test_memory_store_prefix_miss() {
        let store = MemoryStore::new();
        store.store("npm-abc", b"x").await.unwrap();
        assert!(store.lookup_by_prefix("cargo-").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_filesystem_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilesystemStore::new(dir.path().to_path_buf());

        store.store("deps-v1-aaaa", b"payload").await.unwrap();
        let entry = store.lookup("deps-v1-aaaa").await.unwrap().unwrap();
        assert_eq!(entry.size_bytes, 7);

        let by_prefix = store.lookup_by_prefix("deps-v1").await.unwrap().unwrap();
        assert_eq!(by_prefix.key, "deps-v1-aaaa");
        assert!(store.lookup_by_prefix("deps-v2").await.unwrap().is_none());
    }
}
