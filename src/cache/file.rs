//! Durable store backend.
//!
//! Layout: one directory per store under the configured root, one JSON
//! document per entry. File names are the hex SHA-256 of the request key, so
//! they stay short whatever the target; the key itself is kept in the
//! document. Bodies are base64 encoded. Writes go through a temp file and a
//! rename so a reader never sees a half-written entry.

use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::Bytes;
use dashmap::DashMap;
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::{fs, sync::Mutex};

use super::{CacheBackend, CacheEntry, CacheStore, RequestKey, StoreHandle};
use crate::{core::CacheResult, storage_error};

const ENTRY_SUFFIX: &str = ".json";

#[derive(Serialize, Deserialize)]
struct EntryRecord {
    method: String,
    target: String,
    status: u16,
    headers: Vec<(String, String)>,
    body: String,
    captured_at: u64,
}

impl EntryRecord {
    fn from_entry(key: &RequestKey, entry: &CacheEntry) -> Self {
        let headers = entry
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        Self {
            method: key.method().to_string(),
            target: key.target().to_string(),
            status: entry.status().as_u16(),
            headers,
            body: STANDARD.encode(entry.body()),
            captured_at: entry.captured_at(),
        }
    }

    fn into_entry(self) -> CacheResult<(RequestKey, CacheEntry)> {
        let key = RequestKey::from_parts(&self.method, &self.target)
            .ok_or_else(|| storage_error!("invalid method {} in record", self.method))?;
        let status = StatusCode::from_u16(self.status)
            .map_err(|e| storage_error!("invalid status {}: {}", self.status, e))?;

        let mut headers = HeaderMap::new();
        for (name, value) in self.headers {
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(&value),
            ) {
                (Ok(name), Ok(value)) => {
                    headers.append(name, value);
                }
                _ => log::warn!("Skipping malformed stored header {name}"),
            }
        }

        let body = STANDARD
            .decode(self.body.as_bytes())
            .map_err(|e| storage_error!("invalid body encoding: {}", e))?;

        Ok((
            key,
            CacheEntry::with_timestamp(status, headers, Bytes::from(body), self.captured_at),
        ))
    }
}

fn entry_file_name(key: &RequestKey) -> String {
    let digest = Sha256::digest(key.to_string().as_bytes());
    format!("{}{ENTRY_SUFFIX}", hex::encode(digest))
}

fn validate_store_name(name: &str) -> CacheResult<()> {
    if name.is_empty()
        || name == "."
        || name == ".."
        || name.contains(['/', '\\'])
        || name.starts_with('.')
    {
        return Err(storage_error!("invalid store name '{}'", name));
    }
    Ok(())
}

/// A store persisted as a directory of entry files, mirrored in memory.
pub struct FileStore {
    name: String,
    dir: PathBuf,
    entries: DashMap<RequestKey, Arc<CacheEntry>>,
    // Orders writes of one key on disk and in `entries` alike.
    writes: DashMap<RequestKey, Arc<Mutex<()>>>,
    evicted: AtomicBool,
}

impl FileStore {
    async fn load(name: &str, dir: PathBuf) -> CacheResult<Self> {
        fs::create_dir_all(&dir).await?;

        let entries = DashMap::new();
        let mut read_dir = fs::read_dir(&dir).await?;
        while let Some(item) = read_dir.next_entry().await? {
            let path = item.path();
            if !path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(ENTRY_SUFFIX))
            {
                continue;
            }

            let raw = fs::read(&path).await?;
            let record = serde_json::from_slice::<EntryRecord>(&raw)
                .map_err(crate::core::CacheError::from)
                .and_then(EntryRecord::into_entry);
            match record {
                Ok((key, entry)) => {
                    entries.insert(key, Arc::new(entry));
                }
                Err(e) => log::warn!("Ignoring unreadable entry {}: {e}", path.display()),
            }
        }

        log::debug!("Loaded store {name} with {} entries", entries.len());

        Ok(Self {
            name: name.to_string(),
            dir,
            entries,
            writes: DashMap::new(),
            evicted: AtomicBool::new(false),
        })
    }

    fn evict(&self) {
        self.evicted.store(true, Ordering::SeqCst);
        self.entries.clear();
    }
}

#[async_trait]
impl CacheStore for FileStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_evicted(&self) -> bool {
        self.evicted.load(Ordering::SeqCst)
    }

    async fn get(&self, key: &RequestKey) -> CacheResult<Option<Arc<CacheEntry>>> {
        if self.is_evicted() {
            return Ok(None);
        }
        Ok(self.entries.get(key).map(|entry| entry.value().clone()))
    }

    async fn insert(&self, key: RequestKey, entry: Arc<CacheEntry>) -> CacheResult<()> {
        if self.is_evicted() {
            log::debug!("Dropping write of {key} into evicted store {}", self.name);
            return Ok(());
        }

        let record = serde_json::to_vec(&EntryRecord::from_entry(&key, &entry))?;
        let lock = self.writes.entry(key.clone()).or_default().clone();
        let _write = lock.lock().await;

        let path = self.dir.join(entry_file_name(&key));
        let tmp = self
            .dir
            .join(format!(".{}.tmp", uuid::Uuid::new_v4().simple()));

        let written = async {
            fs::write(&tmp, &record).await?;
            fs::rename(&tmp, &path).await
        }
        .await;

        if let Err(e) = written {
            let _ = fs::remove_file(&tmp).await;
            // The directory disappears when the store is evicted mid-write.
            if self.is_evicted() {
                return Ok(());
            }
            return Err(e.into());
        }

        self.entries.insert(key, entry);
        Ok(())
    }

    async fn keys(&self) -> CacheResult<Vec<RequestKey>> {
        Ok(self.entries.iter().map(|e| e.key().clone()).collect())
    }
}

/// Storage capability persisted under a root directory.
pub struct FileBackend {
    root: PathBuf,
    opened: DashMap<String, Arc<FileStore>>,
    // Serializes create/delete of store directories.
    dirs: Mutex<()>,
}

impl FileBackend {
    pub async fn new<P: AsRef<Path>>(root: P) -> CacheResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await?;
        log::info!("Using file cache storage at {}", root.display());
        Ok(Self {
            root,
            opened: DashMap::new(),
            dirs: Mutex::new(()),
        })
    }

    fn store_dir(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }
}

#[async_trait]
impl CacheBackend for FileBackend {
    async fn open(&self, name: &str) -> CacheResult<StoreHandle> {
        validate_store_name(name)?;
        if let Some(store) = self.opened.get(name) {
            return Ok(store.value().clone() as StoreHandle);
        }

        let _guard = self.dirs.lock().await;
        // Another task may have opened it while we waited.
        if let Some(store) = self.opened.get(name) {
            return Ok(store.value().clone() as StoreHandle);
        }
        let store = Arc::new(FileStore::load(name, self.store_dir(name)).await?);
        self.opened.insert(name.to_string(), store.clone());
        Ok(store as StoreHandle)
    }

    async fn lookup(&self, name: &str) -> CacheResult<Option<StoreHandle>> {
        if validate_store_name(name).is_err() {
            return Ok(None);
        }
        if let Some(store) = self.opened.get(name) {
            return Ok(Some(store.value().clone() as StoreHandle));
        }
        if fs::metadata(self.store_dir(name))
            .await
            .is_ok_and(|m| m.is_dir())
        {
            return self.open(name).await.map(Some);
        }
        Ok(None)
    }

    async fn names(&self) -> CacheResult<Vec<String>> {
        let mut names = Vec::new();
        let mut read_dir = fs::read_dir(&self.root).await?;
        while let Some(item) = read_dir.next_entry().await? {
            if !item.file_type().await?.is_dir() {
                continue;
            }
            if let Some(name) = item.file_name().to_str() {
                if validate_store_name(name).is_ok() {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    async fn delete(&self, name: &str) -> CacheResult<bool> {
        if validate_store_name(name).is_err() {
            return Ok(false);
        }

        let _guard = self.dirs.lock().await;
        let opened = match self.opened.remove(name) {
            Some((_, store)) => {
                store.evict();
                true
            }
            None => false,
        };

        match fs::remove_dir_all(self.store_dir(name)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(opened),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use http::header;

    use super::*;

    fn entry(body: &'static str) -> Arc<CacheEntry> {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/javascript"),
        );
        Arc::new(CacheEntry::new(
            StatusCode::OK,
            headers,
            Bytes::from_static(body.as_bytes()),
        ))
    }

    #[tokio::test]
    async fn test_entries_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let key = RequestKey::get("/static/js/bundle.js?v=2");

        {
            let backend = FileBackend::new(dir.path()).await.unwrap();
            let store = backend.open("static-v1").await.unwrap();
            store.insert(key.clone(), entry("console.log(1)")).await.unwrap();
        }

        let backend = FileBackend::new(dir.path()).await.unwrap();
        assert_eq!(backend.names().await.unwrap(), vec!["static-v1".to_string()]);

        let store = backend.lookup("static-v1").await.unwrap().unwrap();
        let seen = store.get(&key).await.unwrap().unwrap();
        assert_eq!(seen.body().as_ref(), b"console.log(1)");
        assert_eq!(seen.status(), StatusCode::OK);
        assert_eq!(
            seen.headers().get(header::CONTENT_TYPE).unwrap(),
            "application/javascript"
        );
    }

    #[tokio::test]
    async fn test_long_target_is_stored() {
        let dir = tempfile::tempdir().unwrap();
        let target = format!("/api/simulate?params={}", "x".repeat(300));
        let key = RequestKey::get(&target);

        {
            let backend = FileBackend::new(dir.path()).await.unwrap();
            let store = backend.open("dynamic-v1").await.unwrap();
            store.insert(key.clone(), entry("{}")).await.unwrap();
        }

        let backend = FileBackend::new(dir.path()).await.unwrap();
        let store = backend.lookup("dynamic-v1").await.unwrap().unwrap();
        assert_eq!(store.get(&key).await.unwrap().unwrap().body().as_ref(), b"{}");
        assert_eq!(store.keys().await.unwrap(), vec![key.clone()]);
        assert_eq!(entry_file_name(&key).len(), 64 + ENTRY_SUFFIX.len());
    }

    #[tokio::test]
    async fn test_concurrent_writes_agree_with_disk() {
        let dir = tempfile::tempdir().unwrap();
        let key = RequestKey::get("/api/presets");
        let bodies = ["a", "b", "c", "d", "e", "f", "g", "h"];

        let backend = FileBackend::new(dir.path()).await.unwrap();
        let store = backend.open("dynamic-v1").await.unwrap();
        futures::future::try_join_all(
            bodies
                .iter()
                .map(|body| store.insert(key.clone(), entry(body))),
        )
        .await
        .unwrap();
        let in_memory = store.get(&key).await.unwrap().unwrap();

        let reopened = FileBackend::new(dir.path()).await.unwrap();
        let on_disk = reopened
            .lookup("dynamic-v1")
            .await
            .unwrap()
            .unwrap()
            .get(&key)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(in_memory.body(), on_disk.body());
    }

    #[tokio::test]
    async fn test_lookup_missing_store() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileBackend::new(dir.path()).await.unwrap();
        assert!(backend.lookup("dynamic-v1").await.unwrap().is_none());
        assert!(backend.lookup("../escape").await.unwrap().is_none());
        assert!(backend.names().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_store_name() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileBackend::new(dir.path()).await.unwrap();
        assert!(backend.open("a/b").await.is_err());
        assert!(backend.open("..").await.is_err());
    }

    #[tokio::test]
    async fn test_delete_removes_directory_and_tombstones_handle() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileBackend::new(dir.path()).await.unwrap();
        let store = backend.open("dynamic-v0").await.unwrap();

        assert!(backend.delete("dynamic-v0").await.unwrap());
        assert!(!dir.path().join("dynamic-v0").exists());

        let key = RequestKey::get("/api/presets");
        store.insert(key.clone(), entry("late")).await.unwrap();
        assert!(store.get(&key).await.unwrap().is_none());
        assert!(backend.names().await.unwrap().is_empty());
    }
}
