use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use async_trait::async_trait;
use dashmap::DashMap;

use super::{CacheBackend, CacheEntry, CacheStore, RequestKey, StoreHandle};
use crate::core::CacheResult;

/// Process-local store backed by a `DashMap`.
pub struct MemoryStore {
    name: String,
    entries: DashMap<RequestKey, Arc<CacheEntry>>,
    evicted: AtomicBool,
}

impl MemoryStore {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            entries: DashMap::new(),
            evicted: AtomicBool::new(false),
        }
    }

    fn evict(&self) {
        self.evicted.store(true, Ordering::SeqCst);
        self.entries.clear();
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
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
        self.entries.insert(key, entry);
        Ok(())
    }

    async fn keys(&self) -> CacheResult<Vec<RequestKey>> {
        Ok(self.entries.iter().map(|e| e.key().clone()).collect())
    }
}

/// In-memory storage capability, used in tests and for `storage.type: memory`.
#[derive(Default)]
pub struct MemoryBackend {
    stores: DashMap<String, Arc<MemoryStore>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CacheBackend for MemoryBackend {
    async fn open(&self, name: &str) -> CacheResult<StoreHandle> {
        let store: StoreHandle = self
            .stores
            .entry(name.to_string())
            .or_insert_with(|| {
                log::debug!("Creating store {name}");
                Arc::new(MemoryStore::new(name))
            })
            .value()
            .clone();
        Ok(store)
    }

    async fn lookup(&self, name: &str) -> CacheResult<Option<StoreHandle>> {
        Ok(self
            .stores
            .get(name)
            .map(|store| store.value().clone() as StoreHandle))
    }

    async fn names(&self) -> CacheResult<Vec<String>> {
        let mut names: Vec<String> = self.stores.iter().map(|s| s.key().clone()).collect();
        names.sort();
        Ok(names)
    }

    async fn delete(&self, name: &str) -> CacheResult<bool> {
        match self.stores.remove(name) {
            Some((_, store)) => {
                store.evict();
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
