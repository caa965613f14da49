use std::{collections::BTreeSet, sync::Arc};

use dashmap::DashSet;
use http::StatusCode;
use tokio::sync::RwLock;

use super::{CacheBackend, CacheEntry, MemoryBackend, RequestKey, StoreHandle};
use crate::{core::CacheResult, metrics::CACHE_LOOKUPS, metrics::CACHE_WRITES};

const STATIC_PREFIX: &str = "static";
const DYNAMIC_PREFIX: &str = "dynamic";

/// A version tag and the pair of store names it owns.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Generation {
    version: String,
    static_store: String,
    dynamic_store: String,
}

impl Generation {
    pub fn new(version: &str) -> Self {
        Self {
            version: version.to_string(),
            static_store: format!("{STATIC_PREFIX}-{version}"),
            dynamic_store: format!("{DYNAMIC_PREFIX}-{version}"),
        }
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn static_store(&self) -> &str {
        &self.static_store
    }

    pub fn dynamic_store(&self) -> &str {
        &self.dynamic_store
    }

    /// Both store names, static first.
    pub fn store_names(&self) -> [&str; 2] {
        [&self.static_store, &self.dynamic_store]
    }

    pub fn owns(&self, store_name: &str) -> bool {
        store_name == self.static_store || store_name == self.dynamic_store
    }
}

/// Only successful responses to read-only requests may be stored.
pub fn is_cacheable(key: &RequestKey, status: StatusCode) -> bool {
    key.is_read_only() && status.is_success()
}

/// Named stores over an injected [`CacheBackend`].
///
/// Names of superseded generations are retired: [`open_if_live`](Self::open_if_live)
/// refuses them, so a late write never recreates an evicted store.
#[derive(Clone)]
pub struct CacheStoreManager {
    backend: Arc<dyn CacheBackend>,
    retired: Arc<DashSet<String>>,
    // Held for writing while names are retired or deleted.
    eviction: Arc<RwLock<()>>,
}

impl CacheStoreManager {
    pub fn new(backend: Arc<dyn CacheBackend>) -> Self {
        Self {
            backend,
            retired: Arc::new(DashSet::new()),
            eviction: Arc::new(RwLock::new(())),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryBackend::new()))
    }

    /// Open `name`, creating it if absent. Handles with the same name share state.
    ///
    /// A retired name is brought back.
    pub async fn open(&self, name: &str) -> CacheResult<StoreHandle> {
        let _gate = self.eviction.read().await;
        self.retired.remove(name);
        self.backend.open(name).await
    }

    /// Open `name` unless it was retired, in which case `None` is returned and
    /// nothing is created.
    pub async fn open_if_live(&self, name: &str) -> CacheResult<Option<StoreHandle>> {
        let _gate = self.eviction.read().await;
        if self.retired.contains(name) {
            return Ok(None);
        }
        self.backend.open(name).await.map(Some)
    }

    /// Refuse further [`open_if_live`](Self::open_if_live) of `names`.
    ///
    /// Waits for opens already in progress.
    pub async fn retire(&self, names: &[&str]) {
        let _gate = self.eviction.write().await;
        for name in names {
            self.retired.insert(name.to_string());
        }
    }

    /// Make retired `names` openable again.
    pub fn restore(&self, names: &[&str]) {
        for name in names {
            self.retired.remove(*name);
        }
    }

    pub fn is_retired(&self, name: &str) -> bool {
        self.retired.contains(name)
    }

    /// Store `entry` under `key` in `store_name` if it is cacheable.
    ///
    /// Returns whether the entry was written.
    pub async fn put(
        &self,
        store_name: &str,
        key: RequestKey,
        entry: Arc<CacheEntry>,
    ) -> CacheResult<bool> {
        if !is_cacheable(&key, entry.status()) {
            log::trace!("Not storing {key} ({}) in {store_name}", entry.status());
            return Ok(false);
        }
        let store = self.open(store_name).await?;
        Self::put_into(&store, key, entry).await
    }

    /// Like [`put`](Self::put) but through an already opened handle.
    ///
    /// Used by writes that must land in the store resolved when the request
    /// started, even if a newer generation has been activated since.
    pub async fn put_into(
        store: &StoreHandle,
        key: RequestKey,
        entry: Arc<CacheEntry>,
    ) -> CacheResult<bool> {
        if !is_cacheable(&key, entry.status()) {
            return Ok(false);
        }
        if store.is_evicted() {
            log::debug!("Store {} was evicted, skipping write of {key}", store.name());
            return Ok(false);
        }
        store.insert(key, entry).await?;
        CACHE_WRITES.with_label_values(&[store.name()]).inc();
        Ok(true)
    }

    /// Look `key` up in `stores`, in order. Missing stores are skipped and
    /// never created.
    pub async fn match_entry(
        &self,
        stores: &[&str],
        key: &RequestKey,
    ) -> CacheResult<Option<Arc<CacheEntry>>> {
        for &name in stores {
            let Some(store) = self.backend.lookup(name).await? else {
                continue;
            };
            if let Some(entry) = store.get(key).await? {
                log::debug!("Cache hit for {key} in {name}");
                CACHE_LOOKUPS.with_label_values(&[name, "hit"]).inc();
                return Ok(Some(entry));
            }
            CACHE_LOOKUPS.with_label_values(&[name, "miss"]).inc();
        }
        Ok(None)
    }

    /// Look `key` up across every store, in name order.
    pub async fn match_all(&self, key: &RequestKey) -> CacheResult<Option<Arc<CacheEntry>>> {
        let names = self.backend.names().await?;
        let names: Vec<&str> = names.iter().map(String::as_str).collect();
        self.match_entry(&names, key).await
    }

    pub async fn list_stores(&self) -> CacheResult<BTreeSet<String>> {
        Ok(self.backend.names().await?.into_iter().collect())
    }

    /// Keys held by `store_name`, empty if the store does not exist.
    pub async fn keys(&self, store_name: &str) -> CacheResult<Vec<RequestKey>> {
        match self.backend.lookup(store_name).await? {
            Some(store) => store.keys().await,
            None => Ok(Vec::new()),
        }
    }

    /// Delete and retire every store whose name matches `predicate`.
    ///
    /// Returns the deleted names.
    pub async fn delete_stores<F>(&self, predicate: F) -> CacheResult<Vec<String>>
    where
        F: Fn(&str) -> bool + Send + Sync,
    {
        let _gate = self.eviction.write().await;
        let mut deleted = Vec::new();
        for name in self.backend.names().await? {
            if !predicate(&name) {
                continue;
            }
            self.retired.insert(name.clone());
            if self.backend.delete(&name).await? {
                log::info!("Deleted store {name}");
                deleted.push(name);
            }
        }
        Ok(deleted)
    }

    pub async fn delete_store(&self, name: &str) -> CacheResult<bool> {
        self.backend.delete(name).await
    }
}
