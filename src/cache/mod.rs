//! Cache Store Manager and the storage capability behind it.
//!
//! A store is a named mapping from [`RequestKey`] to an immutable
//! [`CacheEntry`]. Stores live in a [`CacheBackend`], which is injected into the
//! [`CacheStoreManager`] so the router and strategies can run against the
//! in-memory backend in tests and the file backend in production.

pub mod file;
pub mod manager;
pub mod memory;

use std::{
    fmt,
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, Method, Request, StatusCode, Uri};

use crate::{config, core::CacheResult};

pub use file::FileBackend;
pub use manager::{is_cacheable, CacheStoreManager, Generation};
pub use memory::MemoryBackend;

/// Normalized request identity: method plus canonicalized target path.
///
/// Scheme and authority are dropped, the query string is kept verbatim and an
/// empty path becomes `/`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RequestKey {
    method: Method,
    target: String,
}

impl RequestKey {
    pub fn new(method: Method, uri: &Uri) -> Self {
        Self {
            method,
            target: canonical_target(uri),
        }
    }

    pub fn from_request<B>(request: &Request<B>) -> Self {
        Self::new(request.method().clone(), request.uri())
    }

    /// Key for a read-only request to `path`, as used by the install manifest.
    pub fn get(path: &str) -> Self {
        let target = match path.parse::<Uri>() {
            Ok(uri) => canonical_target(&uri),
            Err(_) => path.to_string(),
        };
        Self {
            method: Method::GET,
            target,
        }
    }

    /// Rebuild a key from its stored parts.
    pub fn from_parts(method: &str, target: &str) -> Option<Self> {
        let method = method.parse::<Method>().ok()?;
        Some(Self {
            method,
            target: target.to_string(),
        })
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn is_read_only(&self) -> bool {
        self.method == Method::GET
    }
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.target)
    }
}

fn canonical_target(uri: &Uri) -> String {
    let path = match uri.path() {
        "" => "/",
        p => p,
    };
    match uri.query() {
        Some(q) if !q.is_empty() => format!("{path}?{q}"),
        _ => path.to_string(),
    }
}

/// Immutable snapshot of a response.
///
/// Entries are shared as `Arc<CacheEntry>` and replaced wholesale on the next
/// write for the same key.
#[derive(Clone, Debug, PartialEq)]
pub struct CacheEntry {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
    captured_at: u64,
}

impl CacheEntry {
    /// Snapshot a response captured now.
    pub fn new(status: StatusCode, headers: HeaderMap, body: Bytes) -> Self {
        Self::with_timestamp(status, headers, body, unix_millis())
    }

    pub fn with_timestamp(
        status: StatusCode,
        headers: HeaderMap,
        body: Bytes,
        captured_at: u64,
    ) -> Self {
        Self {
            status,
            headers,
            body,
            captured_at,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Capture time in unix milliseconds.
    pub fn captured_at(&self) -> u64 {
        self.captured_at
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Handle to an opened store. Handles opened with the same name share state.
pub type StoreHandle = Arc<dyn CacheStore>;

/// A single named store.
#[async_trait]
pub trait CacheStore: Send + Sync {
    fn name(&self) -> &str;

    /// Whether the store was deleted after this handle was obtained.
    fn is_evicted(&self) -> bool;

    async fn get(&self, key: &RequestKey) -> CacheResult<Option<Arc<CacheEntry>>>;

    /// Replace the entry for `key`. Writes to an evicted store are dropped.
    async fn insert(&self, key: RequestKey, entry: Arc<CacheEntry>) -> CacheResult<()>;

    async fn keys(&self) -> CacheResult<Vec<RequestKey>>;
}

/// Storage capability: the set of named stores.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Open `name`, creating it when absent.
    async fn open(&self, name: &str) -> CacheResult<StoreHandle>;

    /// Handle to `name` only if it already exists.
    async fn lookup(&self, name: &str) -> CacheResult<Option<StoreHandle>>;

    async fn names(&self) -> CacheResult<Vec<String>>;

    /// Delete `name`; returns whether it existed.
    async fn delete(&self, name: &str) -> CacheResult<bool>;
}

/// Build the backend selected by the storage configuration.
pub async fn build_backend(storage: &config::Storage) -> CacheResult<Arc<dyn CacheBackend>> {
    match storage {
        config::Storage::Memory => {
            log::info!("Using in-memory cache storage");
            Ok(Arc::new(MemoryBackend::new()))
        }
        config::Storage::File { path } => Ok(Arc::new(FileBackend::new(path).await?)),
    }
}
