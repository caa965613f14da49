//! Retrieval strategies.
//!
//! [`CacheFirst`] serves the application shell and static assets, falling
//! back to the network only on a miss. [`NetworkFirst`] serves API calls,
//! falling back to the dynamic store and finally to a synthesized offline
//! response.

use std::sync::Arc;

use bytes::Bytes;
use http::{Request, Response};
use tokio::task::JoinHandle;

use super::router::Route;
use crate::{
    cache::{is_cacheable, CacheStoreManager, Generation, RequestKey, StoreHandle},
    core::CacheResult,
    metrics::STRATEGY_RESPONSES,
    network::{Fetcher, NetworkResponse},
    utils::response::{ResponseBuilder, ResponseSource},
};

/// Background persistence of a network response.
///
/// Dropping it detaches the task, which still runs to completion.
pub struct PendingWrite(JoinHandle<()>);

impl PendingWrite {
    /// Spawn the write of `response` into `store` under `key`.
    fn spawn(store: StoreHandle, key: RequestKey, response: NetworkResponse) -> Self {
        Self(tokio::spawn(async move {
            let entry = match response.into_entry().await {
                Ok(entry) => Arc::new(entry),
                Err(e) => {
                    log::error!("Failed to read response body of {key} for caching: {e}");
                    return;
                }
            };
            if let Err(e) = CacheStoreManager::put_into(&store, key.clone(), entry).await {
                log::error!("Failed to write {key} into {}: {e}", store.name());
            }
        }))
    }

    /// Wait for the write to finish.
    pub async fn completed(self) {
        if let Err(e) = self.0.await {
            log::error!("Cache write task failed: {e}");
        }
    }
}

/// A response produced by a strategy, with its in-flight persistence if any.
pub struct Intercepted {
    pub response: Response<Bytes>,
    pub pending_write: Option<PendingWrite>,
}

impl Intercepted {
    fn new(response: Response<Bytes>) -> Self {
        Self {
            response,
            pending_write: None,
        }
    }

    fn with_write(response: Response<Bytes>, pending_write: PendingWrite) -> Self {
        Self {
            response,
            pending_write: Some(pending_write),
        }
    }

    pub fn source(&self) -> Option<ResponseSource> {
        self.response.extensions().get::<ResponseSource>().copied()
    }

    pub fn into_response(self) -> Response<Bytes> {
        self.response
    }
}

fn record(route: Route, source: ResponseSource) {
    STRATEGY_RESPONSES
        .with_label_values(&[route.as_str(), source.as_str()])
        .inc();
}

async fn live_response(response: NetworkResponse) -> CacheResult<Response<Bytes>> {
    let mut response = response.into_response().await?;
    response.extensions_mut().insert(ResponseSource::Network);
    Ok(response)
}

/// Split an eligible response into a live copy and a background write.
///
/// The write only happens while `store_name` is live: once the generation the
/// request was resolved under has been superseded, its stores are retired and
/// the response is returned without being stored. A handle opened before the
/// eviction is tombstoned by it, so the write is dropped as well.
async fn persist_and_return(
    stores: &CacheStoreManager,
    store_name: &str,
    key: RequestKey,
    response: NetworkResponse,
) -> CacheResult<Intercepted> {
    if !is_cacheable(&key, response.status()) {
        return Ok(Intercepted::new(live_response(response).await?));
    }

    let store = match stores.open_if_live(store_name).await {
        Ok(Some(store)) => store,
        Ok(None) => {
            log::debug!("Store {store_name} was retired, not caching {key}");
            return Ok(Intercepted::new(live_response(response).await?));
        }
        Err(e) => {
            log::error!("Failed to open store {store_name} for {key}: {e}");
            return Ok(Intercepted::new(live_response(response).await?));
        }
    };

    let (live, copy) = response.duplicate().await?;
    let pending = PendingWrite::spawn(store, key, copy);
    Ok(Intercepted::with_write(live_response(live).await?, pending))
}

/// Stores first, network on miss.
pub struct CacheFirst {
    stores: CacheStoreManager,
    fetcher: Arc<dyn Fetcher>,
}

impl CacheFirst {
    pub fn new(stores: CacheStoreManager, fetcher: Arc<dyn Fetcher>) -> Self {
        Self { stores, fetcher }
    }

    /// Resolve `request` against `generation`.
    ///
    /// A network failure on a miss is returned unmodified.
    pub async fn execute(
        &self,
        generation: &Generation,
        request: Request<Bytes>,
    ) -> CacheResult<Intercepted> {
        let key = RequestKey::from_request(&request);

        match self
            .stores
            .match_entry(&generation.store_names(), &key)
            .await
        {
            Ok(Some(entry)) => {
                record(Route::Static, ResponseSource::Cache);
                return Ok(Intercepted::new(ResponseBuilder::from_entry(&entry)));
            }
            Ok(None) => log::debug!("Cache miss for {key}, fetching"),
            Err(e) => log::warn!("Lookup of {key} failed, fetching instead: {e}"),
        }

        let response = self.fetcher.fetch(&request).await.map_err(|e| {
            log::warn!("Fetching uncached {key} failed: {e}");
            e
        })?;

        let intercepted =
            persist_and_return(&self.stores, generation.dynamic_store(), key, response).await?;
        record(Route::Static, ResponseSource::Network);
        Ok(intercepted)
    }
}

/// Network first, then the dynamic store, then the offline response.
pub struct NetworkFirst {
    stores: CacheStoreManager,
    fetcher: Arc<dyn Fetcher>,
}

impl NetworkFirst {
    pub fn new(stores: CacheStoreManager, fetcher: Arc<dyn Fetcher>) -> Self {
        Self { stores, fetcher }
    }

    /// Never fails: every network failure degrades to a stored or synthesized
    /// response.
    pub async fn execute(&self, generation: &Generation, request: Request<Bytes>) -> Intercepted {
        let key = RequestKey::from_request(&request);

        let fetched = match self.fetcher.fetch(&request).await {
            Ok(response) => {
                persist_and_return(&self.stores, generation.dynamic_store(), key.clone(), response)
                    .await
            }
            Err(e) => Err(e),
        };

        match fetched {
            Ok(intercepted) => {
                record(Route::DynamicApi, ResponseSource::Network);
                intercepted
            }
            Err(e) => {
                log::warn!("Network request for {key} failed, trying cache: {e}");
                self.fallback(generation, &key).await
            }
        }
    }

    async fn fallback(&self, generation: &Generation, key: &RequestKey) -> Intercepted {
        match self
            .stores
            .match_entry(&[generation.dynamic_store()], key)
            .await
        {
            Ok(Some(entry)) => {
                record(Route::DynamicApi, ResponseSource::Cache);
                return Intercepted::new(ResponseBuilder::from_entry(&entry));
            }
            Ok(None) => log::debug!("No cached response for {key}"),
            Err(e) => log::error!("Fallback lookup of {key} failed: {e}"),
        }

        record(Route::DynamicApi, ResponseSource::Offline);
        Intercepted::new(ResponseBuilder::offline())
    }
}

#[cfg(test)]
mod tests {
    use http::{header, HeaderMap, Method, StatusCode};

    use super::*;
    use crate::{cache::CacheEntry, network::mock::MockFetcher};

    fn init_log() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn get(path: &str) -> Request<Bytes> {
        Request::builder()
            .method(Method::GET)
            .uri(path)
            .body(Bytes::new())
            .unwrap()
    }

    fn post(path: &str, body: &'static str) -> Request<Bytes> {
        Request::builder()
            .method(Method::POST)
            .uri(path)
            .body(Bytes::from_static(body.as_bytes()))
            .unwrap()
    }

    fn setup() -> (CacheStoreManager, Arc<MockFetcher>, Generation) {
        init_log();
        (
            CacheStoreManager::in_memory(),
            Arc::new(MockFetcher::new()),
            Generation::new("v1"),
        )
    }

    async fn seed(stores: &CacheStoreManager, store: &str, path: &str, body: &'static str) {
        let entry = CacheEntry::new(StatusCode::OK, HeaderMap::new(), Bytes::from_static(body.as_bytes()));
        stores
            .put(store, RequestKey::get(path), Arc::new(entry))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_cache_first_hit_skips_network() {
        let (stores, fetcher, generation) = setup();
        seed(&stores, "static-v1", "/static/js/bundle.js", "console.log(1)").await;
        fetcher.respond("/static/js/bundle.js", StatusCode::OK, "fresh");

        let strategy = CacheFirst::new(stores, fetcher.clone());
        let result = strategy
            .execute(&generation, get("/static/js/bundle.js"))
            .await
            .unwrap();

        assert_eq!(fetcher.calls(), 0);
        assert_eq!(result.source(), Some(ResponseSource::Cache));
        assert_eq!(result.response.body().as_ref(), b"console.log(1)");
        assert!(result.pending_write.is_none());
    }

    #[tokio::test]
    async fn test_cache_first_hit_in_dynamic_store() {
        let (stores, fetcher, generation) = setup();
        seed(&stores, "dynamic-v1", "/img/logo.png", "png").await;

        let strategy = CacheFirst::new(stores, fetcher.clone());
        let result = strategy.execute(&generation, get("/img/logo.png")).await.unwrap();
        assert_eq!(fetcher.calls(), 0);
        assert_eq!(result.response.body().as_ref(), b"png");
    }

    #[tokio::test]
    async fn test_cache_first_miss_persists_into_dynamic_store() {
        let (stores, fetcher, generation) = setup();
        fetcher.respond("/img/lung.png", StatusCode::OK, "image");

        let strategy = CacheFirst::new(stores.clone(), fetcher.clone());
        let result = strategy.execute(&generation, get("/img/lung.png")).await.unwrap();
        assert_eq!(result.source(), Some(ResponseSource::Network));
        assert_eq!(result.response.body().as_ref(), b"image");
        assert_eq!(
            result.response.headers().get(header::CONTENT_TYPE).unwrap(),
            "text/plain"
        );
        result.pending_write.unwrap().completed().await;

        let stored = stores
            .match_entry(&["dynamic-v1"], &RequestKey::get("/img/lung.png"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.body().as_ref(), b"image");

        // Served from the store from now on.
        let again = strategy.execute(&generation, get("/img/lung.png")).await.unwrap();
        assert_eq!(again.source(), Some(ResponseSource::Cache));
        assert_eq!(fetcher.calls(), 1);
    }

    #[tokio::test]
    async fn test_cache_first_does_not_persist_errors() {
        let (stores, fetcher, generation) = setup();
        fetcher.respond("/missing.css", StatusCode::NOT_FOUND, "not found");

        let strategy = CacheFirst::new(stores.clone(), fetcher.clone());
        let result = strategy.execute(&generation, get("/missing.css")).await.unwrap();
        assert_eq!(result.response.status(), StatusCode::NOT_FOUND);
        assert!(result.pending_write.is_none());
        assert!(stores.list_stores().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cache_first_network_failure_propagates() {
        let (stores, fetcher, generation) = setup();
        fetcher.fail("/static/css/main.css");

        let strategy = CacheFirst::new(stores, fetcher);
        let err = strategy
            .execute(&generation, get("/static/css/main.css"))
            .await
            .err()
            .unwrap();
        assert!(err.is_network());
    }

    #[tokio::test]
    async fn test_network_first_success_updates_store() {
        let (stores, fetcher, generation) = setup();
        seed(&stores, "dynamic-v1", "/api/presets", "[\"old\"]").await;
        fetcher.respond_json("/api/presets", "[\"new\"]");

        let strategy = NetworkFirst::new(stores.clone(), fetcher.clone());
        let result = strategy.execute(&generation, get("/api/presets")).await;
        assert_eq!(result.source(), Some(ResponseSource::Network));
        assert_eq!(result.response.body().as_ref(), b"[\"new\"]");
        result.pending_write.unwrap().completed().await;

        let stored = stores
            .match_entry(&["dynamic-v1"], &RequestKey::get("/api/presets"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.body().as_ref(), b"[\"new\"]");
    }

    #[tokio::test]
    async fn test_network_first_failure_returns_stored_entry() {
        let (stores, fetcher, generation) = setup();
        seed(&stores, "dynamic-v1", "/api/presets", "[\"cached\"]").await;
        fetcher.fail("/api/presets");

        let strategy = NetworkFirst::new(stores, fetcher);
        let result = strategy.execute(&generation, get("/api/presets")).await;
        assert_eq!(result.source(), Some(ResponseSource::Cache));
        assert_eq!(result.response.status(), StatusCode::OK);
        assert_eq!(result.response.body().as_ref(), b"[\"cached\"]");
    }

    #[tokio::test]
    async fn test_network_first_ignores_static_store_on_fallback() {
        let (stores, fetcher, generation) = setup();
        seed(&stores, "static-v1", "/api/presets", "static").await;

        let strategy = NetworkFirst::new(stores, fetcher);
        let result = strategy.execute(&generation, get("/api/presets")).await;
        assert_eq!(result.source(), Some(ResponseSource::Offline));
    }

    #[tokio::test]
    async fn test_network_first_offline_response() {
        let (stores, fetcher, generation) = setup();
        fetcher.fail("/api/simulate");

        let strategy = NetworkFirst::new(stores, fetcher);
        let result = strategy
            .execute(&generation, post("/api/simulate", "{\"tidal_volume\":500}"))
            .await;
        assert_eq!(result.source(), Some(ResponseSource::Offline));
        assert_eq!(result.response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            result.response.headers().get(header::CONTENT_TYPE).unwrap(),
            "application/json"
        );
        assert_eq!(
            result.response.body().as_ref(),
            "{\"error\":\"Sin conexión a internet\"}".as_bytes()
        );
    }

    #[tokio::test]
    async fn test_network_first_post_is_not_persisted() {
        let (stores, fetcher, generation) = setup();
        fetcher.respond_json("/api/simulate", "{\"pressure\":18}");

        let strategy = NetworkFirst::new(stores.clone(), fetcher);
        let result = strategy
            .execute(&generation, post("/api/simulate", "{}"))
            .await;
        assert_eq!(result.source(), Some(ResponseSource::Network));
        assert!(result.pending_write.is_none());
        assert!(stores.list_stores().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_network_first_returns_server_errors_live() {
        let (stores, fetcher, generation) = setup();
        seed(&stores, "dynamic-v1", "/api/presets", "[]").await;
        fetcher.respond("/api/presets", StatusCode::INTERNAL_SERVER_ERROR, "boom");

        let strategy = NetworkFirst::new(stores.clone(), fetcher);
        let result = strategy.execute(&generation, get("/api/presets")).await;
        assert_eq!(result.response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(result.source(), Some(ResponseSource::Network));

        let stored = stores
            .match_entry(&["dynamic-v1"], &RequestKey::get("/api/presets"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.body().as_ref(), b"[]");
    }

    #[tokio::test]
    async fn test_retired_store_is_not_written() {
        let (stores, fetcher, generation) = setup();
        fetcher.respond_json("/api/presets", "[1]");
        stores.retire(&generation.store_names()).await;

        let strategy = NetworkFirst::new(stores.clone(), fetcher);
        let result = strategy.execute(&generation, get("/api/presets")).await;
        assert_eq!(result.source(), Some(ResponseSource::Network));
        assert_eq!(result.response.body().as_ref(), b"[1]");
        assert!(result.pending_write.is_none());
        assert!(stores.list_stores().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_write_to_evicted_store_is_dropped() {
        let (stores, fetcher, generation) = setup();
        fetcher.respond_json("/api/presets", "[1]");
        // The request resolves its store before the generation is evicted.
        stores.open("dynamic-v1").await.unwrap();

        let strategy = NetworkFirst::new(stores.clone(), fetcher);
        let result = strategy.execute(&generation, get("/api/presets")).await;
        stores.delete_store("dynamic-v1").await.unwrap();
        result.pending_write.unwrap().completed().await;

        assert!(stores.list_stores().await.unwrap().is_empty());
    }
}
