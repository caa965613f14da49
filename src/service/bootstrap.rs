use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use pingora_core::{server::ShutdownWatch, services::background::BackgroundService};
use tokio::time::{interval, sleep};

use crate::{core::CacheError, intercept::CacheWorker};

const RETRY_INTERVAL: Duration = Duration::from_secs(3);

/// Installs the configured generation once the server is running.
///
/// Requests are proxied untouched until the install succeeds. A failed
/// install is retried with a fresh registration until shutdown.
pub struct WorkerBootstrap {
    worker: Arc<CacheWorker>,
    version: String,
}

impl WorkerBootstrap {
    pub fn new(worker: Arc<CacheWorker>, version: &str) -> Self {
        Self {
            worker,
            version: version.to_string(),
        }
    }
}

#[async_trait]
impl BackgroundService for WorkerBootstrap {
    async fn start(&self, shutdown: ShutdownWatch) {
        loop {
            if *shutdown.borrow() {
                return;
            }

            log::info!("Installing generation {}...", self.version);
            match self.worker.update(&self.version).await {
                Ok(state) => {
                    log::info!("Generation {} is {state}", self.version);
                    return;
                }
                Err(e @ CacheError::InstallFailure(_)) => {
                    log::error!("{e}, retrying in {}s", RETRY_INTERVAL.as_secs());
                    sleep(RETRY_INTERVAL).await;
                }
                Err(e) => {
                    log::error!("Failed to bring up generation {}: {e}", self.version);
                    return;
                }
            }
        }
    }
}

/// Periodically closes clients that stopped sending requests.
///
/// A generation waiting on such clients activates once they are gone.
pub struct ClientExpiry {
    worker: Arc<CacheWorker>,
    max_idle: Duration,
}

impl ClientExpiry {
    pub fn new(worker: Arc<CacheWorker>, max_idle: Duration) -> Self {
        Self { worker, max_idle }
    }

    fn sweep_interval(&self) -> Duration {
        (self.max_idle / 2).max(Duration::from_secs(1))
    }
}

#[async_trait]
impl BackgroundService for ClientExpiry {
    async fn start(&self, mut shutdown: ShutdownWatch) {
        let mut ticker = interval(self.sweep_interval());
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return;
                    }
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.worker.expire_idle_clients(self.max_idle).await {
                        log::warn!("Failed to expire idle clients: {e}");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{cache::CacheStoreManager, config, network::mock::MockFetcher};

    fn worker() -> Arc<CacheWorker> {
        let worker = CacheWorker::new(
            CacheStoreManager::in_memory(),
            Arc::new(MockFetcher::new()),
            &config::Cache::default(),
        )
        .unwrap();
        Arc::new(worker)
    }

    #[test]
    fn test_sweep_interval() {
        let expiry = ClientExpiry::new(worker(), Duration::from_secs(1800));
        assert_eq!(expiry.sweep_interval(), Duration::from_secs(900));

        let expiry = ClientExpiry::new(worker(), Duration::from_millis(10));
        assert_eq!(expiry.sweep_interval(), Duration::from_secs(1));
    }
}
