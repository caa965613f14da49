//! Request interception.
//!
//! [`CacheWorker`] ties the router, the strategies and the lifecycle
//! controllers together. A host drives it with lifecycle calls
//! (`install`, `activate`, `post_message`) and hands every request to
//! [`CacheWorker::handle_fetch`].

pub mod router;
pub mod strategy;


use std::{collections::BTreeSet, sync::Arc, time::Duration};

use arc_swap::ArcSwapOption;
use bytes::Bytes;
use http::{Method, Request};
use serde::Serialize;

use crate::{
    cache::{CacheStoreManager, Generation},
    config,
    core::{CacheError, CacheResult},
    lifecycle::{ClientId, ClientRegistry, ControlMessage, LifecycleController, LifecycleState},
    network::Fetcher,
};

pub use router::{RequestRouter, Route};
pub use strategy::{CacheFirst, Intercepted, NetworkFirst, PendingWrite};

/// What the host should do with a request.
pub enum FetchOutcome {
    /// Not diverted; send it to the network as is.
    Passthrough(Request<Bytes>),
    Respond(Intercepted),
}

/// A request the worker has decided to answer, and the generation it is
/// answered under.
#[derive(Clone, Debug)]
pub struct Interception {
    generation: Arc<Generation>,
    route: Route,
}

impl Interception {
    pub fn generation(&self) -> &Generation {
        &self.generation
    }

    pub fn route(&self) -> Route {
        self.route
    }
}

/// Serializable view of the worker, served by the control channel.
#[derive(Debug, Serialize)]
pub struct WorkerState {
    pub active_version: Option<String>,
    pub active_state: Option<LifecycleState>,
    pub pending_version: Option<String>,
    pub pending_state: Option<LifecycleState>,
    pub stores: BTreeSet<String>,
    pub clients: usize,
}

pub struct CacheWorker {
    stores: CacheStoreManager,
    fetcher: Arc<dyn Fetcher>,
    router: RequestRouter,
    cache_first: CacheFirst,
    network_first: NetworkFirst,
    clients: Arc<ClientRegistry>,
    active: Arc<ArcSwapOption<Generation>>,
    current: ArcSwapOption<LifecycleController>,
    pending: ArcSwapOption<LifecycleController>,
    manifest: Vec<String>,
    skip_waiting_on_install: bool,
}

impl CacheWorker {
    pub fn new(
        stores: CacheStoreManager,
        fetcher: Arc<dyn Fetcher>,
        cfg: &config::Cache,
    ) -> CacheResult<Self> {
        Ok(Self {
            router: RequestRouter::from_config(cfg)?,
            cache_first: CacheFirst::new(stores.clone(), fetcher.clone()),
            network_first: NetworkFirst::new(stores.clone(), fetcher.clone()),
            stores,
            fetcher,
            clients: Arc::new(ClientRegistry::new()),
            active: Arc::new(ArcSwapOption::empty()),
            current: ArcSwapOption::empty(),
            pending: ArcSwapOption::empty(),
            manifest: cfg.manifest.clone(),
            skip_waiting_on_install: cfg.skip_waiting_on_install,
        })
    }

    pub fn stores(&self) -> &CacheStoreManager {
        &self.stores
    }

    pub fn clients(&self) -> &ClientRegistry {
        &self.clients
    }

    pub fn active_generation(&self) -> Option<Arc<Generation>> {
        self.active.load_full()
    }

    pub fn pending(&self) -> Option<Arc<LifecycleController>> {
        self.pending.load_full()
    }

    fn controller(&self, version: &str) -> Arc<LifecycleController> {
        Arc::new(LifecycleController::new(
            Generation::new(version),
            self.manifest.clone(),
            self.stores.clone(),
            self.fetcher.clone(),
            self.clients.clone(),
            self.active.clone(),
        ))
    }

    /// Register a new generation. A previously pending one is superseded.
    pub async fn register(&self, version: &str) -> Arc<LifecycleController> {
        let controller = self.controller(version);
        if let Some(previous) = self.pending.swap(Some(controller.clone())) {
            log::info!(
                "Generation {} superseded before activation",
                previous.generation().version()
            );
            previous.mark_redundant().await;
        }
        controller
    }

    fn pending_or_err(&self) -> CacheResult<Arc<LifecycleController>> {
        self.pending
            .load_full()
            .ok_or_else(|| CacheError::InvalidTransition("no generation is registered".to_string()))
    }

    /// Install the pending generation, activating it right away when
    /// skip-waiting applies.
    pub async fn install(&self) -> CacheResult<()> {
        let controller = self.pending_or_err()?;
        controller.install().await?;

        let skip = self.skip_waiting_on_install || controller.skip_waiting_requested();
        if skip && controller.force_activate().await? {
            self.promote(&controller).await;
        }
        Ok(())
    }

    /// Activate the pending generation under the waiting policy.
    pub async fn activate(&self) -> CacheResult<()> {
        let controller = self.pending_or_err()?;
        controller.activate().await?;
        self.promote(&controller).await;
        Ok(())
    }

    /// Register, install and (when allowed) activate `version`.
    pub async fn update(&self, version: &str) -> CacheResult<LifecycleState> {
        let controller = self.register(version).await;
        self.install().await?;
        Ok(controller.state().await)
    }

    async fn promote(&self, controller: &Arc<LifecycleController>) {
        if let Some(previous) = self.current.swap(Some(controller.clone())) {
            if !Arc::ptr_eq(&previous, controller) {
                previous.mark_redundant().await;
            }
        }
        let still_pending = self
            .pending
            .load_full()
            .is_some_and(|pending| Arc::ptr_eq(&pending, controller));
        if still_pending {
            self.pending.store(None);
        }
    }

    /// Handle a control-channel message.
    pub async fn post_message(&self, payload: &[u8]) -> CacheResult<ControlMessage> {
        let message = ControlMessage::parse(payload);
        match message {
            ControlMessage::SkipWaiting => match self.pending.load_full() {
                Some(controller) => {
                    if controller.on_message(message).await? {
                        self.promote(&controller).await;
                    }
                }
                None => log::debug!("SKIP_WAITING received with no generation waiting"),
            },
            ControlMessage::Ignored => log::debug!("Ignoring control message"),
        }
        Ok(message)
    }

    /// Decide from the request head whether the worker answers a request
    /// from `client`.
    ///
    /// Unhandled requests leave no trace; any other request registers the
    /// client. The decision is made once: [`respond`](Self::respond) answers
    /// under the generation resolved here even if it changes meanwhile.
    pub fn intercepts(&self, client: &ClientId, method: &Method, path: &str) -> Option<Interception> {
        let route = self.router.classify(method, path);
        if route == Route::Unhandled {
            return None;
        }

        let generation = self.active.load_full();
        let controller = self
            .clients
            .open(client, generation.as_ref().map(|g| g.version()));
        match (generation, controller) {
            (Some(generation), Some(_)) => Some(Interception { generation, route }),
            _ => {
                log::trace!("Client {client} is not controlled, passing through");
                None
            }
        }
    }

    /// Answer a request accepted by [`intercepts`](Self::intercepts).
    ///
    /// Only an uncached static asset whose network request fails yields an
    /// error.
    pub async fn respond(
        &self,
        interception: &Interception,
        request: Request<Bytes>,
    ) -> CacheResult<Intercepted> {
        log::debug!(
            "{} {} routed as {}",
            request.method(),
            request.uri(),
            interception.route
        );
        match interception.route {
            Route::Static => {
                self.cache_first
                    .execute(&interception.generation, request)
                    .await
            }
            Route::DynamicApi => Ok(self
                .network_first
                .execute(&interception.generation, request)
                .await),
            Route::Unhandled => Err(CacheError::Internal(format!(
                "{} is not intercepted",
                request.uri()
            ))),
        }
    }

    /// Resolve a request from `client`.
    ///
    /// Only an uncached static asset whose network request fails yields an
    /// error.
    pub async fn handle_fetch(
        &self,
        client: &ClientId,
        request: Request<Bytes>,
    ) -> CacheResult<FetchOutcome> {
        match self.intercepts(client, request.method(), request.uri().path()) {
            Some(interception) => Ok(FetchOutcome::Respond(
                self.respond(&interception, request).await?,
            )),
            None => Ok(FetchOutcome::Passthrough(request)),
        }
    }

    /// Activate the waiting generation if the waiting policy now allows it.
    pub async fn activate_if_ready(&self) -> CacheResult<bool> {
        let Some(controller) = self.pending.load_full() else {
            return Ok(false);
        };
        if controller.state().await != LifecycleState::Installed || !controller.can_activate() {
            return Ok(false);
        }
        controller.activate().await?;
        self.promote(&controller).await;
        Ok(true)
    }

    /// Close clients idle for `max_idle`, then let a waiting generation
    /// activate if nothing holds it back anymore.
    pub async fn expire_idle_clients(&self, max_idle: Duration) -> CacheResult<usize> {
        let expired = self.clients.expire_idle(max_idle);
        if expired > 0 {
            log::info!("Closed {expired} idle clients");
        }
        self.activate_if_ready().await?;
        Ok(expired)
    }

    /// Serve `version` from the stores of a previous run, if they hold the
    /// whole manifest. Nothing is fetched.
    pub async fn resume(&self, version: &str) -> CacheResult<bool> {
        if self.active.load().is_some() {
            return Ok(false);
        }
        let controller = self.controller(version);
        if !controller.resume().await? {
            return Ok(false);
        }
        self.current.store(Some(controller));
        Ok(true)
    }

    pub fn close_client(&self, client: &ClientId) -> bool {
        self.clients.close(client)
    }

    /// Stop intercepting. Stores are left in place.
    pub async fn unregister(&self) -> bool {
        let current = self.current.swap(None);
        let pending = self.pending.swap(None);
        self.active.store(None);
        self.clients.release_all();

        if let Some(pending) = &pending {
            pending.mark_redundant().await;
        }
        match current {
            Some(controller) => {
                controller.mark_redundant().await;
                log::info!(
                    "Unregistered generation {}",
                    controller.generation().version()
                );
                true
            }
            None => pending.is_some(),
        }
    }

    pub async fn state(&self) -> CacheResult<WorkerState> {
        let current = self.current.load_full();
        let pending = self.pending.load_full();
        Ok(WorkerState {
            active_version: self.active.load_full().map(|g| g.version().to_string()),
            active_state: match &current {
                Some(c) => Some(c.state().await),
                None => None,
            },
            pending_version: pending
                .as_ref()
                .map(|c| c.generation().version().to_string()),
            pending_state: match &pending {
                Some(c) => Some(c.state().await),
                None => None,
            },
            stores: self.stores.list_stores().await?,
            clients: self.clients.len(),
        })
    }
}
