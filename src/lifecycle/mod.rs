//! Install/activate state machine for one cache generation.
//!
//! ```text
//! Parsed -> Installing -> Installed -> Activating -> Active -> Redundant
//!               |
//!               +-> Failed
//! ```
//!
//! `install` populates the static store from the manifest as a single unit.
//! `activate` publishes the generation, evicts every store it does not own
//! and claims all open clients.

pub mod clients;

use std::{
    collections::HashSet,
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use arc_swap::ArcSwapOption;
use bytes::Bytes;
use futures::future::try_join_all;
use http::Request;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::{
    cache::{CacheEntry, CacheStoreManager, Generation, RequestKey},
    core::{CacheError, CacheResult},
    metrics::LIFECYCLE_TRANSITIONS,
    network::Fetcher,
};

pub use clients::{ClientId, ClientRegistry};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    Parsed,
    Installing,
    /// Installed and waiting to activate
    Installed,
    Activating,
    Active,
    Failed,
    /// Superseded by a newer generation or unregistered
    Redundant,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Parsed => "parsed",
            LifecycleState::Installing => "installing",
            LifecycleState::Installed => "installed",
            LifecycleState::Activating => "activating",
            LifecycleState::Active => "active",
            LifecycleState::Failed => "failed",
            LifecycleState::Redundant => "redundant",
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle events delivered by the host.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LifecycleEvent {
    Install,
    Activate,
}

/// Messages received on the control channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlMessage {
    SkipWaiting,
    /// Anything else, including malformed payloads
    Ignored,
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: Option<String>,
}

impl ControlMessage {
    pub fn parse(payload: &[u8]) -> Self {
        match serde_json::from_slice::<Envelope>(payload) {
            Ok(Envelope { kind: Some(kind) }) if kind == "SKIP_WAITING" => {
                ControlMessage::SkipWaiting
            }
            _ => ControlMessage::Ignored,
        }
    }
}

/// Drives one [`Generation`] through its lifecycle.
pub struct LifecycleController {
    generation: Generation,
    manifest: Vec<String>,
    stores: CacheStoreManager,
    fetcher: Arc<dyn Fetcher>,
    clients: Arc<ClientRegistry>,
    active: Arc<ArcSwapOption<Generation>>,
    state: Mutex<LifecycleState>,
    skip_waiting: AtomicBool,
}

impl LifecycleController {
    pub fn new(
        generation: Generation,
        manifest: Vec<String>,
        stores: CacheStoreManager,
        fetcher: Arc<dyn Fetcher>,
        clients: Arc<ClientRegistry>,
        active: Arc<ArcSwapOption<Generation>>,
    ) -> Self {
        Self {
            generation,
            manifest,
            stores,
            fetcher,
            clients,
            active,
            state: Mutex::new(LifecycleState::Parsed),
            skip_waiting: AtomicBool::new(false),
        }
    }

    pub fn generation(&self) -> &Generation {
        &self.generation
    }

    pub async fn state(&self) -> LifecycleState {
        *self.state.lock().await
    }

    pub fn skip_waiting_requested(&self) -> bool {
        self.skip_waiting.load(Ordering::SeqCst)
    }

    /// Move to `to` if the current state is one of `from`.
    async fn transition(&self, from: &[LifecycleState], to: LifecycleState) -> CacheResult<()> {
        let mut state = self.state.lock().await;
        if !from.contains(&*state) {
            return Err(CacheError::InvalidTransition(format!(
                "generation {}: {} -> {}",
                self.generation.version(),
                *state,
                to
            )));
        }
        *state = to;
        drop(state);
        self.record(to);
        Ok(())
    }

    async fn set_state(&self, to: LifecycleState) {
        *self.state.lock().await = to;
        self.record(to);
    }

    fn record(&self, state: LifecycleState) {
        log::info!("Generation {} is {}", self.generation.version(), state);
        LIFECYCLE_TRANSITIONS
            .with_label_values(&[state.as_str()])
            .inc();
    }

    pub async fn dispatch(&self, event: LifecycleEvent) -> CacheResult<()> {
        match event {
            LifecycleEvent::Install => self.install().await,
            LifecycleEvent::Activate => self.activate().await,
        }
    }

    /// Populate the static store with every manifest resource, or nothing.
    ///
    /// On failure the controller is `Failed`, a static store created by this
    /// attempt is deleted again and the active generation is untouched.
    pub async fn install(&self) -> CacheResult<()> {
        self.transition(&[LifecycleState::Parsed], LifecycleState::Installing)
            .await?;

        match self.populate_static_store().await {
            Ok(count) => {
                log::info!(
                    "Cached {count} manifest resources into {}",
                    self.generation.static_store()
                );
                self.set_state(LifecycleState::Installed).await;
                Ok(())
            }
            Err(e) => {
                log::error!("Install of generation {} failed: {e}", self.generation.version());
                self.set_state(LifecycleState::Failed).await;
                Err(match e {
                    CacheError::InstallFailure(_) => e,
                    other => CacheError::InstallFailure(other.to_string()),
                })
            }
        }
    }

    async fn fetch_manifest_entry(&self, path: &str) -> CacheResult<(RequestKey, Arc<CacheEntry>)> {
        let request = Request::get(path)
            .body(Bytes::new())
            .map_err(|e| CacheError::InstallFailure(format!("{path}: {e}")))?;
        let response = self
            .fetcher
            .fetch(&request)
            .await
            .map_err(|e| CacheError::InstallFailure(format!("{path}: {e}")))?;
        if !response.status().is_success() {
            return Err(CacheError::InstallFailure(format!(
                "{path} returned {}",
                response.status()
            )));
        }
        let entry = response
            .into_entry()
            .await
            .map_err(|e| CacheError::InstallFailure(format!("{path}: {e}")))?;
        Ok((RequestKey::get(path), Arc::new(entry)))
    }

    async fn populate_static_store(&self) -> CacheResult<usize> {
        let name = self.generation.static_store();
        let existed = self.stores.list_stores().await?.contains(name);

        // Everything is fetched and validated before the first write.
        let entries = try_join_all(
            self.manifest
                .iter()
                .map(|path| self.fetch_manifest_entry(path)),
        )
        .await?;

        let store = self.stores.open(name).await?;
        let mut written = 0;
        for (key, entry) in entries {
            match CacheStoreManager::put_into(&store, key, entry).await {
                Ok(_) => written += 1,
                Err(e) => {
                    if !existed {
                        if let Err(cleanup) = self.stores.delete_store(name).await {
                            log::error!("Failed to remove partial store {name}: {cleanup}");
                        }
                    }
                    return Err(e);
                }
            }
        }
        Ok(written)
    }

    /// Whether the default waiting policy lets this generation activate now.
    ///
    /// It may when no other generation is active or when no open client is
    /// still controlled by the active one.
    pub fn can_activate(&self) -> bool {
        match self.active.load_full() {
            None => true,
            Some(current) if current.version() == self.generation.version() => true,
            Some(current) => self.clients.controlled_by(current.version()) == 0,
        }
    }

    /// Activate an installed generation.
    ///
    /// Rejected while clients of the previous generation remain open, unless
    /// skip-waiting was requested.
    pub async fn activate(&self) -> CacheResult<()> {
        {
            let mut state = self.state.lock().await;
            if *state != LifecycleState::Installed {
                return Err(CacheError::InvalidTransition(format!(
                    "generation {}: {} -> {}",
                    self.generation.version(),
                    *state,
                    LifecycleState::Activating
                )));
            }
            if !self.skip_waiting_requested() && !self.can_activate() {
                return Err(CacheError::InvalidTransition(format!(
                    "generation {} is waiting for clients of the active generation",
                    self.generation.version()
                )));
            }
            *state = LifecycleState::Activating;
        }
        self.record(LifecycleState::Activating);
        self.commit().await;
        Ok(())
    }

    /// Take over from the stores a previous run left behind, without fetching.
    ///
    /// Only a static store holding every manifest resource is trusted. Returns
    /// whether the generation became active.
    pub async fn resume(&self) -> CacheResult<bool> {
        let cached: HashSet<RequestKey> = self
            .stores
            .keys(self.generation.static_store())
            .await?
            .into_iter()
            .collect();
        let missing = self
            .manifest
            .iter()
            .filter(|path| !cached.contains(&RequestKey::get(path)))
            .count();
        if missing > 0 {
            log::info!(
                "Store {} misses {missing} manifest resources, not resuming",
                self.generation.static_store()
            );
            return Ok(false);
        }

        self.transition(&[LifecycleState::Parsed], LifecycleState::Activating)
            .await?;
        self.commit().await;
        Ok(true)
    }

    /// Publish the generation, evict foreign stores, become active and claim
    /// every open client.
    async fn commit(&self) {
        let generation = Arc::new(self.generation.clone());
        self.stores.restore(&generation.store_names());
        if let Some(previous) = self.active.swap(Some(generation.clone())) {
            log::info!(
                "Generation {} replaces {}",
                generation.version(),
                previous.version()
            );
            // Requests still in flight under the previous generation must not
            // recreate its stores once they are gone.
            if previous.version() != generation.version() {
                self.stores.retire(&previous.store_names()).await;
            }
        }

        match self
            .stores
            .delete_stores(|name| !generation.owns(name))
            .await
        {
            Ok(evicted) if !evicted.is_empty() => log::info!("Evicted stores {evicted:?}"),
            Ok(_) => {}
            // Leftovers are retried by the next activation.
            Err(e) => log::error!("Failed to evict stale stores: {e}"),
        }

        self.set_state(LifecycleState::Active).await;
        let claimed = self.clients.claim_all(generation.version());
        log::info!(
            "Generation {} claimed {claimed} clients",
            generation.version()
        );
    }

    /// Skip the waiting policy.
    ///
    /// Activates immediately when installed; before that the request is
    /// remembered and honored once install succeeds. Returns whether this call
    /// activated the generation.
    pub async fn force_activate(&self) -> CacheResult<bool> {
        self.skip_waiting.store(true, Ordering::SeqCst);
        match self.state().await {
            LifecycleState::Installed => {
                self.activate().await?;
                Ok(true)
            }
            LifecycleState::Parsed
            | LifecycleState::Installing
            | LifecycleState::Activating
            | LifecycleState::Active => Ok(false),
            state @ (LifecycleState::Failed | LifecycleState::Redundant) => {
                Err(CacheError::InvalidTransition(format!(
                    "generation {} cannot skip waiting while {state}",
                    self.generation.version()
                )))
            }
        }
    }

    /// Returns whether the message activated the generation.
    pub async fn on_message(&self, message: ControlMessage) -> CacheResult<bool> {
        match message {
            ControlMessage::SkipWaiting => self.force_activate().await,
            ControlMessage::Ignored => Ok(false),
        }
    }

    pub async fn mark_redundant(&self) {
        let mut state = self.state.lock().await;
        if *state != LifecycleState::Redundant {
            *state = LifecycleState::Redundant;
            drop(state);
            self.record(LifecycleState::Redundant);
        }
    }
}
