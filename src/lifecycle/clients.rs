use std::{
    fmt,
    time::{Duration, Instant},
};

use dashmap::DashMap;
use serde::Serialize;

const ANONYMOUS: &str = "anonymous";

/// Identity of an execution context served by the worker.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct ClientId(String);

impl ClientId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The client shared by every request that does not identify itself.
    pub fn anonymous() -> Self {
        Self(ANONYMOUS.to_string())
    }

    pub fn random() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

struct ClientState {
    controller: Option<String>,
    last_seen: Instant,
}

/// Open clients and the generation version controlling each of them.
///
/// A client opened while no generation is active stays uncontrolled until
/// it is claimed. Clients that stop sending requests are dropped by
/// [`expire_idle`](Self::expire_idle).
#[derive(Default)]
pub struct ClientRegistry {
    clients: DashMap<ClientId, ClientState>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `id` if unknown and return its controller.
    ///
    /// An already open client keeps its current controller and is marked as
    /// seen.
    pub fn open(&self, id: &ClientId, active: Option<&str>) -> Option<String> {
        let mut client = self.clients.entry(id.clone()).or_insert_with(|| {
            log::debug!("Client {id} opened (controller: {active:?})");
            ClientState {
                controller: active.map(str::to_string),
                last_seen: Instant::now(),
            }
        });
        client.last_seen = Instant::now();
        client.controller.clone()
    }

    pub fn close(&self, id: &ClientId) -> bool {
        self.clients.remove(id).is_some()
    }

    /// Close every client not seen for `max_idle`. Returns how many closed.
    pub fn expire_idle(&self, max_idle: Duration) -> usize {
        let before = self.clients.len();
        self.clients.retain(|id, client| {
            let keep = client.last_seen.elapsed() < max_idle;
            if !keep {
                log::debug!("Client {id} expired");
            }
            keep
        });
        before.saturating_sub(self.clients.len())
    }

    pub fn controller(&self, id: &ClientId) -> Option<String> {
        self.clients.get(id).and_then(|c| c.controller.clone())
    }

    /// Put every open client under `version`. Returns how many changed hands.
    pub fn claim_all(&self, version: &str) -> usize {
        let mut claimed = 0;
        for mut client in self.clients.iter_mut() {
            if client.controller.as_deref() != Some(version) {
                client.controller = Some(version.to_string());
                claimed += 1;
            }
        }
        claimed
    }

    pub fn controlled_by(&self, version: &str) -> usize {
        self.clients
            .iter()
            .filter(|c| c.controller.as_deref() == Some(version))
            .count()
    }

    /// Drop control of every client, leaving them open.
    pub fn release_all(&self) {
        for mut client in self.clients.iter_mut() {
            client.controller = None;
        }
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}
