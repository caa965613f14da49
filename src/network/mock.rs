//! Scripted [`Fetcher`] for tests.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex,
};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use http::{header, HeaderMap, HeaderValue, Request, StatusCode};
use tokio::sync::Notify;

use super::{Fetcher, NetworkResponse, Payload};
use crate::{core::CacheResult, network_error};

#[derive(Clone)]
enum Reply {
    Respond {
        status: StatusCode,
        headers: HeaderMap,
        body: Bytes,
    },
    Fail,
}

/// Answers by request target; unknown targets fail like an unreachable host.
#[derive(Default)]
pub struct MockFetcher {
    replies: DashMap<String, Reply>,
    calls: AtomicUsize,
    seen: Mutex<Vec<String>>,
    gates: DashMap<String, Arc<Notify>>,
}

impl MockFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(&self, target: &str, status: StatusCode, body: &str) -> &Self {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        self.replies.insert(
            target.to_string(),
            Reply::Respond {
                status,
                headers,
                body: Bytes::copy_from_slice(body.as_bytes()),
            },
        );
        self
    }

    pub fn respond_json(&self, target: &str, body: &str) -> &Self {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        self.replies.insert(
            target.to_string(),
            Reply::Respond {
                status: StatusCode::OK,
                headers,
                body: Bytes::copy_from_slice(body.as_bytes()),
            },
        );
        self
    }

    pub fn fail(&self, target: &str) -> &Self {
        self.replies.insert(target.to_string(), Reply::Fail);
        self
    }

    /// Hold requests to `target` until the returned gate is notified.
    pub fn hold(&self, target: &str) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.gates.insert(target.to_string(), gate.clone());
        gate
    }

    /// Every target now fails, as if the network went away.
    pub fn go_offline(&self) {
        for mut reply in self.replies.iter_mut() {
            *reply.value_mut() = Reply::Fail;
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn calls_to(&self, target: &str) -> usize {
        self.seen
            .lock()
            .unwrap()
            .iter()
            .filter(|t| t.as_str() == target)
            .count()
    }
}

#[async_trait]
impl Fetcher for MockFetcher {
    async fn fetch(&self, request: &Request<Bytes>) -> CacheResult<NetworkResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let target = request
            .uri()
            .path_and_query()
            .map_or_else(|| "/".to_string(), |pq| pq.to_string());
        self.seen.lock().unwrap().push(target.clone());

        let gate = self.gates.get(&target).map(|g| g.value().clone());
        if let Some(gate) = gate {
            gate.notified().await;
        }

        let reply = self.replies.get(&target).map(|r| r.value().clone());
        match reply {
            Some(Reply::Respond {
                status,
                headers,
                body,
            }) => Ok(NetworkResponse::new(status, headers, Payload::from_bytes(body))),
            Some(Reply::Fail) | None => Err(network_error!("{} is unreachable", target)),
        }
    }
}
