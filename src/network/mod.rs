//! Network transport seen by the strategies.
//!
//! A [`NetworkResponse`] carries a [`Payload`] that can be read exactly once.
//! Whoever needs both a copy to return and a copy to persist must call
//! [`NetworkResponse::duplicate`] before touching the body.

#[cfg(test)]
pub(crate) mod mock;
pub mod upstream;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::{
    future,
    stream::{self, BoxStream},
    Stream, StreamExt,
};
use http::{HeaderMap, Request, Response, StatusCode};

use crate::{cache::CacheEntry, core::CacheResult};

pub use upstream::UpstreamFetcher;

/// Single-consumption response body.
pub struct Payload {
    stream: BoxStream<'static, CacheResult<Bytes>>,
}

impl Payload {
    pub fn from_bytes<B: Into<Bytes>>(bytes: B) -> Self {
        Self::from_stream(stream::once(future::ready(Ok(bytes.into()))))
    }

    pub fn empty() -> Self {
        Self::from_stream(stream::empty())
    }

    pub fn from_stream<S>(stream: S) -> Self
    where
        S: Stream<Item = CacheResult<Bytes>> + Send + 'static,
    {
        Self {
            stream: stream.boxed(),
        }
    }

    /// Consume the payload. A failed chunk fails the whole read.
    pub async fn read_to_end(mut self) -> CacheResult<Bytes> {
        let mut buf = BytesMut::new();
        while let Some(chunk) = self.stream.next().await {
            buf.extend_from_slice(&chunk?);
        }
        Ok(buf.freeze())
    }
}

/// A live response from the network.
pub struct NetworkResponse {
    status: StatusCode,
    headers: HeaderMap,
    body: Payload,
}

impl NetworkResponse {
    pub fn new(status: StatusCode, headers: HeaderMap, body: Payload) -> Self {
        Self {
            status,
            headers,
            body,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Fan the single payload out into two independent, unread copies.
    ///
    /// Consumes `self`, so no copy can exist that was read before the split.
    pub async fn duplicate(self) -> CacheResult<(NetworkResponse, NetworkResponse)> {
        let body = self.body.read_to_end().await?;
        let copy = NetworkResponse::new(
            self.status,
            self.headers.clone(),
            Payload::from_bytes(body.clone()),
        );
        let original = NetworkResponse::new(self.status, self.headers, Payload::from_bytes(body));
        Ok((original, copy))
    }

    /// Snapshot this response for storage.
    pub async fn into_entry(self) -> CacheResult<CacheEntry> {
        let body = self.body.read_to_end().await?;
        Ok(CacheEntry::new(self.status, self.headers, body))
    }

    /// Hand the response over to the caller.
    pub async fn into_response(self) -> CacheResult<Response<Bytes>> {
        let body = self.body.read_to_end().await?;
        let mut response = Response::new(body);
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers;
        Ok(response)
    }
}

/// The transport capability. An `Err` is a network-level failure; any HTTP
/// status, including 5xx, is a successful fetch.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, request: &Request<Bytes>) -> CacheResult<NetworkResponse>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network_error;

    #[tokio::test]
    async fn test_duplicate_yields_independent_copies() {
        let chunks = vec![Ok(Bytes::from_static(b"{\"vt\":")), Ok(Bytes::from_static(b"500}"))];
        let response = NetworkResponse::new(
            StatusCode::OK,
            HeaderMap::new(),
            Payload::from_stream(stream::iter(chunks)),
        );

        let (live, stored) = response.duplicate().await.unwrap();
        let entry = stored.into_entry().await.unwrap();
        let live = live.into_response().await.unwrap();

        assert_eq!(live.status(), StatusCode::OK);
        assert_eq!(live.body().as_ref(), b"{\"vt\":500}");
        assert_eq!(entry.body(), live.body());
    }

    #[tokio::test]
    async fn test_broken_body_fails_duplicate() {
        let chunks = vec![
            Ok(Bytes::from_static(b"partial")),
            Err(network_error!("connection reset")),
        ];
        let response = NetworkResponse::new(
            StatusCode::OK,
            HeaderMap::new(),
            Payload::from_stream(stream::iter(chunks)),
        );

        let err = response.duplicate().await.err().unwrap();
        assert!(err.is_network());
    }

    #[tokio::test]
    async fn test_empty_payload() {
        assert!(Payload::empty().read_to_end().await.unwrap().is_empty());
    }
}
