use async_trait::async_trait;
use bytes::Bytes;
use futures::stream;
use http::{header, Request};
use pingora_core::{connectors::http::Connector, upstreams::peer::HttpPeer};
use pingora_http::RequestHeader;

use super::{Fetcher, NetworkResponse, Payload};
use crate::{config::Origin, core::CacheResult, network_error};

/// [`Fetcher`] that talks to the application origin over pingora's connector.
pub struct UpstreamFetcher {
    connector: Connector,
    peer: HttpPeer,
    address: String,
    host: String,
}

impl UpstreamFetcher {
    pub fn new(origin: &Origin) -> CacheResult<Self> {
        let addr = origin.socket_addr()?;
        Ok(Self {
            connector: Connector::new(None),
            peer: HttpPeer::new(addr, origin.tls, origin.sni.clone()),
            address: origin.address.clone(),
            host: origin.host_header(),
        })
    }

    fn build_request_header(&self, request: &Request<Bytes>) -> CacheResult<RequestHeader> {
        let path = request
            .uri()
            .path_and_query()
            .map_or("/", |pq| pq.as_str());

        let mut header = RequestHeader::build(request.method().clone(), path.as_bytes(), None)
            .map_err(|e| network_error!("invalid upstream request {}: {}", path, e))?;

        for (name, value) in request.headers() {
            // Framing is recomputed from the buffered body below.
            if name == header::CONTENT_LENGTH
                || name == header::TRANSFER_ENCODING
                || name == header::CONNECTION
            {
                continue;
            }
            header
                .append_header(name.clone(), value.clone())
                .map_err(|e| network_error!("invalid header {}: {}", name, e))?;
        }
        header
            .insert_header(header::HOST, self.host.as_str())
            .map_err(|e| network_error!("invalid host header: {}", e))?;
        if !request.body().is_empty() {
            header
                .insert_header(header::CONTENT_LENGTH, request.body().len().to_string())
                .map_err(|e| network_error!("invalid content length: {}", e))?;
        }

        Ok(header)
    }
}

#[async_trait]
impl Fetcher for UpstreamFetcher {
    async fn fetch(&self, request: &Request<Bytes>) -> CacheResult<NetworkResponse> {
        let header = self.build_request_header(request)?;

        let (mut session, reused) = self
            .connector
            .get_http_session(&self.peer)
            .await
            .map_err(|e| network_error!("connect to {} failed: {}", self.address, e))?;
        log::trace!("Fetching {} from {} (reused: {reused})", request.uri(), self.address);

        session
            .write_request_header(Box::new(header))
            .await
            .map_err(|e| network_error!("write request to {} failed: {}", self.address, e))?;
        if !request.body().is_empty() {
            session
                .write_request_body(request.body().clone(), true)
                .await
                .map_err(|e| network_error!("write body to {} failed: {}", self.address, e))?;
        }
        session
            .finish_request_body()
            .await
            .map_err(|e| network_error!("finish request to {} failed: {}", self.address, e))?;

        session
            .read_response_header()
            .await
            .map_err(|e| network_error!("read response from {} failed: {}", self.address, e))?;
        let (status, headers) = match session.response_header() {
            Some(resp) => (resp.status, resp.headers.clone()),
            None => return Err(network_error!("no response header from {}", self.address)),
        };

        // The body is streamed lazily and can only be read once.
        let address = self.address.clone();
        let body = stream::unfold(Some(session), move |state| {
            let address = address.clone();
            async move {
                let mut session = state?;
                match session.read_response_body().await {
                    Ok(Some(chunk)) => Some((Ok(chunk), Some(session))),
                    Ok(None) => None,
                    Err(e) => Some((
                        Err(network_error!("read body from {} failed: {}", address, e)),
                        None,
                    )),
                }
            }
        });

        Ok(NetworkResponse::new(status, headers, Payload::from_stream(body)))
    }
}
