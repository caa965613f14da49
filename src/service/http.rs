use std::{sync::Arc, time::Instant};

use async_trait::async_trait;
use http::header;
use pingora_core::upstreams::peer::HttpPeer;
use pingora_error::{Error, Result};
use pingora_http::RequestHeader;
use pingora_proxy::{ProxyHttp, Session};

use crate::{
    config::Origin,
    intercept::CacheWorker,
    lifecycle::ClientId,
    utils::{
        request::{client_id, read_request},
        response::{ResponseBuilder, ResponseSource},
    },
};

/// Per-request state of the gateway.
pub struct GatewayContext {
    pub client: ClientId,
    pub source: Option<ResponseSource>,
    pub request_start: Instant,
}

impl Default for GatewayContext {
    fn default() -> Self {
        Self {
            client: ClientId::anonymous(),
            source: None,
            request_start: Instant::now(),
        }
    }
}

/// Proxy service in front of the application origin.
///
/// Every downstream request is offered to the [`CacheWorker`]; what it does
/// not answer is proxied to the origin unchanged.
pub struct GatewayService {
    worker: Arc<CacheWorker>,
    peer: HttpPeer,
    host: String,
}

impl GatewayService {
    pub fn new(worker: Arc<CacheWorker>, origin: &Origin) -> Result<Self> {
        Ok(Self {
            worker,
            peer: HttpPeer::new(origin.socket_addr()?, origin.tls, origin.sni.clone()),
            host: origin.host_header(),
        })
    }
}

#[async_trait]
impl ProxyHttp for GatewayService {
    type CTX = GatewayContext;

    fn new_ctx(&self) -> Self::CTX {
        Self::CTX::default()
    }

    /// Everything not intercepted goes to the origin
    async fn upstream_peer(
        &self,
        _session: &mut Session,
        _ctx: &mut Self::CTX,
    ) -> Result<Box<HttpPeer>> {
        Ok(Box::new(self.peer.clone()))
    }

    /// Offer the request to the worker and answer it directly when intercepted
    async fn request_filter(&self, session: &mut Session, ctx: &mut Self::CTX) -> Result<bool> {
        ctx.client = client_id(session.req_header());

        // Keep the downstream body unread for requests that are proxied.
        let interception = {
            let req_header = session.req_header();
            self.worker
                .intercepts(&ctx.client, &req_header.method, req_header.uri.path())
        };
        let Some(interception) = interception else {
            return Ok(false);
        };

        let request = read_request(session).await?;
        let intercepted = self.worker.respond(&interception, request).await?;
        ctx.source = intercepted.source();
        // The write keeps running after the response is sent.
        let response = intercepted.into_response();
        ResponseBuilder::send_proxy_response(session, response).await?;
        Ok(true)
    }

    async fn upstream_request_filter(
        &self,
        _session: &mut Session,
        upstream_request: &mut RequestHeader,
        _ctx: &mut Self::CTX,
    ) -> Result<()> {
        upstream_request.insert_header(header::HOST, self.host.as_str())?;
        Ok(())
    }

    async fn logging(&self, session: &mut Session, e: Option<&Error>, ctx: &mut Self::CTX) {
        let req_header = session.req_header();
        let status = session
            .response_written()
            .map_or(0, |resp| resp.status.as_u16());
        let source = ctx.source.map_or("origin", |s| s.as_str());
        let elapsed = ctx.request_start.elapsed().as_millis();

        match e {
            Some(e) => log::warn!(
                "{} {} client={} status={status} source={source} {elapsed}ms error={e}",
                req_header.method,
                req_header.uri,
                ctx.client,
            ),
            None => log::info!(
                "{} {} client={} status={status} source={source} {elapsed}ms",
                req_header.method,
                req_header.uri,
                ctx.client,
            ),
        }
    }
}
