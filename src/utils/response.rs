//! Response construction shared by the strategies, the gateway and the
//! control channel.

use bytes::Bytes;
use http::{header, HeaderValue, Method, Response, StatusCode};
use pingora_error::Result;
use pingora_http::ResponseHeader;
use pingora_proxy::Session;
use serde::Serialize;

use crate::cache::CacheEntry;

/// Standard content types
pub mod content_type {
    pub const TEXT_PLAIN: &str = "text/plain";
    pub const APPLICATION_JSON: &str = "application/json";
}

/// Message of the synthesized offline response.
pub const OFFLINE_MESSAGE: &str = "Sin conexión a internet";

#[derive(Serialize)]
struct OfflineBody<'a> {
    error: &'a str,
}

/// Where a response handed back to the host came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResponseSource {
    Cache,
    Network,
    Offline,
}

impl ResponseSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseSource::Cache => "cache",
            ResponseSource::Network => "network",
            ResponseSource::Offline => "offline",
        }
    }
}

/// Unified response builder for different response types
pub struct ResponseBuilder;

impl ResponseBuilder {
    /// Rebuild a response from a stored snapshot, byte for byte.
    pub fn from_entry(entry: &CacheEntry) -> Response<Bytes> {
        let mut response = Response::new(entry.body().clone());
        *response.status_mut() = entry.status();
        *response.headers_mut() = entry.headers().clone();
        response.extensions_mut().insert(ResponseSource::Cache);
        response
    }

    /// The deterministic 503 returned when an API call fails with nothing cached.
    pub fn offline() -> Response<Bytes> {
        let body = serde_json::to_vec(&OfflineBody {
            error: OFFLINE_MESSAGE,
        })
        .unwrap_or_default();

        let mut response = Response::new(Bytes::from(body));
        *response.status_mut() = StatusCode::SERVICE_UNAVAILABLE;
        response.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static(content_type::APPLICATION_JSON),
        );
        response.extensions_mut().insert(ResponseSource::Offline);
        response
    }

    /// Build an error HTTP Response for the control channel
    pub fn error_http(status: StatusCode, message: &str) -> Response<Vec<u8>> {
        Response::builder()
            .status(status)
            .header(header::CONTENT_TYPE, content_type::TEXT_PLAIN)
            .body(message.as_bytes().to_vec())
            .unwrap_or_else(|e| {
                log::error!("Failed to build error response: {}", e);
                let mut response = Response::new(b"Internal Server Error".to_vec());
                *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                response
            })
    }

    /// Empty `204 No Content`
    pub fn no_content() -> Response<Vec<u8>> {
        let mut response = Response::new(Vec::new());
        *response.status_mut() = StatusCode::NO_CONTENT;
        response
    }

    /// Build a JSON HTTP Response for the control channel
    pub fn json<T: Serialize>(status: StatusCode, data: &T) -> Response<Vec<u8>> {
        match serde_json::to_vec(data) {
            Ok(json_body) => Response::builder()
                .status(status)
                .header(header::CONTENT_TYPE, content_type::APPLICATION_JSON)
                .body(json_body)
                .unwrap_or_else(|e| {
                    log::error!("Failed to build JSON response: {}", e);
                    Self::error_http(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error")
                }),
            Err(e) => {
                log::error!("Failed to serialize JSON response: {}", e);
                Self::error_http(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "JSON serialization failed",
                )
            }
        }
    }

    /// Build a proxy ResponseHeader mirroring `response`
    ///
    /// The answer to a `HEAD` request keeps the `Content-Length` it carries,
    /// any other gets the length of its body.
    pub fn build_proxy_response(
        response: &Response<Bytes>,
        head_request: bool,
    ) -> Result<ResponseHeader> {
        let mut resp =
            ResponseHeader::build(response.status(), Some(response.headers().len() + 1))?;
        for (name, value) in response.headers() {
            if name == header::TRANSFER_ENCODING {
                continue;
            }
            if name == header::CONTENT_LENGTH && !head_request {
                continue;
            }
            resp.append_header(name.clone(), value.clone())?;
        }
        if !head_request {
            resp.insert_header(header::CONTENT_LENGTH, response.body().len().to_string())?;
        }
        Ok(resp)
    }

    /// Write an intercepted response to the downstream session
    pub async fn send_proxy_response(session: &mut Session, response: Response<Bytes>) -> Result<()> {
        let head_request = session.req_header().method == Method::HEAD;
        let resp = Self::build_proxy_response(&response, head_request)?;
        let body = response.into_body();
        let end_of_stream = head_request || body.is_empty();
        session
            .write_response_header(Box::new(resp), end_of_stream)
            .await?;

        if !end_of_stream {
            session.write_response_body(Some(body), true).await?;
        }

        Ok(())
    }
}
