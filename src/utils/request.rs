use bytes::{Bytes, BytesMut};
use http::{HeaderName, Method, Request};
use once_cell::sync::Lazy;
use pingora_error::{ErrorType::InvalidHTTPHeader, OrErr, Result};
use pingora_http::RequestHeader;
use pingora_proxy::Session;

use crate::lifecycle::ClientId;

pub static HTTP_HEADER_X_CLIENT_ID: Lazy<HeaderName> =
    Lazy::new(|| HeaderName::from_static("x-client-id"));

/// Retrieves the value of a specific header from the request.
///
/// Returns `None` if the header is not present or its value is not valid UTF-8.
pub fn get_req_header_value<'a>(req_header: &'a RequestHeader, key: &str) -> Option<&'a str> {
    req_header
        .headers
        .get(key)
        .and_then(|value| value.to_str().ok())
}

/// Identifies the execution context a request belongs to.
///
/// Requests without an `x-client-id` header share the anonymous client.
pub fn client_id(req_header: &RequestHeader) -> ClientId {
    match get_req_header_value(req_header, HTTP_HEADER_X_CLIENT_ID.as_str()) {
        Some(id) if !id.trim().is_empty() => ClientId::new(id.trim()),
        _ => ClientId::anonymous(),
    }
}

/// Convert the downstream request into an owned `http::Request`.
///
/// The body is only read for methods that may carry one.
pub async fn read_request(session: &mut Session) -> Result<Request<Bytes>> {
    let header = session.req_header();
    let mut builder = Request::builder()
        .method(header.method.clone())
        .uri(header.uri.clone())
        .version(header.version);
    for (name, value) in header.headers.iter() {
        builder = builder.header(name, value);
    }

    let body = if header.method == Method::GET || header.method == Method::HEAD {
        Bytes::new()
    } else {
        let mut buf = BytesMut::new();
        while let Some(chunk) = session.read_request_body().await? {
            buf.extend_from_slice(&chunk);
        }
        buf.freeze()
    };

    builder
        .body(body)
        .or_err(InvalidHTTPHeader, "Failed to rebuild downstream request")
}
