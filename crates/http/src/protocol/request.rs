//! HTTP request types.
//!
//! [`RequestHeader`] wraps the parsed `http::Request<()>` while the body is still being
//! read off the wire. Once the body is fully buffered the header is turned into a
//! [`Request`], which is what handlers see.

use std::net::SocketAddr;

use bytes::Bytes;
use http::header::{CONNECTION, EXPECT, HOST};
use http::request::Parts;
use http::{HeaderMap, HeaderValue, Method, StatusCode, Uri, Version};

/// A fully buffered request as passed to handlers.
pub type Request = http::Request<Bytes>;

/// Represents an HTTP request header.
#[derive(Debug)]
pub struct RequestHeader {
    inner: http::Request<()>,
}

impl AsRef<http::Request<()>> for RequestHeader {
    fn as_ref(&self) -> &http::Request<()> {
        &self.inner
    }
}

impl AsMut<http::Request<()>> for RequestHeader {
    fn as_mut(&mut self) -> &mut http::Request<()> {
        &mut self.inner
    }
}

impl RequestHeader {
    /// Consumes the header and returns the inner `Request<()>`.
    pub fn into_inner(self) -> http::Request<()> {
        self.inner
    }

    /// Attaches a body to this header, converting it into a full `Request<T>`.
    pub fn body<T>(self, body: T) -> http::Request<T> {
        self.inner.map(|_| body)
    }

    pub fn method(&self) -> &Method {
        self.inner.method()
    }

    pub fn uri(&self) -> &Uri {
        self.inner.uri()
    }

    pub fn version(&self) -> Version {
        self.inner.version()
    }

    pub fn headers(&self) -> &HeaderMap {
        self.inner.headers()
    }

    /// Whether the client sent `Expect: 100-continue`.
    pub fn expects_continue(&self) -> bool {
        self.version() == Version::HTTP_11
            && self.headers().get(EXPECT).is_some_and(|v| v.as_bytes().eq_ignore_ascii_case(b"100-continue"))
    }

    /// Whether the client asked for a persistent connection.
    pub fn wants_keep_alive(&self) -> bool {
        wants_keep_alive(self.version(), self.headers())
    }

    /// The host part of the `Host` header, without port.
    pub fn host(&self) -> Option<&str> {
        let value = self.headers().get(HOST)?.to_str().ok()?;
        Some(strip_port(value.trim()))
    }
}

/// Decides whether the request side of an exchange opted into persistence.
///
/// HTTP/1.1 is persistent unless `Connection: close`; HTTP/1.0 only with
/// `Connection: keep-alive`; HTTP/0.9 never.
pub fn wants_keep_alive(version: Version, headers: &HeaderMap) -> bool {
    match version {
        Version::HTTP_11 => !has_connection_token(headers, "close"),
        Version::HTTP_10 => has_connection_token(headers, "keep-alive"),
        _ => false,
    }
}

/// Checks whether any `Connection` header carries the given token.
pub fn has_connection_token(headers: &HeaderMap, token: &str) -> bool {
    headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|t| t.trim().eq_ignore_ascii_case(token))
}

fn strip_port(host: &str) -> &str {
    if host.starts_with('[') {
        // ipv6 literal
        return match host.find(']') {
            Some(end) => &host[..=end],
            None => host,
        };
    }
    match host.rfind(':') {
        Some(idx) => &host[..idx],
        None => host,
    }
}

impl From<Parts> for RequestHeader {
    #[inline]
    fn from(parts: Parts) -> Self {
        Self { inner: http::Request::from_parts(parts, ()) }
    }
}

impl From<http::Request<()>> for RequestHeader {
    #[inline]
    fn from(inner: http::Request<()>) -> Self {
        Self { inner }
    }
}

/// Request extension carrying the peer address of the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerAddr(pub SocketAddr);

/// Request extension present when a bad-request handler is invoked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BadRequest {
    pub status: StatusCode,
    pub reason: String,
}

/// Builds the placeholder request handed to a bad-request handler when the
/// request line itself could not be parsed.
pub(crate) fn placeholder_request(bad_request: BadRequest) -> Request {
    let mut request = http::Request::new(Bytes::new());
    request.headers_mut().insert(CONNECTION, HeaderValue::from_static("close"));
    request.extensions_mut().insert(bad_request);
    request
}
