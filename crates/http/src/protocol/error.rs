use std::io;

use http::StatusCode;
use thiserror::Error;

use crate::buffer::BufferError;
use crate::reactor::ReactorError;

/// Boxed error returned by handlers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Top-level error of the engine.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("request error: {source}")]
    RequestError {
        #[from]
        source: ParseError,
    },

    #[error("response error: {source}")]
    ResponseError {
        #[from]
        source: SendError,
    },

    #[error("reactor error: {source}")]
    Reactor {
        #[from]
        source: ReactorError,
    },

    #[error("usage error: {source}")]
    Usage {
        #[from]
        source: UsageError,
    },

    #[error("buffer error: {source}")]
    Buffer {
        #[from]
        source: BufferError,
    },

    #[error("handler failed: {0}")]
    Handler(BoxError),

    #[error("io error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },
}

/// Errors raised while reading and verifying a request.
///
/// Every variant maps onto the status code of the synthesized error response, see
/// [`ParseError::status`].
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("header size too large, current: {current_size} exceed the limit {max_size}")]
    TooLargeHeader { current_size: usize, max_size: usize },

    #[error("header number exceed the limit {max_num}")]
    TooManyHeaders { max_num: usize },

    #[error("invalid header: {reason}")]
    InvalidHeader { reason: String },

    #[error("invalid http version: {0:?}")]
    InvalidVersion(Option<u8>),

    #[error("invalid http method")]
    InvalidMethod,

    #[error("invalid http uri")]
    InvalidUri,

    #[error("invalid content-length header: {reason}")]
    InvalidContentLength { reason: String },

    #[error("invalid body: {reason}")]
    InvalidBody { reason: String },

    #[error("body size {size} exceed the limit {max_size}")]
    BodyTooLarge { size: u64, max_size: u64 },

    #[error("unsupported content-encoding: {coding}")]
    UnsupportedContentEncoding { coding: String },

    #[error("unsupported transfer-encoding: {coding}")]
    UnsupportedTransferEncoding { coding: String },

    #[error("content-range in requests is not implemented")]
    ContentRangeNotImplemented,

    #[error("host header {header} does not match request uri host {uri}")]
    HostMismatch { header: String, uri: String },

    #[error("missing host header")]
    MissingHost,

    #[error("io error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },
}

impl ParseError {
    pub fn too_large_header(current_size: usize, max_size: usize) -> Self {
        Self::TooLargeHeader { current_size, max_size }
    }

    pub fn too_many_headers(max_num: usize) -> Self {
        Self::TooManyHeaders { max_num }
    }

    pub fn invalid_header<S: ToString>(str: S) -> Self {
        Self::InvalidHeader { reason: str.to_string() }
    }

    pub fn invalid_body<S: ToString>(str: S) -> Self {
        Self::InvalidBody { reason: str.to_string() }
    }

    pub fn invalid_content_length<S: ToString>(str: S) -> Self {
        Self::InvalidContentLength { reason: str.to_string() }
    }

    pub fn body_too_large(size: u64, max_size: u64) -> Self {
        Self::BodyTooLarge { size, max_size }
    }

    pub fn unsupported_content_encoding<S: ToString>(coding: S) -> Self {
        Self::UnsupportedContentEncoding { coding: coding.to_string() }
    }

    pub fn unsupported_transfer_encoding<S: ToString>(coding: S) -> Self {
        Self::UnsupportedTransferEncoding { coding: coding.to_string() }
    }

    pub fn host_mismatch<H: ToString, U: ToString>(header: H, uri: U) -> Self {
        Self::HostMismatch { header: header.to_string(), uri: uri.to_string() }
    }

    pub fn io<E: Into<io::Error>>(e: E) -> Self {
        Self::Io { source: e.into() }
    }

    /// The status code of the response synthesized for this error.
    pub fn status(&self) -> StatusCode {
        match self {
            ParseError::BodyTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            ParseError::UnsupportedContentEncoding { .. } => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            ParseError::UnsupportedTransferEncoding { .. } | ParseError::ContentRangeNotImplemented => {
                StatusCode::NOT_IMPLEMENTED
            }
            _ => StatusCode::BAD_REQUEST,
        }
    }
}

/// Errors raised while sending a response.
#[derive(Error, Debug)]
pub enum SendError {
    #[error("invalid body: {reason}")]
    InvalidBody { reason: String },

    #[error("connection closed before the response was sent")]
    Closed,

    #[error("usage error: {source}")]
    Usage {
        #[from]
        source: UsageError,
    },

    #[error("io error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },
}

impl SendError {
    pub fn invalid_body<S: ToString>(str: S) -> Self {
        Self::InvalidBody { reason: str.to_string() }
    }

    pub fn io<E: Into<io::Error>>(e: E) -> Self {
        Self::Io { source: e.into() }
    }
}

impl From<BufferError> for SendError {
    fn from(e: BufferError) -> Self {
        match e {
            BufferError::Drain { source } => SendError::Io { source },
            other => SendError::invalid_body(other),
        }
    }
}

/// Misuse of the exchange API by a handler.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum UsageError {
    #[error("a write is already in flight on this connection")]
    WriteInFlight,

    #[error("response headers are already committed")]
    Committed,

    #[error("response is already finished")]
    Finished,

    #[error("exchange is already detached")]
    AlreadyDetached,

    #[error("blocking write on the reactor thread")]
    ReactorThread,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_of_parse_errors() {
        assert_eq!(ParseError::invalid_header("x").status(), StatusCode::BAD_REQUEST);
        assert_eq!(ParseError::too_many_headers(64).status(), StatusCode::BAD_REQUEST);
        assert_eq!(ParseError::body_too_large(10, 5).status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(ParseError::unsupported_content_encoding("br").status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
        assert_eq!(ParseError::unsupported_transfer_encoding("gzip").status(), StatusCode::NOT_IMPLEMENTED);
        assert_eq!(ParseError::ContentRangeNotImplemented.status(), StatusCode::NOT_IMPLEMENTED);
        assert_eq!(ParseError::host_mismatch("a", "b").status(), StatusCode::BAD_REQUEST);
    }
}
