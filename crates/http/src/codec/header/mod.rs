//! Request head decoding and response head encoding.
//!
//! - [`HeaderDecoder`] parses the request line and headers, bounded by the configured
//!   header size and count, and selects the body framing.
//! - [`HeaderEncoder`] writes the status line and headers, with `Content-Length` and
//!   `Transfer-Encoding` derived from the committed payload size.

mod header_decoder;
mod header_encoder;

pub use header_decoder::{DEFAULT_MAX_HEADER_BYTES, DEFAULT_MAX_HEADERS, HeaderDecoder};
pub(crate) use header_decoder::transfer_codings;
pub use header_encoder::HeaderEncoder;
pub(crate) use header_encoder::FastWrite;
