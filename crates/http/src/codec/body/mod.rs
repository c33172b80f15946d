//! Message body codecs.
//!
//! Decoders turn request body framing (`Content-Length` or chunked) into
//! [`PayloadItem`](crate::protocol::PayloadItem)s. Encoders apply the response pipeline
//! stages below the header: content coding, range framing and transfer framing.

mod chunked_decoder;
mod chunked_encoder;
mod content_encoder;
mod length_decoder;
mod length_encoder;
mod payload_decoder;
mod payload_encoder;
mod range_framer;

pub use content_encoder::{ContentEncoder, inflate_gzip};
pub use payload_decoder::PayloadDecoder;
pub use payload_encoder::PayloadEncoder;
pub use range_framer::{RangeFramer, random_boundary};
