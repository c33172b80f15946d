//! Wire codecs for HTTP/0.9 to HTTP/1.1.
//!
//! - Request side: [`RequestDecoder`] yields a head followed by body items, built on the
//!   header decoder and the length/chunked body decoders.
//! - Response side: [`ResponseEncoder`] writes a head and runs body chunks through content
//!   coding, range framing and transfer framing as described by a [`BodyPlan`].
//!
//! Both implement the `tokio_util::codec` `Decoder`/`Encoder` traits over `BytesMut`.

pub mod body;
pub mod header;
mod request_decoder;
mod response_encoder;

pub use request_decoder::RequestDecoder;
pub use response_encoder::{BodyPlan, ResponseEncoder};
