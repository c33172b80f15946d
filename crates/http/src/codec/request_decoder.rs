//! Streaming request decoder.
//!
//! A [`RequestDecoder`] alternates between two phases: it decodes one request head with
//! the [`HeaderDecoder`], then the body announced by that head with a [`PayloadDecoder`],
//! until [`PayloadItem::Eof`]. Bytes of the next (pipelined) request are left in the source
//! buffer untouched.

use bytes::BytesMut;
use tokio_util::codec::Decoder;

use crate::codec::body::PayloadDecoder;
use crate::codec::header::HeaderDecoder;
use crate::protocol::{Message, ParseError, PayloadItem, PayloadSize, RequestHeader};

#[derive(Debug, Default)]
pub struct RequestDecoder {
    header_decoder: HeaderDecoder,
    payload_decoder: Option<PayloadDecoder>,
}

impl RequestDecoder {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn with_limits(max_header_bytes: usize, max_headers: usize) -> Self {
        Self { header_decoder: HeaderDecoder::new(max_header_bytes, max_headers), payload_decoder: None }
    }

    /// Whether a head was decoded and its body isn't finished yet.
    pub fn is_reading_body(&self) -> bool {
        self.payload_decoder.is_some()
    }

    /// Forgets the request in progress.
    pub fn reset(&mut self) {
        self.payload_decoder = None;
    }
}

impl Decoder for RequestDecoder {
    type Item = Message<(RequestHeader, PayloadSize)>;
    type Error = ParseError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(payload_decoder) = &mut self.payload_decoder {
            let message = match payload_decoder.decode(src)? {
                Some(item @ PayloadItem::Chunk(_)) => Some(Message::Payload(item)),
                Some(item @ PayloadItem::Eof) => {
                    self.payload_decoder = None;
                    Some(Message::Payload(item))
                }
                None => None,
            };
            return Ok(message);
        }

        let message = match self.header_decoder.decode(src)? {
            Some((header, payload_size)) => {
                self.payload_decoder = Some(payload_size.into());
                Some(Message::Header((header, payload_size)))
            }
            None => None,
        };
        Ok(message)
    }
}
