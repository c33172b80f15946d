//! Request body framing.
//!
//! A request body is either `Content-Length` delimited, chunked, or absent. Requests are never
//! delimited by the connection closing, so [`PayloadSize::UntilClose`] decodes as no body.

use bytes::BytesMut;
use tokio_util::codec::Decoder;

use crate::codec::body::chunked_decoder::ChunkedDecoder;
use crate::codec::body::length_decoder::LengthDecoder;
use crate::protocol::{ParseError, PayloadItem, PayloadSize};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PayloadDecoder {
    Length(LengthDecoder),
    Chunked(ChunkedDecoder),
    None,
}

impl PayloadDecoder {
    pub fn chunked() -> Self {
        PayloadDecoder::Chunked(ChunkedDecoder::new())
    }
}

impl From<PayloadSize> for PayloadDecoder {
    fn from(size: PayloadSize) -> Self {
        match size {
            PayloadSize::Length(n) => PayloadDecoder::Length(LengthDecoder::new(n)),
            PayloadSize::Chunked => PayloadDecoder::chunked(),
            PayloadSize::UntilClose | PayloadSize::Empty => PayloadDecoder::None,
        }
    }
}

impl Decoder for PayloadDecoder {
    type Item = PayloadItem;
    type Error = ParseError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self {
            PayloadDecoder::Length(decoder) => decoder.decode(src),
            PayloadDecoder::Chunked(decoder) => decoder.decode(src),
            PayloadDecoder::None => Ok(Some(PayloadItem::Eof)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn framing_follows_the_head() {
        let mut bytes = BytesMut::from(&b"abcdef"[..]);

        let mut none = PayloadDecoder::from(PayloadSize::UntilClose);
        assert_eq!(none.decode(&mut bytes).unwrap(), Some(PayloadItem::Eof));
        assert_eq!(bytes.len(), 6);

        let mut length = PayloadDecoder::from(PayloadSize::Length(4));
        assert_eq!(length.decode(&mut bytes).unwrap(), Some(PayloadItem::Chunk("abcd".into())));
        assert_eq!(length.decode(&mut bytes).unwrap(), Some(PayloadItem::Eof));
        assert_eq!(&bytes[..], b"ef");
    }
}
