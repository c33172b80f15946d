//! Content codings of message bodies.
//!
//! Response bodies are compressed incrementally: every chunk handed to
//! [`ContentEncoder::encode`] is pushed through the compressor and whatever output it
//! produced so far is taken out of the [`Writer`]. Request bodies are inflated in one go
//! once they are fully buffered.

use std::io;
use std::io::{Read, Write};

use bytes::{Bytes, BytesMut};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::{GzEncoder, ZlibEncoder};
use tracing::trace;

use crate::protocol::{ContentCoding, ParseError};

/// Growable sink the compressors write into.
pub(crate) struct Writer {
    buf: BytesMut,
}

impl Writer {
    fn new() -> Self {
        Self { buf: BytesMut::with_capacity(8 * 1024) }
    }

    fn take(&mut self) -> Bytes {
        self.buf.split().freeze()
    }
}

impl Write for Writer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

pub enum ContentEncoder {
    Gzip(GzEncoder<Writer>),
    Deflate(ZlibEncoder<Writer>),
}

impl std::fmt::Debug for ContentEncoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("ContentEncoder").field(&self.coding()).finish()
    }
}

impl ContentEncoder {
    pub fn new(coding: ContentCoding) -> Self {
        match coding {
            ContentCoding::Gzip => Self::Gzip(GzEncoder::new(Writer::new(), Compression::default())),
            ContentCoding::Deflate => Self::Deflate(ZlibEncoder::new(Writer::new(), Compression::default())),
        }
    }

    pub fn coding(&self) -> ContentCoding {
        match self {
            Self::Gzip(_) => ContentCoding::Gzip,
            Self::Deflate(_) => ContentCoding::Deflate,
        }
    }

    /// Compresses `data`, returning the compressed bytes available so far.
    pub fn encode(&mut self, data: &[u8]) -> io::Result<Bytes> {
        match self {
            Self::Gzip(encoder) => {
                encoder.write_all(data)?;
                Ok(encoder.get_mut().take())
            }
            Self::Deflate(encoder) => {
                encoder.write_all(data)?;
                Ok(encoder.get_mut().take())
            }
        }
    }

    /// Flushes the compressor, returning the trailing bytes of the stream.
    pub fn finish(self) -> io::Result<Bytes> {
        let mut writer = match self {
            Self::Gzip(encoder) => encoder.finish()?,
            Self::Deflate(encoder) => encoder.finish()?,
        };
        let tail = writer.take();
        trace!(len = tail.len(), "finished content encoding");
        Ok(tail)
    }
}

/// Inflates a gzip request body, refusing to produce more than `max_size` bytes.
pub fn inflate_gzip(body: &[u8], max_size: u64) -> Result<Bytes, ParseError> {
    let mut inflated = Vec::with_capacity(body.len().saturating_mul(2));
    GzDecoder::new(body)
        .take(max_size.saturating_add(1))
        .read_to_end(&mut inflated)
        .map_err(|e| ParseError::invalid_body(format!("gzip body: {e}")))?;

    let size = inflated.len() as u64;
    if size > max_size {
        return Err(ParseError::body_too_large(size, max_size));
    }
    Ok(Bytes::from(inflated))
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::ZlibDecoder;

    fn compress(coding: ContentCoding, parts: &[&[u8]]) -> Vec<u8> {
        let mut encoder = ContentEncoder::new(coding);
        let mut out = Vec::new();
        for part in parts {
            out.extend_from_slice(&encoder.encode(part).unwrap());
        }
        out.extend_from_slice(&encoder.finish().unwrap());
        out
    }

    #[test]
    fn gzip_round_trip() {
        let text = b"the quick brown fox jumps over the lazy dog ".repeat(50);
        let wire = compress(ContentCoding::Gzip, &[&text[..100], &text[100..], b""]);
        assert!(wire.len() < text.len());
        assert_eq!(&inflate_gzip(&wire, 1 << 20).unwrap()[..], &text[..]);
    }

    #[test]
    fn deflate_round_trip() {
        let text = b"0123456789".repeat(100);
        let wire = compress(ContentCoding::Deflate, &[&text]);
        let mut decoded = Vec::new();
        ZlibDecoder::new(&wire[..]).read_to_end(&mut decoded).unwrap();
        assert_eq!(decoded, text);
    }

    #[test]
    fn empty_input_round_trip() {
        let wire = compress(ContentCoding::Gzip, &[]);
        assert!(inflate_gzip(&wire, 10).unwrap().is_empty());
    }

    #[test]
    fn inflate_limits() {
        let wire = compress(ContentCoding::Gzip, &[&[b'a'; 1000]]);
        assert!(matches!(inflate_gzip(&wire, 999), Err(ParseError::BodyTooLarge { max_size: 999, .. })));
        assert!(matches!(inflate_gzip(b"not gzip", 100), Err(ParseError::InvalidBody { .. })));
    }
}
