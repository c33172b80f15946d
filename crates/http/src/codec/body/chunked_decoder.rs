//! Decoder for `Transfer-Encoding: chunked` request bodies.
//!
//! ```text
//! chunk      = chunk-size [ chunk-ext ] CRLF chunk-data CRLF
//! last-chunk = 1*("0") [ chunk-ext ] CRLF
//! trailer    = *( field-line CRLF ) CRLF
//! ```
//!
//! Chunk extensions and trailer fields are consumed and ignored. Bare LF is not accepted
//! anywhere in the framing.

use bytes::{Buf, BytesMut};
use tokio_util::codec::Decoder;
use tracing::trace;

use crate::protocol::{ParseError, PayloadItem};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Size,
    SizeWhitespace,
    Extension,
    SizeLf,
    Data,
    DataCr,
    DataLf,
    TrailerStart,
    Trailer,
    TrailerLf,
    EndLf,
    Done,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkedDecoder {
    state: State,
    remaining: u64,
    size_digits: usize,
}

impl Default for ChunkedDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkedDecoder {
    pub fn new() -> Self {
        Self { state: State::Size, remaining: 0, size_digits: 0 }
    }

    pub fn is_finish(&self) -> bool {
        self.state == State::Done
    }
}

fn framing_error(reason: &'static str) -> ParseError {
    ParseError::invalid_body(reason)
}

impl Decoder for ChunkedDecoder {
    type Item = PayloadItem;
    type Error = ParseError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            if self.state == State::Done {
                return Ok(Some(PayloadItem::Eof));
            }

            if self.state == State::Data {
                if src.is_empty() {
                    return Ok(None);
                }
                let n = self.remaining.min(src.len() as u64) as usize;
                self.remaining -= n as u64;
                if self.remaining == 0 {
                    self.state = State::DataCr;
                }
                trace!(len = n, "read chunk data");
                return Ok(Some(PayloadItem::Chunk(src.split_to(n).freeze())));
            }

            if !src.has_remaining() {
                return Ok(None);
            }
            let byte = src.get_u8();

            self.state = match (self.state, byte) {
                (State::Size, b) if b.is_ascii_hexdigit() => {
                    let digit = (b as char).to_digit(16).unwrap_or(0) as u64;
                    self.remaining = self
                        .remaining
                        .checked_mul(16)
                        .and_then(|r| r.checked_add(digit))
                        .ok_or_else(|| framing_error("chunk size overflow"))?;
                    self.size_digits += 1;
                    State::Size
                }
                (State::Size, _) if self.size_digits == 0 => return Err(framing_error("missing chunk size")),
                (State::Size | State::SizeWhitespace, b' ' | b'\t') => State::SizeWhitespace,
                (State::Size | State::SizeWhitespace, b';') => State::Extension,
                (State::Size | State::SizeWhitespace | State::Extension, b'\r') => State::SizeLf,
                (State::Size | State::SizeWhitespace, _) => return Err(framing_error("invalid chunk size line")),
                (State::Extension, b'\n') => return Err(framing_error("newline in chunk extension")),
                (State::Extension, _) => State::Extension,
                (State::SizeLf, b'\n') => {
                    self.size_digits = 0;
                    if self.remaining == 0 { State::TrailerStart } else { State::Data }
                }
                (State::SizeLf, _) => return Err(framing_error("expected LF after chunk size")),
                (State::DataCr, b'\r') => State::DataLf,
                (State::DataCr, _) => return Err(framing_error("expected CR after chunk data")),
                (State::DataLf, b'\n') => State::Size,
                (State::DataLf, _) => return Err(framing_error("expected LF after chunk data")),
                (State::TrailerStart, b'\r') => State::EndLf,
                (State::TrailerStart | State::Trailer, b'\r') => State::TrailerLf,
                (State::TrailerStart | State::Trailer, b'\n') => return Err(framing_error("bare LF in trailer")),
                (State::TrailerStart | State::Trailer, _) => State::Trailer,
                (State::TrailerLf, b'\n') => State::TrailerStart,
                (State::TrailerLf, _) => return Err(framing_error("expected LF after trailer field")),
                (State::EndLf, b'\n') => {
                    trace!("finished reading chunked body");
                    State::Done
                }
                (State::EndLf, _) => return Err(framing_error("expected LF after last chunk")),
                (State::Data | State::Done, _) => unreachable!("handled before reading a byte"),
            };
        }
    }
}
