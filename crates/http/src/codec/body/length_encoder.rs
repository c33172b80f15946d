//! Body encoding for responses with a declared `Content-Length`.

use bytes::{Buf, BytesMut};
use tokio_util::codec::Encoder;
use tracing::warn;

use crate::protocol::{PayloadItem, SendError};

/// Copies body bytes through until the declared length is reached.
///
/// Bytes past the declared length are dropped and remembered, the connection carrying them
/// can't be reused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LengthEncoder {
    remaining: u64,
    overflowed: bool,
}

impl LengthEncoder {
    pub fn new(length: u64) -> Self {
        Self { remaining: length, overflowed: false }
    }

    pub fn is_finish(&self) -> bool {
        self.remaining == 0
    }

    pub fn overflowed(&self) -> bool {
        self.overflowed
    }
}

impl<D: Buf> Encoder<PayloadItem<D>> for LengthEncoder {
    type Error = SendError;

    fn encode(&mut self, item: PayloadItem<D>, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let PayloadItem::Chunk(mut bytes) = item else {
            return Ok(());
        };

        let len = bytes.remaining() as u64;
        if len > self.remaining {
            warn!(declared_remaining = self.remaining, len, "discarding bytes past content-length");
            self.overflowed = true;
        }

        let mut take = len.min(self.remaining) as usize;
        self.remaining -= take as u64;
        while take > 0 {
            let chunk = bytes.chunk();
            let n = chunk.len().min(take);
            dst.extend_from_slice(&chunk[..n]);
            bytes.advance(n);
            take -= n;
        }
        Ok(())
    }
}
