//! Response encoding pipeline.
//!
//! The head is encoded once, together with a [`BodyPlan`] describing how the body must be
//! transformed. Every body chunk then passes, in order, through:
//!
//! 1. discard, when the status forbids a body (warned), or silently for `HEAD` requests and replaced bodies
//! 2. content coding (gzip or deflate)
//! 3. range framing (a single range slice or `multipart/byteranges` parts)
//! 4. transfer framing (content-length, chunked, close-delimited)
//!
//! [`PayloadItem::Eof`] flushes every stage and terminates the body.

use std::io;

use bytes::{Bytes, BytesMut};
use tokio_util::codec::Encoder;
use tracing::{error, warn};

use crate::codec::body::{ContentEncoder, PayloadEncoder, RangeFramer};
use crate::codec::header::HeaderEncoder;
use crate::protocol::{ContentCoding, Message, PayloadItem, PayloadSize, ResponseHead, SendError, status_allows_body};

/// How the body following a response head is transformed onto the wire.
#[derive(Debug, Clone)]
pub struct BodyPlan {
    pub payload_size: PayloadSize,
    pub coding: Option<ContentCoding>,
    pub range: Option<RangeFramer>,
    pub discard_body: bool,
}

impl BodyPlan {
    pub fn new(payload_size: PayloadSize) -> Self {
        Self { payload_size, coding: None, range: None, discard_body: false }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Discard {
    Keep,
    Silent,
    Warn { warned: bool },
}

#[derive(Debug)]
struct Pipeline {
    discard: Discard,
    content: Option<ContentEncoder>,
    range: Option<RangeFramer>,
    payload: PayloadEncoder,
}

impl Pipeline {
    fn transform(&mut self, data: Bytes, dst: &mut BytesMut) -> Result<(), SendError> {
        let data = match &mut self.content {
            Some(encoder) => encoder.encode(&data)?,
            None => data,
        };
        self.frame(data, dst)
    }

    fn frame(&mut self, data: Bytes, dst: &mut BytesMut) -> Result<(), SendError> {
        match &mut self.range {
            Some(range) => {
                let mut framed = BytesMut::new();
                range.frame(&data, &mut framed);
                self.payload.encode(PayloadItem::Chunk(framed.freeze()), dst)
            }
            None => self.payload.encode(PayloadItem::Chunk(data), dst),
        }
    }

    fn finish(&mut self, dst: &mut BytesMut) -> Result<(), SendError> {
        if let Some(encoder) = self.content.take() {
            let tail = encoder.finish()?;
            self.frame(tail, dst)?;
        }
        if let Some(range) = &mut self.range {
            let mut closing = BytesMut::new();
            range.finish(&mut closing);
            self.payload.encode(PayloadItem::Chunk(closing.freeze()), dst)?;
        }
        self.payload.encode(PayloadItem::<Bytes>::Eof, dst)
    }
}

#[derive(Debug, Default)]
pub struct ResponseEncoder {
    pipeline: Option<Pipeline>,
    overflowed: bool,
}

impl ResponseEncoder {
    pub fn new() -> Self {
        Default::default()
    }

    /// Whether a head was encoded and its body isn't finished yet.
    pub fn in_body(&self) -> bool {
        self.pipeline.is_some()
    }

    /// Whether the last body carried bytes past its declared `Content-Length`.
    pub fn overflowed(&self) -> bool {
        self.overflowed || self.pipeline.as_ref().is_some_and(|p| p.payload.overflowed())
    }
}

impl Encoder<Message<(ResponseHead, BodyPlan)>> for ResponseEncoder {
    type Error = SendError;

    fn encode(&mut self, item: Message<(ResponseHead, BodyPlan)>, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match item {
            Message::Header((head, plan)) => {
                if self.pipeline.is_some() {
                    error!("expect payload item but receive response head");
                    return Err(io::Error::from(io::ErrorKind::InvalidInput).into());
                }

                let discard = if !status_allows_body(head.status()) {
                    Discard::Warn { warned: false }
                } else if plan.discard_body {
                    Discard::Silent
                } else {
                    Discard::Keep
                };

                self.overflowed = false;
                self.pipeline = Some(Pipeline {
                    discard,
                    content: plan.coding.map(ContentEncoder::new),
                    range: plan.range,
                    payload: plan.payload_size.into(),
                });
                HeaderEncoder.encode((head, plan.payload_size), dst)
            }

            Message::Payload(item) => {
                let Some(pipeline) = &mut self.pipeline else {
                    error!("expect response head but receive payload item");
                    return Err(io::Error::from(io::ErrorKind::InvalidInput).into());
                };

                match item {
                    PayloadItem::Chunk(data) if data.is_empty() => Ok(()),
                    PayloadItem::Chunk(data) => match pipeline.discard {
                        Discard::Keep => pipeline.transform(data, dst),
                        Discard::Silent => Ok(()),
                        Discard::Warn { warned } => {
                            if !warned {
                                warn!(len = data.len(), "discarding body of a response whose status forbids one");
                                pipeline.discard = Discard::Warn { warned: true };
                            }
                            Ok(())
                        }
                    },
                    PayloadItem::Eof => {
                        let result = match pipeline.discard {
                            Discard::Keep => pipeline.finish(dst),
                            _ => Ok(()),
                        };
                        self.overflowed = pipeline.payload.overflowed();
                        self.pipeline = None;
                        result
                    }
                }
            }
        }
    }
}
