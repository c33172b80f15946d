//! Partial-content framing of a response body.
//!
//! The framer sees the full body stream in order and tracks the position within it. A
//! single range passes through only the bytes inside it. Several ranges are written as a
//! `multipart/byteranges` body, each part introduced by its boundary and headers:
//!
//! ```text
//! --BOUNDARY
//! Content-Type: text/plain
//! Content-Range: bytes 0-9/100
//!
//! 0123456789
//! --BOUNDARY
//! ...
//! --BOUNDARY--
//! ```

use bytes::{BufMut, BytesMut};
use rand::Rng;
use rand::distr::Alphanumeric;

use crate::protocol::ResolvedRange;

const BOUNDARY_LEN: usize = 32;

/// A random multipart boundary.
pub fn random_boundary() -> String {
    rand::rng().sample_iter(&Alphanumeric).take(BOUNDARY_LEN).map(char::from).collect()
}

#[derive(Debug, Clone)]
struct Multipart {
    boundary: String,
    content_type: Option<String>,
    first_part: bool,
}

#[derive(Debug, Clone)]
pub struct RangeFramer {
    ranges: Vec<ResolvedRange>,
    content_length: u64,
    multipart: Option<Multipart>,
    position: u64,
    current: usize,
    part_open: bool,
}

impl RangeFramer {
    /// Frames a single range.
    pub fn single(range: ResolvedRange, content_length: u64) -> Self {
        Self::new(vec![range], content_length, None)
    }

    /// Frames several ranges as a multipart body.
    pub fn multipart(
        ranges: Vec<ResolvedRange>,
        content_length: u64,
        boundary: String,
        content_type: Option<String>,
    ) -> Self {
        Self::new(ranges, content_length, Some(Multipart { boundary, content_type, first_part: true }))
    }

    fn new(ranges: Vec<ResolvedRange>, content_length: u64, multipart: Option<Multipart>) -> Self {
        Self { ranges, content_length, multipart, position: 0, current: 0, part_open: false }
    }

    /// Position within the full body stream.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Writes the parts of `data` that fall inside the requested ranges.
    pub fn frame(&mut self, data: &[u8], dst: &mut BytesMut) {
        let start = self.position;
        let end = start + data.len() as u64;
        self.position = end;

        while let Some(range) = self.ranges.get(self.current).copied() {
            if range.start >= end {
                break;
            }

            let from = range.start.max(start);
            let to = (range.end + 1).min(end);
            if from < to {
                if !self.part_open {
                    self.open_part(range, dst);
                }
                dst.extend_from_slice(&data[(from - start) as usize..(to - start) as usize]);
            }

            if range.end < end {
                self.part_open = false;
                self.current += 1;
            } else {
                break;
            }
        }
    }

    /// Writes the closing boundary of a multipart body.
    pub fn finish(&mut self, dst: &mut BytesMut) {
        if let Some(multipart) = &self.multipart {
            dst.put_slice(b"\r\n--");
            dst.put_slice(multipart.boundary.as_bytes());
            dst.put_slice(b"--\r\n");
        }
    }

    fn open_part(&mut self, range: ResolvedRange, dst: &mut BytesMut) {
        self.part_open = true;
        let Some(multipart) = &mut self.multipart else {
            return;
        };

        if !multipart.first_part {
            dst.put_slice(b"\r\n");
        }
        multipart.first_part = false;

        dst.put_slice(b"--");
        dst.put_slice(multipart.boundary.as_bytes());
        dst.put_slice(b"\r\n");
        if let Some(content_type) = &multipart.content_type {
            dst.put_slice(b"Content-Type: ");
            dst.put_slice(content_type.as_bytes());
            dst.put_slice(b"\r\n");
        }
        dst.put_slice(b"Content-Range: ");
        dst.put_slice(range.content_range(self.content_length).as_bytes());
        dst.put_slice(b"\r\n\r\n");
    }
}
