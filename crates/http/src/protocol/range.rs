//! Byte-range request handling.
//!
//! A `Range: bytes=...` header is parsed into a [`RangeSet`]. The set is then
//! resolved against the actual content length of the response:
//!
//! - a set is *valid* when it is non-empty and every resolved range starts strictly
//!   after the end of the previous one (monotonic, non-overlapping);
//! - a set is *satisfiable* when at least one range starts inside the content, or a
//!   suffix range asks for a non-zero number of bytes.
//!
//! Invalid sets are ignored (the full content is served), unsatisfiable ones yield
//! `416 Range Not Satisfiable`.

use std::fmt;

const BYTES_UNIT: &str = "bytes";

/// One range as written by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteRangeSpec {
    /// `first-last`
    FromTo(u64, u64),
    /// `first-`
    AllFrom(u64),
    /// `-suffix_length`
    Last(u64),
}

/// A range resolved against a content length, both ends inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedRange {
    pub start: u64,
    pub end: u64,
}

impl ResolvedRange {
    #[inline]
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// `Content-Range` value for this range.
    pub fn content_range(&self, content_length: u64) -> String {
        format!("{BYTES_UNIT} {}-{}/{content_length}", self.start, self.end)
    }
}

impl ByteRangeSpec {
    /// Resolves the spec into `(start, end)` with `end` clamped to the last byte.
    ///
    /// The returned start may lie past the content, callers decide whether that is
    /// satisfiable.
    fn bounds(&self, content_length: u64) -> (u64, u64) {
        let last = content_length.saturating_sub(1);
        match *self {
            ByteRangeSpec::FromTo(first, end) => (first, end.min(last)),
            ByteRangeSpec::AllFrom(first) => (first, last),
            ByteRangeSpec::Last(suffix) => (content_length.saturating_sub(suffix), last),
        }
    }

    fn parse(spec: &str) -> Option<Self> {
        let (first, last) = spec.trim().split_once('-')?;
        let (first, last) = (first.trim(), last.trim());
        match (first.is_empty(), last.is_empty()) {
            (true, true) => None,
            (true, false) => Some(ByteRangeSpec::Last(last.parse().ok()?)),
            (false, true) => Some(ByteRangeSpec::AllFrom(first.parse().ok()?)),
            (false, false) => {
                let first = first.parse().ok()?;
                let last = last.parse().ok()?;
                if last < first {
                    return None;
                }
                Some(ByteRangeSpec::FromTo(first, last))
            }
        }
    }
}

impl fmt::Display for ByteRangeSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ByteRangeSpec::FromTo(first, last) => write!(f, "{first}-{last}"),
            ByteRangeSpec::AllFrom(first) => write!(f, "{first}-"),
            ByteRangeSpec::Last(suffix) => write!(f, "-{suffix}"),
        }
    }
}

/// The parsed value of a `Range` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeSet {
    specs: Vec<ByteRangeSpec>,
}

impl RangeSet {
    pub fn new(specs: Vec<ByteRangeSpec>) -> Self {
        Self { specs }
    }

    /// Parses `bytes=a-b,c-,-d`. Returns `None` for other units or malformed specs.
    pub fn parse(header: &str) -> Option<Self> {
        let (unit, specs) = header.trim().split_once('=')?;
        if !unit.trim().eq_ignore_ascii_case(BYTES_UNIT) {
            return None;
        }

        let specs = specs
            .split(',')
            .filter(|s| !s.trim().is_empty())
            .map(ByteRangeSpec::parse)
            .collect::<Option<Vec<_>>>()?;

        Some(Self { specs })
    }

    pub fn specs(&self) -> &[ByteRangeSpec] {
        &self.specs
    }

    /// Non-empty, and every resolved range starts strictly after the previous end.
    pub fn is_valid(&self, content_length: u64) -> bool {
        if self.specs.is_empty() {
            return false;
        }

        let mut previous_end: Option<u64> = None;
        for spec in &self.specs {
            let (start, end) = spec.bounds(content_length);
            if let Some(previous_end) = previous_end {
                if start <= previous_end {
                    return false;
                }
            }
            previous_end = Some(end);
        }
        true
    }

    /// At least one range starts inside the content, or a suffix range has non-zero length.
    pub fn is_satisfiable(&self, content_length: u64) -> bool {
        self.specs.iter().any(|spec| match *spec {
            ByteRangeSpec::Last(suffix) => suffix > 0,
            ByteRangeSpec::FromTo(first, _) | ByteRangeSpec::AllFrom(first) => first < content_length,
        })
    }

    /// The ranges that actually overlap the content, in request order.
    pub fn resolve(&self, content_length: u64) -> Vec<ResolvedRange> {
        if content_length == 0 {
            return Vec::new();
        }
        self.specs
            .iter()
            .map(|spec| spec.bounds(content_length))
            .filter(|(start, end)| start < &content_length && start <= end)
            .map(|(start, end)| ResolvedRange { start, end })
            .collect()
    }
}

/// `Content-Range` value of a 416 response.
pub fn unsatisfied_content_range(content_length: u64) -> String {
    format!("{BYTES_UNIT} */{content_length}")
}
