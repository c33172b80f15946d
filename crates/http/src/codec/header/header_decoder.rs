//! Request line and header decoding.
//!
//! The decoder works in these stages:
//!
//! 1. skip empty lines preceding the request line
//! 2. recognise HTTP/0.9 simple requests (`GET /path` with no version)
//! 3. wait for the complete header block, unfolding obsolete continuation lines
//! 4. parse it with `httparse` and record header name/value byte ranges
//! 5. build an `http::Request<()>` sharing the header bytes, and select the body framing
//!
//! Both the byte size of the header block and the number of headers are bounded.

use bytes::BytesMut;
use http::header::{CONTENT_LENGTH, TRANSFER_ENCODING};
use http::{HeaderMap, HeaderName, HeaderValue, Method, Request, Uri, Version};
use httparse::{Error, Status};
use tokio_util::codec::Decoder;
use tracing::trace;

use crate::ensure;
use crate::protocol::{ParseError, PayloadSize, RequestHeader};

pub const DEFAULT_MAX_HEADER_BYTES: usize = 8 * 1024;
pub const DEFAULT_MAX_HEADERS: usize = 64;

/// Decodes a request head into a [`RequestHeader`] plus the framing of its body.
#[derive(Debug, Clone, Copy)]
pub struct HeaderDecoder {
    max_header_bytes: usize,
    max_headers: usize,
}

impl Default for HeaderDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_HEADER_BYTES, DEFAULT_MAX_HEADERS)
    }
}

impl HeaderDecoder {
    pub fn new(max_header_bytes: usize, max_headers: usize) -> Self {
        Self { max_header_bytes, max_headers: max_headers.max(1) }
    }
}

impl Decoder for HeaderDecoder {
    type Item = (RequestHeader, PayloadSize);
    type Error = ParseError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        skip_empty_lines(src);
        if src.is_empty() {
            return Ok(None);
        }

        let Some(line_end) = src.iter().position(|b| *b == b'\n') else {
            ensure!(src.len() <= self.max_header_bytes, ParseError::too_large_header(src.len(), self.max_header_bytes));
            return Ok(None);
        };

        if let Some(header) = decode_simple_request(&src[..line_end])? {
            trace!(uri = %header.uri(), "decoded http/0.9 request");
            let _ = src.split_to(line_end + 1);
            return Ok(Some((header, PayloadSize::new_empty())));
        }

        let Some(head_end) = find_head_end(src) else {
            ensure!(src.len() <= self.max_header_bytes, ParseError::too_large_header(src.len(), self.max_header_bytes));
            return Ok(None);
        };
        ensure!(head_end <= self.max_header_bytes, ParseError::too_large_header(head_end, self.max_header_bytes));

        if has_folded_lines(&src[line_end..head_end]) {
            unfold(src, head_end);
        }

        self.decode_head(src).map(Some)
    }
}

impl HeaderDecoder {
    fn decode_head(&self, src: &mut BytesMut) -> Result<(RequestHeader, PayloadSize), ParseError> {
        let mut headers = vec![httparse::EMPTY_HEADER; self.max_headers];
        let mut req = httparse::Request::new(&mut headers);

        let body_offset = match req.parse(src) {
            Ok(Status::Complete(offset)) => offset,
            // the head end was already located, so a partial parse means a malformed head
            Ok(Status::Partial) => return Err(ParseError::invalid_header("incomplete request head")),
            Err(Error::TooManyHeaders) => return Err(ParseError::too_many_headers(self.max_headers)),
            Err(Error::Version) => return Err(ParseError::InvalidVersion(None)),
            Err(Error::Token) => return Err(ParseError::InvalidMethod),
            Err(e) => return Err(ParseError::invalid_header(e)),
        };
        trace!(header_size = body_offset, "parsed request head");

        let version = match req.version {
            Some(0) => Version::HTTP_10,
            Some(1) => Version::HTTP_11,
            v => return Err(ParseError::InvalidVersion(v)),
        };
        let method = Method::from_bytes(req.method.ok_or(ParseError::InvalidMethod)?.as_bytes())
            .map_err(|_| ParseError::InvalidMethod)?;
        let uri = Uri::try_from(req.path.ok_or(ParseError::InvalidUri)?).map_err(|_| ParseError::InvalidUri)?;

        let indices = HeaderIndex::record(src, req.headers);

        let head = src.split_to(body_offset).freeze();
        let mut header_map = HeaderMap::with_capacity(indices.len());
        for index in &indices {
            let name =
                HeaderName::from_bytes(&head[index.name.0..index.name.1]).map_err(ParseError::invalid_header)?;
            let value = HeaderValue::from_maybe_shared(head.slice(index.value.0..index.value.1))
                .map_err(ParseError::invalid_header)?;
            header_map.append(name, value);
        }

        let mut request = Request::new(());
        *request.method_mut() = method;
        *request.uri_mut() = uri;
        *request.version_mut() = version;
        *request.headers_mut() = header_map;

        let header = RequestHeader::from(request);
        let payload_size = parse_payload(header.headers())?;
        Ok((header, payload_size))
    }
}

/// Byte ranges of one header's name and value within the head buffer.
#[derive(Clone, Copy)]
struct HeaderIndex {
    name: (usize, usize),
    value: (usize, usize),
}

impl HeaderIndex {
    fn record(bytes: &[u8], headers: &[httparse::Header<'_>]) -> Vec<HeaderIndex> {
        let base = bytes.as_ptr() as usize;
        headers
            .iter()
            .map(|header| {
                let name_start = header.name.as_ptr() as usize - base;
                let value_start = header.value.as_ptr() as usize - base;
                HeaderIndex {
                    name: (name_start, name_start + header.name.len()),
                    value: (value_start, value_start + header.value.len()),
                }
            })
            .collect()
    }
}

fn skip_empty_lines(src: &mut BytesMut) {
    let skip = src.iter().take_while(|b| matches!(b, b'\r' | b'\n')).count();
    if skip > 0 {
        let _ = src.split_to(skip);
    }
}

/// `GET /path` without a protocol version.
fn decode_simple_request(line: &[u8]) -> Result<Option<RequestHeader>, ParseError> {
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    let mut parts = line.split(|b| *b == b' ' || *b == b'\t').filter(|p| !p.is_empty());
    let (Some(method), Some(target), None) = (parts.next(), parts.next(), parts.next()) else {
        return Ok(None);
    };

    ensure!(method == b"GET", ParseError::InvalidVersion(None));
    let uri = Uri::try_from(target).map_err(|_| ParseError::InvalidUri)?;

    let mut request = Request::new(());
    *request.uri_mut() = uri;
    *request.version_mut() = Version::HTTP_09;
    Ok(Some(RequestHeader::from(request)))
}

/// Offset just past the empty line terminating the head, bare LF tolerated.
fn find_head_end(src: &[u8]) -> Option<usize> {
    let mut i = 0;
    while let Some(pos) = src[i..].iter().position(|b| *b == b'\n') {
        let lf = i + pos;
        match src.get(lf + 1) {
            Some(b'\n') => return Some(lf + 2),
            Some(b'\r') if src.get(lf + 2) == Some(&b'\n') => return Some(lf + 3),
            Some(_) => i = lf + 1,
            None => return None,
        }
    }
    None
}

fn has_folded_lines(headers: &[u8]) -> bool {
    headers.windows(2).any(|w| w[0] == b'\n' && matches!(w[1], b' ' | b'\t'))
}

/// Joins continuation lines onto the previous header line, separated by one space.
fn unfold(src: &mut BytesMut, head_end: usize) {
    let rest = src.split_off(head_end);
    let mut unfolded = BytesMut::with_capacity(src.len() + rest.len());

    for line in src.split_inclusive(|b| *b == b'\n') {
        if matches!(line.first(), Some(b' ' | b'\t')) && !unfolded.is_empty() {
            // drop the line terminator of the previous line
            while matches!(unfolded.last(), Some(b'\r' | b'\n')) {
                unfolded.truncate(unfolded.len() - 1);
            }
            let continuation = line.iter().position(|b| !matches!(b, b' ' | b'\t')).unwrap_or(line.len());
            unfolded.extend_from_slice(b" ");
            unfolded.extend_from_slice(&line[continuation..]);
        } else {
            unfolded.extend_from_slice(line);
        }
    }

    unfolded.extend_from_slice(&rest);
    *src = unfolded;
}

/// Selects the body framing from `Transfer-Encoding` and `Content-Length`.
///
/// `identity` codings are ignored; `chunked` must be the final coding. A request carrying
/// both headers is rejected.
fn parse_payload(headers: &HeaderMap) -> Result<PayloadSize, ParseError> {
    let codings = transfer_codings(headers)?;

    let mut lengths = headers.get_all(CONTENT_LENGTH).iter();
    let content_length = match lengths.next() {
        None => None,
        Some(first) => {
            ensure!(lengths.all(|v| v == first), ParseError::invalid_content_length("conflicting values"));
            let value = first.to_str().map_err(|_| ParseError::invalid_content_length("value is not visible ascii"))?;
            let length = value
                .trim()
                .parse::<u64>()
                .map_err(|_| ParseError::invalid_content_length(format!("value {value} is not u64")))?;
            Some(length)
        }
    };

    match (codings.last(), content_length) {
        (None, None) => Ok(PayloadSize::new_empty()),
        (None, Some(length)) => Ok(PayloadSize::new_length(length)),
        (Some(_), Some(_)) => {
            Err(ParseError::invalid_content_length("transfer-encoding and content-length both present"))
        }
        (Some(last), None) => {
            if let Some(other) = codings.iter().find(|c| *c != "chunked") {
                return Err(ParseError::unsupported_transfer_encoding(other));
            }
            ensure!(last == "chunked" && codings.len() == 1, ParseError::invalid_header("chunked applied twice"));
            Ok(PayloadSize::new_chunked())
        }
    }
}

/// Transfer codings in application order, lowercased, `identity` removed.
pub(crate) fn transfer_codings(headers: &HeaderMap) -> Result<Vec<String>, ParseError> {
    let mut codings = Vec::new();
    for value in headers.get_all(TRANSFER_ENCODING) {
        let value = value.to_str().map_err(ParseError::invalid_header)?;
        codings.extend(
            value
                .split(',')
                .map(|c| c.split(';').next().unwrap_or("").trim().to_ascii_lowercase())
                .filter(|c| !c.is_empty() && c != "identity"),
        );
    }
    Ok(codings)
}
