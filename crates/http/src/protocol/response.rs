//! Handler-facing response.
//!
//! A [`Response`] collects status and headers until it is committed. Commit happens once,
//! on the first explicit flush, when the staged body grows past the staging limit, or at
//! [`Response::finish`]. At that point the response decides, for good:
//!
//! - the final status and headers (default charset, cache control, `Date`, `Connection`)
//! - whether a `Range` request is honoured, and how
//! - whether the body is compressed
//! - the transfer framing: an explicit `Content-Length`, chunked for HTTP/1.1, close
//!   delimited for HTTP/1.0, or `Content-Length: 0` when finishing with an empty body
//!
//! Encoded bytes go to a [`BodySink`], which the connection layer backs with the output
//! buffer of the connection.

use std::fmt;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use http::header::{
    ACCEPT_ENCODING, CACHE_CONTROL, CONNECTION, CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, DATE, RANGE,
    SET_COOKIE, USER_AGENT, VARY,
};
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Version};
use mime::Mime;
use tokio_util::codec::Encoder;
use tracing::{debug, trace};

use crate::buffer::{Buffer, Charset};
use crate::codec::body::{RangeFramer, random_boundary};
use crate::codec::{BodyPlan, ResponseEncoder};
use crate::config::EngineConfig;
use crate::date::DateService;
use crate::protocol::{
    EncodingPreferences, Message, PayloadItem, PayloadSize, RangeSet, RequestHeader, SendError, UsageError,
    has_connection_token, unsatisfied_content_range, wants_keep_alive,
};

/// Type alias for HTTP response headers, the form the encoder consumes.
pub type ResponseHead = http::Response<()>;

/// `1xx`, `204` and `304` responses never carry a body.
pub fn status_allows_body(status: StatusCode) -> bool {
    !(status.is_informational() || status == StatusCode::NO_CONTENT || status == StatusCode::NOT_MODIFIED)
}

/// Destination of encoded response bytes.
pub trait BodySink: Send {
    /// Queues wire bytes for output.
    fn send(&mut self, bytes: Bytes) -> Result<(), SendError>;

    /// Blocks until everything queued so far reached the socket.
    fn flush(&mut self) -> Result<(), SendError>;
}

/// Facts about the request that shape its response.
#[derive(Debug, Clone)]
pub struct ResponseContext {
    version: Version,
    head_request: bool,
    keep_alive: bool,
    encoding: EncodingPreferences,
    range: Option<String>,
}

impl ResponseContext {
    pub fn for_request(header: &RequestHeader) -> Self {
        Self::from_parts(header.version(), header.method(), header.headers())
    }

    pub fn from_parts(version: Version, method: &Method, headers: &HeaderMap) -> Self {
        let header_string = |name: &HeaderName| headers.get(name).and_then(|v| v.to_str().ok()).map(str::to_owned);
        Self {
            version,
            head_request: *method == Method::HEAD,
            keep_alive: wants_keep_alive(version, headers),
            encoding: EncodingPreferences {
                accept_encoding: header_string(&ACCEPT_ENCODING),
                user_agent: header_string(&USER_AGENT),
            },
            range: header_string(&RANGE),
        }
    }

    /// Context of a response that has no parsed request behind it.
    pub fn closing(version: Version) -> Self {
        Self {
            version,
            head_request: false,
            keep_alive: false,
            encoding: EncodingPreferences::default(),
            range: None,
        }
    }

    pub fn version(&self) -> Version {
        self.version
    }
}

/// Engine-wide response settings.
#[derive(Debug, Clone)]
pub struct ResponseOptions {
    pub compress: bool,
    pub default_charset: Charset,
    pub default_cache_control: Option<HeaderValue>,
    pub propagate_output_errors: bool,
    /// Staged body bytes that force a commit and a push to the sink.
    pub staging_limit: usize,
    pub send_date: bool,
}

impl Default for ResponseOptions {
    fn default() -> Self {
        Self {
            compress: false,
            default_charset: Charset::Utf8,
            default_cache_control: None,
            propagate_output_errors: false,
            staging_limit: 8 * 1024,
            send_date: true,
        }
    }
}

impl From<&EngineConfig> for ResponseOptions {
    fn from(config: &EngineConfig) -> Self {
        Self {
            compress: config.compress_responses,
            default_charset: config.default_charset,
            default_cache_control: config
                .default_cache_control
                .as_deref()
                .and_then(|value| HeaderValue::try_from(value).ok()),
            propagate_output_errors: config.propagate_output_errors,
            staging_limit: config.output_buffer_limit,
            send_date: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Open,
    Committed,
    Finished,
}

const CLOSE: HeaderValue = HeaderValue::from_static("close");
const KEEP_ALIVE: HeaderValue = HeaderValue::from_static("keep-alive");

pub struct Response {
    status: StatusCode,
    version: Version,
    headers: HeaderMap,
    context: ResponseContext,
    options: Arc<ResponseOptions>,
    compress: Option<bool>,
    state: State,
    staging: Buffer,
    encoder: ResponseEncoder,
    sink: Box<dyn BodySink>,
    wire: BytesMut,
    payload_size: Option<PayloadSize>,
    // body bytes the handler must write for the declared length to hold
    expected_body: Option<u64>,
    body_bytes: u64,
    output_failed: bool,
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response")
            .field("status", &self.status)
            .field("version", &self.version)
            .field("headers", &self.headers)
            .field("state", &self.state)
            .field("body_bytes", &self.body_bytes)
            .finish_non_exhaustive()
    }
}

impl Response {
    pub fn new(context: ResponseContext, options: Arc<ResponseOptions>, sink: Box<dyn BodySink>) -> Self {
        let staging = Buffer::new();
        staging.set_charset(options.default_charset);
        Self {
            status: StatusCode::OK,
            version: context.version,
            headers: HeaderMap::new(),
            context,
            options,
            compress: None,
            state: State::Open,
            staging,
            encoder: ResponseEncoder::new(),
            sink,
            wire: BytesMut::new(),
            payload_size: None,
            expected_body: None,
            body_bytes: 0,
            output_failed: false,
        }
    }

    #[inline]
    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn set_status(&mut self, status: StatusCode) -> Result<(), UsageError> {
        self.ensure_open()?;
        self.status = status;
        Ok(())
    }

    #[inline]
    pub fn version(&self) -> Version {
        self.version
    }

    #[inline]
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Mutable headers, available until the response is committed.
    pub fn headers_mut(&mut self) -> Result<&mut HeaderMap, UsageError> {
        self.ensure_open()?;
        Ok(&mut self.headers)
    }

    pub fn insert_header(&mut self, name: HeaderName, value: HeaderValue) -> Result<(), UsageError> {
        self.headers_mut()?.insert(name, value);
        Ok(())
    }

    pub fn set_content_length(&mut self, length: u64) -> Result<(), UsageError> {
        self.insert_header(CONTENT_LENGTH, length.into())
    }

    /// Overrides the engine-wide compression switch for this response.
    pub fn set_compress(&mut self, compress: bool) {
        self.compress = Some(compress);
    }

    #[inline]
    pub fn is_committed(&self) -> bool {
        self.state != State::Open
    }

    #[inline]
    pub fn is_finished(&self) -> bool {
        self.state == State::Finished
    }

    /// Body bytes written by the handler so far, before any coding or framing.
    pub fn body_bytes(&self) -> u64 {
        self.body_bytes + self.staging.available_bytes() as u64
    }

    pub fn write(&mut self, data: &[u8]) -> Result<(), SendError> {
        self.ensure_writable()?;
        self.staging.write(data)?;
        self.staging.flush()?;
        self.push_if_full()
    }

    /// Writes text, encoded with the charset of the `Content-Type` (or the default one).
    pub fn write_str(&mut self, text: &str) -> Result<(), SendError> {
        self.ensure_writable()?;
        self.staging.set_charset(self.charset());
        self.staging.write_str(text)?;
        self.staging.flush()?;
        self.push_if_full()
    }

    /// Commits the head without finishing the body.
    pub fn commit(&mut self) -> Result<(), SendError> {
        if self.state != State::Open {
            return Ok(());
        }
        self.commit_head(false)?;
        self.send_wire()
    }

    /// Pushes staged bytes and blocks until they were written to the socket.
    pub fn flush(&mut self) -> Result<(), SendError> {
        if self.state == State::Finished {
            return Ok(());
        }
        self.push_staged(false)?;
        self.flush_sink()
    }

    /// Encodes staged bytes and hands them to the sink without waiting for the socket.
    pub fn push(&mut self) -> Result<(), SendError> {
        if self.state == State::Finished {
            return Ok(());
        }
        self.push_staged(false)
    }

    /// Ends the body. Idempotent.
    pub fn finish(&mut self) -> Result<(), SendError> {
        if self.state == State::Finished {
            return Ok(());
        }
        self.push_staged(true)?;
        self.state = State::Finished;
        self.encoder.encode(Message::Payload(PayloadItem::Eof), &mut self.wire)?;
        self.send_wire()
    }

    /// Drops status, headers and staged body. Fails once the response is committed.
    pub fn reset(&mut self) -> Result<(), UsageError> {
        self.ensure_open()?;
        self.status = StatusCode::OK;
        self.headers.clear();
        self.staging.clear();
        self.compress = None;
        Ok(())
    }

    /// Replaces the response with a short plain-text page and closes the connection after it.
    pub fn send_error_page(&mut self, status: StatusCode) -> Result<(), SendError> {
        self.reset()?;
        let reason = status.canonical_reason().unwrap_or("Error");
        self.status = status;
        self.headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
        self.headers.insert(CONNECTION, CLOSE);
        self.headers.insert(CONTENT_LENGTH, reason.len().into());
        self.write(reason.as_bytes())?;
        self.finish()
    }

    /// Whether the connection may carry another request after this response.
    ///
    /// Requires a finished HTTP/1.x response to a request that opted in, no
    /// `Connection: close`, and framing the client can trust: the declared length was
    /// written exactly, or the body was chunked, or there is no body at all.
    pub fn is_keep_alive(&self) -> bool {
        if self.state != State::Finished || self.output_failed || !self.context.keep_alive {
            return false;
        }
        if !matches!(self.version, Version::HTTP_10 | Version::HTTP_11) {
            return false;
        }
        if has_connection_token(&self.headers, "close") || self.encoder.overflowed() {
            return false;
        }
        if self.context.head_request || !status_allows_body(self.status) {
            return true;
        }

        match self.payload_size {
            Some(PayloadSize::Length(_)) => self.expected_body == Some(self.body_bytes),
            Some(PayloadSize::Chunked | PayloadSize::Empty) => true,
            Some(PayloadSize::UntilClose) | None => false,
        }
    }

    /// Whether an output error was hit (and swallowed).
    pub fn output_failed(&self) -> bool {
        self.output_failed
    }

    fn ensure_open(&self) -> Result<(), UsageError> {
        match self.state {
            State::Open => Ok(()),
            State::Committed => Err(UsageError::Committed),
            State::Finished => Err(UsageError::Finished),
        }
    }

    fn ensure_writable(&self) -> Result<(), SendError> {
        if self.state == State::Finished {
            return Err(UsageError::Finished.into());
        }
        Ok(())
    }

    fn charset(&self) -> Charset {
        self.headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<Mime>().ok())
            .and_then(|m| m.get_param(mime::CHARSET).and_then(|c| Charset::from_label(c.as_str())))
            .unwrap_or(self.options.default_charset)
    }

    fn push_if_full(&mut self) -> Result<(), SendError> {
        if self.staging.available_bytes() >= self.options.staging_limit {
            self.push_staged(false)?;
        }
        Ok(())
    }

    fn push_staged(&mut self, finishing: bool) -> Result<(), SendError> {
        if self.state == State::Open {
            self.commit_head(finishing)?;
        }
        while let Some(chunk) = self.staging.readable() {
            self.staging.release(chunk.len());
            self.body_bytes += chunk.len() as u64;
            self.encoder.encode(Message::Payload(PayloadItem::Chunk(chunk)), &mut self.wire)?;
        }
        self.send_wire()
    }

    fn commit_head(&mut self, finishing: bool) -> Result<(), SendError> {
        let empty_body = finishing && self.staging.is_empty();
        self.prepare_headers();
        let plan = self.plan_body(empty_body);
        self.apply_connection_header(plan.payload_size);
        self.payload_size = Some(plan.payload_size);
        self.state = State::Committed;

        debug!(status = %self.status, payload_size = ?plan.payload_size, coding = ?plan.coding, "response committed");

        let mut head = ResponseHead::new(());
        *head.status_mut() = self.status;
        *head.version_mut() = self.version;
        *head.headers_mut() = self.headers.clone();
        self.encoder.encode(Message::Header((head, plan)), &mut self.wire)
    }

    fn prepare_headers(&mut self) {
        if let Some(value) = self.headers.get(CONTENT_TYPE).and_then(|v| with_charset(v, self.options.default_charset)) {
            self.headers.insert(CONTENT_TYPE, value);
        }
        if !self.headers.contains_key(CACHE_CONTROL) {
            if let Some(value) = &self.options.default_cache_control {
                self.headers.insert(CACHE_CONTROL, value.clone());
            }
        }
        if self.headers.contains_key(SET_COOKIE) {
            strip_public(&mut self.headers);
        }
        if self.options.send_date && !self.headers.contains_key(DATE) {
            self.headers.insert(DATE, DateService::get_global_instance().http_date());
        }
    }

    fn plan_body(&mut self, empty_body: bool) -> BodyPlan {
        if self.version == Version::HTTP_09 {
            let mut plan = BodyPlan::new(PayloadSize::UntilClose);
            plan.discard_body = self.context.head_request;
            return plan;
        }
        if !status_allows_body(self.status) {
            return BodyPlan::new(PayloadSize::Empty);
        }

        let declared = self.declared_length();
        if let Some(mut plan) = self.plan_range(declared) {
            plan.discard_body |= self.context.head_request;
            return plan;
        }

        let enabled = self.compress.unwrap_or(self.options.compress);
        let coding = if empty_body { None } else { self.context.encoding.negotiate(enabled, &self.headers) };
        if let Some(coding) = coding {
            self.headers.insert(CONTENT_ENCODING, HeaderValue::from_static(coding.name()));
            self.headers.append(VARY, HeaderValue::from_static("Accept-Encoding"));
        }

        let payload_size = match (declared, coding) {
            (Some(length), None) => {
                self.expected_body = Some(length);
                PayloadSize::Length(length)
            }
            _ if empty_body => PayloadSize::Empty,
            _ => self.open_ended(),
        };

        let mut plan = BodyPlan::new(payload_size);
        plan.coding = coding;
        plan.discard_body = self.context.head_request;
        plan
    }

    fn plan_range(&mut self, declared: Option<u64>) -> Option<BodyPlan> {
        if self.status != StatusCode::OK {
            return None;
        }
        let content_length = declared?;
        let ranges = RangeSet::parse(self.context.range.as_deref()?)?;
        if !ranges.is_valid(content_length) {
            debug!(content_length, "ignoring invalid range set");
            return None;
        }

        if content_length == 0 || !ranges.is_satisfiable(content_length) {
            self.status = StatusCode::RANGE_NOT_SATISFIABLE;
            self.headers.remove(CONTENT_LENGTH);
            self.insert_generated(CONTENT_RANGE, unsatisfied_content_range(content_length));
            let mut plan = BodyPlan::new(PayloadSize::Empty);
            plan.discard_body = true;
            return Some(plan);
        }

        let resolved = ranges.resolve(content_length);
        self.status = StatusCode::PARTIAL_CONTENT;
        self.expected_body = Some(content_length);

        let plan = if resolved.len() == 1 {
            let single = resolved[0];
            self.insert_generated(CONTENT_RANGE, single.content_range(content_length));
            let mut plan = BodyPlan::new(PayloadSize::Length(single.len()));
            plan.range = Some(RangeFramer::single(single, content_length));
            plan
        } else {
            let boundary = random_boundary();
            let content_type = self.headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok()).map(str::to_owned);
            self.headers.remove(CONTENT_LENGTH);
            self.insert_generated(CONTENT_TYPE, format!("multipart/byteranges; boundary={boundary}"));
            let mut plan = BodyPlan::new(self.open_ended());
            plan.range = Some(RangeFramer::multipart(resolved, content_length, boundary, content_type));
            plan
        };
        Some(plan)
    }

    fn declared_length(&mut self) -> Option<u64> {
        let value = self.headers.get(CONTENT_LENGTH)?;
        match value.to_str().ok().and_then(|v| v.trim().parse::<u64>().ok()) {
            Some(length) => Some(length),
            None => {
                debug!(?value, "dropping unparsable content-length");
                self.headers.remove(CONTENT_LENGTH);
                None
            }
        }
    }

    fn open_ended(&self) -> PayloadSize {
        if self.version == Version::HTTP_11 { PayloadSize::Chunked } else { PayloadSize::UntilClose }
    }

    fn apply_connection_header(&mut self, payload_size: PayloadSize) {
        if self.version == Version::HTTP_09 {
            return;
        }
        let closing = has_connection_token(&self.headers, "close");
        let persistent = self.context.keep_alive && !closing && payload_size != PayloadSize::UntilClose;
        if !persistent {
            if !closing {
                self.headers.insert(CONNECTION, CLOSE);
            }
        } else if self.version == Version::HTTP_10 {
            self.headers.insert(CONNECTION, KEEP_ALIVE);
        }
    }

    fn insert_generated(&mut self, name: HeaderName, value: String) {
        // generated values are plain ascii
        if let Ok(value) = HeaderValue::try_from(value) {
            self.headers.insert(name, value);
        }
    }

    fn send_wire(&mut self) -> Result<(), SendError> {
        if self.wire.is_empty() {
            return Ok(());
        }
        let bytes = self.wire.split().freeze();
        if self.output_failed {
            trace!(len = bytes.len(), "dropping output after an earlier failure");
            return Ok(());
        }
        match self.sink.send(bytes) {
            Ok(()) => Ok(()),
            Err(e) => self.output_error(e),
        }
    }

    fn flush_sink(&mut self) -> Result<(), SendError> {
        if self.output_failed {
            return Ok(());
        }
        match self.sink.flush() {
            Ok(()) => Ok(()),
            Err(e) => self.output_error(e),
        }
    }

    fn output_error(&mut self, e: SendError) -> Result<(), SendError> {
        self.output_failed = true;
        if self.options.propagate_output_errors || matches!(e, SendError::Usage { .. }) {
            return Err(e);
        }
        debug!(cause = %e, "swallowing response output error");
        Ok(())
    }
}

/// `text/*` content types without a charset get the default one appended.
fn with_charset(value: &HeaderValue, charset: Charset) -> Option<HeaderValue> {
    let text = value.to_str().ok()?;
    let mime = text.parse::<Mime>().ok()?;
    if mime.type_() != mime::TEXT || mime.get_param(mime::CHARSET).is_some() {
        return None;
    }
    HeaderValue::try_from(format!("{text}; charset={}", charset.name())).ok()
}

/// Responses setting cookies must not be stored by shared caches.
fn strip_public(headers: &mut HeaderMap) {
    let Some(value) = headers.get(CACHE_CONTROL).and_then(|v| v.to_str().ok()) else {
        return;
    };
    if !value.split(',').any(|d| d.trim().eq_ignore_ascii_case("public")) {
        return;
    }

    let stripped = value
        .split(',')
        .map(str::trim)
        .filter(|d| !d.is_empty() && !d.eq_ignore_ascii_case("public"))
        .collect::<Vec<_>>()
        .join(", ");
    match HeaderValue::try_from(stripped) {
        Ok(value) if !value.is_empty() => {
            headers.insert(CACHE_CONTROL, value);
        }
        _ => {
            headers.remove(CACHE_CONTROL);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::body::{PayloadDecoder, inflate_gzip};
    use parking_lot::Mutex;
    use tokio_util::codec::Decoder;

    #[derive(Clone, Default)]
    struct Wire(Arc<Mutex<Vec<u8>>>);

    impl BodySink for Wire {
        fn send(&mut self, bytes: Bytes) -> Result<(), SendError> {
            self.0.lock().extend_from_slice(&bytes);
            Ok(())
        }

        fn flush(&mut self) -> Result<(), SendError> {
            Ok(())
        }
    }

    struct Broken;

    impl BodySink for Broken {
        fn send(&mut self, _bytes: Bytes) -> Result<(), SendError> {
            Err(SendError::Closed)
        }

        fn flush(&mut self) -> Result<(), SendError> {
            Err(SendError::Closed)
        }
    }

    struct Busy;

    impl BodySink for Busy {
        fn send(&mut self, _bytes: Bytes) -> Result<(), SendError> {
            Err(UsageError::WriteInFlight.into())
        }

        fn flush(&mut self) -> Result<(), SendError> {
            Ok(())
        }
    }

    fn options() -> ResponseOptions {
        ResponseOptions { send_date: false, ..Default::default() }
    }

    fn response_with(version: Version, method: Method, headers: &[(&str, &str)], options: ResponseOptions) -> (Response, Wire) {
        let mut map = HeaderMap::new();
        for (name, value) in headers {
            map.append(HeaderName::try_from(*name).unwrap(), HeaderValue::try_from(*value).unwrap());
        }
        let wire = Wire::default();
        let context = ResponseContext::from_parts(version, &method, &map);
        (Response::new(context, Arc::new(options), Box::new(wire.clone())), wire)
    }

    fn start(version: Version, headers: &[(&str, &str)]) -> (Response, Wire) {
        response_with(version, Method::GET, headers, options())
    }

    fn split(wire: &Wire) -> (String, Vec<u8>) {
        let bytes = wire.0.lock().clone();
        let end = bytes.windows(4).position(|w| w == b"\r\n\r\n").unwrap() + 4;
        (String::from_utf8(bytes[..end].to_vec()).unwrap(), bytes[end..].to_vec())
    }

    fn content(len: usize) -> Vec<u8> {
        (0..len).map(|i| b'a' + (i % 26) as u8).collect()
    }

    #[test]
    fn http11_without_length_is_chunked() {
        let (mut response, wire) = start(Version::HTTP_11, &[]);
        response.write(b"hello").unwrap();
        response.finish().unwrap();

        let (head, body) = split(&wire);
        assert_eq!(head, "HTTP/1.1 200 OK\r\ntransfer-encoding: chunked\r\n\r\n");
        assert_eq!(body, b"5\r\nhello\r\n0\r\n\r\n");
        assert!(response.is_keep_alive());
    }

    #[test]
    fn http10_without_length_closes() {
        let (mut response, wire) = start(Version::HTTP_10, &[("Connection", "keep-alive")]);
        response.write(b"hello").unwrap();
        response.finish().unwrap();

        let (head, body) = split(&wire);
        assert_eq!(head, "HTTP/1.0 200 OK\r\nconnection: close\r\n\r\n");
        assert_eq!(body, b"hello");
        assert!(!response.is_keep_alive());
    }

    #[test]
    fn http10_keep_alive_with_length() {
        let (mut response, wire) = start(Version::HTTP_10, &[("Connection", "keep-alive")]);
        response.set_content_length(5).unwrap();
        response.write(b"hello").unwrap();
        response.finish().unwrap();

        let (head, _) = split(&wire);
        assert!(head.contains("connection: keep-alive\r\n"));
        assert!(head.contains("content-length: 5\r\n"));
        assert!(response.is_keep_alive());
    }

    #[test]
    fn empty_body_gets_zero_length() {
        let (mut response, wire) = start(Version::HTTP_11, &[]);
        response.finish().unwrap();
        let (head, body) = split(&wire);
        assert_eq!(head, "HTTP/1.1 200 OK\r\ncontent-length: 0\r\n\r\n");
        assert!(body.is_empty());
        assert!(response.is_keep_alive());
    }

    #[test]
    fn keep_alive_decision_table() {
        // request opted out
        let (mut response, _) = start(Version::HTTP_11, &[("Connection", "close")]);
        response.finish().unwrap();
        assert!(!response.is_keep_alive());
        assert!(response.headers().get(CONNECTION).is_some());

        // handler closes
        let (mut response, _) = start(Version::HTTP_11, &[]);
        response.insert_header(CONNECTION, CLOSE).unwrap();
        response.finish().unwrap();
        assert!(!response.is_keep_alive());

        // short body
        let (mut response, _) = start(Version::HTTP_11, &[]);
        response.set_content_length(10).unwrap();
        response.write(b"short").unwrap();
        response.finish().unwrap();
        assert!(!response.is_keep_alive());

        // overflow
        let (mut response, wire) = start(Version::HTTP_11, &[]);
        response.set_content_length(2).unwrap();
        response.write(b"abc").unwrap();
        response.finish().unwrap();
        assert!(!response.is_keep_alive());
        assert_eq!(split(&wire).1, b"ab");

        // body-less status
        let (mut response, _) = start(Version::HTTP_11, &[]);
        response.set_status(StatusCode::NOT_MODIFIED).unwrap();
        response.finish().unwrap();
        assert!(response.is_keep_alive());

        // not finished yet
        let (mut response, _) = start(Version::HTTP_11, &[]);
        response.commit().unwrap();
        assert!(!response.is_keep_alive());

        // http/0.9
        let (mut response, _) = start(Version::HTTP_09, &[]);
        response.finish().unwrap();
        assert!(!response.is_keep_alive());
    }

    #[test]
    fn head_request_keeps_length_drops_body() {
        let (mut response, wire) = response_with(Version::HTTP_11, Method::HEAD, &[], options());
        response.set_content_length(5).unwrap();
        response.write(b"hello").unwrap();
        response.finish().unwrap();

        let (head, body) = split(&wire);
        assert!(head.contains("content-length: 5\r\n"));
        assert!(body.is_empty());
        assert!(response.is_keep_alive());
    }

    #[test]
    fn single_range() {
        let (mut response, wire) = start(Version::HTTP_11, &[("Range", "bytes=50-59")]);
        let data = content(100);
        response.set_content_length(100).unwrap();
        response.write(&data).unwrap();
        response.finish().unwrap();

        let (head, body) = split(&wire);
        assert!(head.starts_with("HTTP/1.1 206 Partial Content\r\n"));
        assert!(head.contains("content-range: bytes 50-59/100\r\n"));
        assert!(head.contains("content-length: 10\r\n"));
        assert_eq!(body, &data[50..60]);
        assert!(response.is_keep_alive());
    }

    #[test]
    fn unsatisfiable_range() {
        let (mut response, wire) = start(Version::HTTP_11, &[("Range", "bytes=200-")]);
        response.set_content_length(100).unwrap();
        response.write(&content(100)).unwrap();
        response.finish().unwrap();

        let (head, body) = split(&wire);
        assert!(head.starts_with("HTTP/1.1 416 Range Not Satisfiable\r\n"));
        assert!(head.contains("content-range: bytes */100\r\n"));
        assert!(head.contains("content-length: 0\r\n"));
        assert!(body.is_empty());
    }

    #[test]
    fn ranges_need_ok_status_and_length() {
        let (mut response, wire) = start(Version::HTTP_11, &[("Range", "bytes=0-1")]);
        response.write(b"abcdef").unwrap();
        response.finish().unwrap();
        assert!(split(&wire).0.starts_with("HTTP/1.1 200 OK\r\n"));

        let (mut response, wire) = start(Version::HTTP_11, &[("Range", "bytes=0-1")]);
        response.set_status(StatusCode::NOT_FOUND).unwrap();
        response.set_content_length(6).unwrap();
        response.write(b"abcdef").unwrap();
        response.finish().unwrap();
        assert_eq!(split(&wire).1, b"abcdef");
    }

    #[test]
    fn multipart_ranges() {
        let (mut response, wire) = start(Version::HTTP_11, &[("Range", "bytes=0-1,5-6")]);
        response.insert_header(CONTENT_TYPE, HeaderValue::from_static("application/octet-stream")).unwrap();
        response.set_content_length(10).unwrap();
        response.write(b"0123456789").unwrap();
        response.finish().unwrap();

        let (head, body) = split(&wire);
        assert!(head.starts_with("HTTP/1.1 206 Partial Content\r\n"));
        assert!(head.contains("content-type: multipart/byteranges; boundary="));
        assert!(head.contains("transfer-encoding: chunked\r\n"));
        assert!(!head.contains("content-length"));

        let mut src = BytesMut::from(&body[..]);
        let mut decoder = PayloadDecoder::chunked();
        let mut decoded = Vec::new();
        while let Some(PayloadItem::Chunk(bytes)) = decoder.decode(&mut src).unwrap() {
            decoded.extend_from_slice(&bytes);
        }
        let decoded = String::from_utf8(decoded).unwrap();
        assert!(decoded.contains("Content-Range: bytes 0-1/10\r\n\r\n01"));
        assert!(decoded.contains("Content-Range: bytes 5-6/10\r\n\r\n56"));
        assert!(decoded.ends_with("--\r\n"));
    }

    #[test]
    fn default_charset_and_latin1_text() {
        let (mut response, wire) = start(Version::HTTP_11, &[]);
        response.insert_header(CONTENT_TYPE, HeaderValue::from_static("text/html")).unwrap();
        response.write_str("ok").unwrap();
        response.finish().unwrap();
        assert!(split(&wire).0.contains("content-type: text/html; charset=utf-8\r\n"));

        let (mut response, wire) = start(Version::HTTP_11, &[]);
        response.insert_header(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=iso-8859-1")).unwrap();
        response.set_content_length(2).unwrap();
        response.write_str("é€").unwrap();
        response.finish().unwrap();
        assert_eq!(split(&wire).1, &[0xE9, b'?']);
    }

    #[test]
    fn cookies_make_cache_control_private() {
        let (mut response, wire) = start(Version::HTTP_11, &[]);
        response.insert_header(CACHE_CONTROL, HeaderValue::from_static("public, max-age=60")).unwrap();
        response.insert_header(SET_COOKIE, HeaderValue::from_static("id=1")).unwrap();
        response.finish().unwrap();
        let (head, _) = split(&wire);
        assert!(head.contains("cache-control: max-age=60\r\n"));
    }

    #[test]
    fn default_cache_control_and_date() {
        let options = ResponseOptions {
            default_cache_control: Some(HeaderValue::from_static("no-cache")),
            ..Default::default()
        };
        let (mut response, wire) = response_with(Version::HTTP_11, Method::GET, &[], options);
        response.finish().unwrap();
        let (head, _) = split(&wire);
        assert!(head.contains("cache-control: no-cache\r\n"));
        assert!(head.contains("date: "));
    }

    #[test]
    fn gzip_when_negotiated() {
        let options = ResponseOptions { compress: true, ..options() };
        let (mut response, wire) = response_with(Version::HTTP_11, Method::GET, &[("Accept-Encoding", "gzip")], options);
        response.insert_header(CONTENT_TYPE, HeaderValue::from_static("text/plain")).unwrap();
        response.set_content_length(11).unwrap();
        response.write(b"hello world").unwrap();
        response.finish().unwrap();

        let (head, body) = split(&wire);
        assert!(head.contains("content-encoding: gzip\r\n"));
        assert!(head.contains("transfer-encoding: chunked\r\n"));
        assert!(!head.contains("content-length"));

        let mut src = BytesMut::from(&body[..]);
        let mut decoder = PayloadDecoder::chunked();
        let mut compressed = Vec::new();
        while let Some(PayloadItem::Chunk(bytes)) = decoder.decode(&mut src).unwrap() {
            compressed.extend_from_slice(&bytes);
        }
        assert_eq!(&inflate_gzip(&compressed, 1024).unwrap()[..], b"hello world");
        assert!(response.is_keep_alive());
    }

    #[test]
    fn per_response_compression_switch() {
        let (mut response, wire) = start(Version::HTTP_11, &[("Accept-Encoding", "gzip")]);
        response.set_compress(true);
        response.insert_header(CONTENT_TYPE, HeaderValue::from_static("application/json")).unwrap();
        response.write(b"{}").unwrap();
        response.finish().unwrap();
        assert!(split(&wire).0.contains("content-encoding: gzip\r\n"));
    }

    #[test]
    fn headers_are_frozen_after_commit() {
        let (mut response, _) = start(Version::HTTP_11, &[]);
        response.write(b"x").unwrap();
        response.flush().unwrap();
        assert!(response.is_committed());
        assert_eq!(response.headers_mut().unwrap_err(), UsageError::Committed);
        assert_eq!(response.set_status(StatusCode::NOT_FOUND).unwrap_err(), UsageError::Committed);
        assert_eq!(response.reset().unwrap_err(), UsageError::Committed);

        response.finish().unwrap();
        response.write(b"late").unwrap_err();
        response.finish().unwrap();
    }

    #[test]
    fn staging_limit_commits_early() {
        let options = ResponseOptions { staging_limit: 4, ..options() };
        let (mut response, wire) = response_with(Version::HTTP_11, Method::GET, &[], options);
        response.write(b"ab").unwrap();
        assert!(!response.is_committed());
        response.write(b"cd").unwrap();
        assert!(response.is_committed());
        assert!(split(&wire).1.starts_with(b"4\r\nabcd\r\n"));
    }

    #[test]
    fn http09_has_no_head() {
        let (mut response, wire) = start(Version::HTTP_09, &[]);
        response.insert_header(CONTENT_TYPE, HeaderValue::from_static("text/html")).unwrap();
        response.write(b"<html>").unwrap();
        response.finish().unwrap();
        assert_eq!(&wire.0.lock()[..], b"<html>");
    }

    #[test]
    fn error_page() {
        let (mut response, wire) = start(Version::HTTP_11, &[]);
        response.insert_header(CONTENT_TYPE, HeaderValue::from_static("image/png")).unwrap();
        response.write(b"partial").unwrap();
        response.send_error_page(StatusCode::INTERNAL_SERVER_ERROR).unwrap();

        let (head, body) = split(&wire);
        assert!(head.starts_with("HTTP/1.1 500 Internal Server Error\r\n"));
        assert!(head.contains("connection: close\r\n"));
        assert!(head.contains("content-type: text/plain; charset=utf-8\r\n"));
        assert_eq!(body, b"Internal Server Error");
        assert!(!response.is_keep_alive());
    }

    #[test]
    fn output_errors() {
        let context = ResponseContext::closing(Version::HTTP_11);
        let mut response = Response::new(context.clone(), Arc::new(options()), Box::new(Broken));
        response.write(b"x").unwrap();
        response.finish().unwrap();
        assert!(response.output_failed());
        assert!(!response.is_keep_alive());

        let propagate = ResponseOptions { propagate_output_errors: true, ..options() };
        let mut response = Response::new(context, Arc::new(propagate), Box::new(Broken));
        assert!(matches!(response.finish(), Err(SendError::Closed)));
    }

    #[test]
    fn usage_errors_always_reach_the_handler() {
        let context = ResponseContext::closing(Version::HTTP_11);
        let mut response = Response::new(context, Arc::new(options()), Box::new(Busy));
        assert!(matches!(response.flush(), Err(SendError::Usage { source: UsageError::WriteInFlight })));
        assert!(response.output_failed());
    }

    #[test]
    fn body_status_rules() {
        assert!(!status_allows_body(StatusCode::CONTINUE));
        assert!(!status_allows_body(StatusCode::NO_CONTENT));
        assert!(!status_allows_body(StatusCode::NOT_MODIFIED));
        assert!(status_allows_body(StatusCode::OK));
        assert!(status_allows_body(StatusCode::NOT_FOUND));
    }
}
