//! Per-connection protocol driver, run on the reactor thread.
//!
//! ```text
//!             bytes            complete request             handler returns
//!  Reading ----------> Reading ----------------> Queued ---> Processing ---> Writing
//!     ^                   |                                                    |
//!     |  keep-alive       | bad request: error page                            |
//!     +-------------------+----------------------------------------------------+
//!                         |                                       close or timeout
//!                         +-----------------------------------------------> Closed
//! ```
//!
//! Every handler returns a [`Step`]; the reactor drops the connection on
//! [`Step::Close`]. The connection owns at most one timer at a time.

use std::sync::Arc;
use std::time::Instant;

use bytes::BytesMut;
use http::header::{CONTENT_ENCODING, CONTENT_RANGE, HOST};
use http::Version;
use tokio_util::codec::Decoder;
use tracing::{debug, info, warn};

use crate::codec::RequestDecoder;
use crate::codec::body::inflate_gzip;
use crate::connection::io::ConnectionSink;
use crate::connection::socket::Connection;
use crate::connection::{ConnectionIo, ConnectionState, Endpoint, Exchange};
use crate::ensure;
use crate::handler::{EngineStatus, Handler};
use crate::metrics::Metrics;
use crate::protocol::{
    BadRequest, Message, ParseError, PayloadItem, PayloadSize, PeerAddr, Request, RequestHeader, Response,
    ResponseContext, placeholder_request,
};
use crate::reactor::{Context, TimerKey, TimerKind};

const CONTINUE: &[u8] = b"HTTP/1.1 100 Continue\r\n\r\n";

/// What the reactor should do with a connection after an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Step {
    Continue,
    Close(&'static str),
}

struct PartialRequest {
    header: RequestHeader,
    body: BytesMut,
    gzip: bool,
    chunked: bool,
}

pub(crate) struct StateMachine {
    conn: Connection,
    io: Arc<ConnectionIo>,
    endpoint: Arc<Endpoint>,
    decoder: RequestDecoder,
    window: BytesMut,
    partial: Option<PartialRequest>,
    timer: Option<(TimerKey, TimerKind)>,
    completion: Option<bool>,
}

impl std::fmt::Debug for StateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateMachine")
            .field("io", &self.io)
            .field("timer", &self.timer)
            .field("completion", &self.completion)
            .finish_non_exhaustive()
    }
}

impl StateMachine {
    pub(crate) fn new(conn: Connection, io: Arc<ConnectionIo>, endpoint: Arc<Endpoint>) -> Self {
        let config = &endpoint.config;
        let decoder = RequestDecoder::with_limits(config.max_header_bytes, config.max_headers);
        Self {
            conn,
            io,
            endpoint,
            decoder,
            window: BytesMut::new(),
            partial: None,
            timer: None,
            completion: None,
        }
    }

    #[inline]
    pub(crate) fn io(&self) -> &Arc<ConnectionIo> {
        &self.io
    }

    /// Whether the connection sits between two requests with nothing in flight.
    pub(crate) fn is_idle(&self) -> bool {
        self.io.state() == ConnectionState::Reading && self.partial.is_none() && self.window.is_empty()
    }

    pub(crate) fn start(&mut self, cx: &mut Context<'_>) -> std::io::Result<()> {
        self.conn.register(cx.registry)?;
        self.arm(cx, TimerKind::Startup);
        Ok(())
    }

    pub(crate) fn on_readable(&mut self, cx: &mut Context<'_>) -> Step {
        if self.io.state() != ConnectionState::Reading {
            // picked up again once the connection is back to reading
            return Step::Continue;
        }
        self.read_and_parse(cx)
    }

    pub(crate) fn on_writable(&mut self, cx: &mut Context<'_>) -> Step {
        if self.io.output().is_empty() && self.completion.is_none() {
            return Step::Continue;
        }
        self.write_out(cx)
    }

    /// Applies what workers posted for this connection.
    pub(crate) fn on_pending(&mut self, cx: &mut Context<'_>, flush: bool, completed: Option<bool>, close: bool) -> Step {
        if close {
            return Step::Close("abandoned by handler");
        }
        if let Some(keep_alive) = completed {
            self.completion = Some(keep_alive);
        }
        if flush || completed.is_some() {
            return self.write_out(cx);
        }
        Step::Continue
    }

    pub(crate) fn on_timer(&mut self, kind: TimerKind) -> Step {
        // the timer set already dropped the entry
        self.timer = None;
        Metrics::global().timeout();
        info!(peer = %self.conn.peer(), ?kind, state = ?self.io.state(), "connection timed out");
        match kind {
            TimerKind::Startup => Step::Close("startup timeout"),
            TimerKind::Read => Step::Close("read timeout"),
            TimerKind::Write => Step::Close("write timeout"),
            TimerKind::KeepAlive => Step::Close("keep-alive timeout"),
        }
    }

    pub(crate) fn close(&mut self, cx: &mut Context<'_>, cause: &'static str) {
        self.disarm(cx);
        self.conn.close(cx.registry);
        self.io.mark_closed();
        debug!(token = ?self.conn.token(), peer = %self.conn.peer(), cause, "connection closed");
    }

    fn read_and_parse(&mut self, cx: &mut Context<'_>) -> Step {
        let budget = self.read_budget();
        let status = match self.conn.read_available(budget) {
            Ok(status) => status,
            Err(e) => {
                debug!(peer = %self.conn.peer(), cause = %e, "read failed");
                return Step::Close("read failed");
            }
        };

        if status.read > 0 {
            self.arm(cx, TimerKind::Read);
        }

        let step = self.parse(cx);
        if step == Step::Continue && status.eof && self.io.state() == ConnectionState::Reading {
            if self.partial.is_some() || !self.window.is_empty() {
                warn!(peer = %self.conn.peer(), buffered = self.window.len(), "peer closed inside a request");
            }
            return Step::Close("peer closed");
        }
        step
    }

    fn read_budget(&self) -> usize {
        let config = &self.endpoint.config;
        let body = usize::try_from(config.max_body_size).unwrap_or(usize::MAX);
        config.max_header_bytes.saturating_add(body).saturating_add(config.max_chunk_size)
    }

    fn parse(&mut self, cx: &mut Context<'_>) -> Step {
        self.io.input().read_into(&mut self.window);

        loop {
            match self.decoder.decode(&mut self.window) {
                Ok(Some(Message::Header((header, payload_size)))) => {
                    let version = header.version();
                    if let Err(e) = self.begin(header, payload_size) {
                        return self.reject(cx, e, version);
                    }
                    if let Some(step) = self.send_continue(cx, payload_size) {
                        return step;
                    }
                }
                Ok(Some(Message::Payload(PayloadItem::Chunk(bytes)))) => {
                    if let Err(e) = self.append_body(&bytes) {
                        let version = self.current_version();
                        return self.reject(cx, e, version);
                    }
                }
                Ok(Some(Message::Payload(PayloadItem::Eof))) => return self.dispatch(cx),
                Ok(None) => return Step::Continue,
                Err(e) => {
                    let version = self.current_version();
                    return self.reject(cx, e, version);
                }
            }
        }
    }

    fn current_version(&self) -> Version {
        self.partial.as_ref().map_or(Version::HTTP_11, |p| p.header.version())
    }

    fn begin(&mut self, header: RequestHeader, payload_size: PayloadSize) -> Result<(), ParseError> {
        let gzip = self.verify(&header, payload_size)?;
        let chunked = payload_size.is_chunked();
        if chunked {
            Metrics::global().chunked_request_seen();
        }
        if gzip {
            Metrics::global().gzipped_request_seen();
        }

        debug!(peer = %self.conn.peer(), method = %header.method(), uri = %header.uri(), version = ?header.version(), "request head");
        let capacity = match payload_size {
            PayloadSize::Length(n) => usize::try_from(n).unwrap_or(0).min(64 * 1024),
            _ => 0,
        };
        self.partial = Some(PartialRequest { header, body: BytesMut::with_capacity(capacity), gzip, chunked });
        Ok(())
    }

    /// Checks a request head before its body is read. Returns whether the body is gzipped.
    fn verify(&self, header: &RequestHeader, payload_size: PayloadSize) -> Result<bool, ParseError> {
        let config = &self.endpoint.config;
        if let PayloadSize::Length(length) = payload_size {
            ensure!(length <= config.max_body_size, ParseError::body_too_large(length, config.max_body_size));
        }

        let headers = header.headers();
        if header.version() == Version::HTTP_11 {
            ensure!(headers.contains_key(HOST), ParseError::MissingHost);
        }
        if let (Some(uri_host), Some(host)) = (header.uri().host(), header.host()) {
            ensure!(uri_host.eq_ignore_ascii_case(host), ParseError::host_mismatch(host, uri_host));
        }
        ensure!(!headers.contains_key(CONTENT_RANGE), ParseError::ContentRangeNotImplemented);
        ensure!(
            !payload_size.is_chunked() || config.accept_chunked_requests,
            ParseError::unsupported_transfer_encoding("chunked")
        );

        let gzip = request_is_gzipped(header)?;
        ensure!(!gzip || config.accept_gzip_requests, ParseError::unsupported_content_encoding("gzip"));
        Ok(gzip)
    }

    fn send_continue(&mut self, cx: &mut Context<'_>, payload_size: PayloadSize) -> Option<Step> {
        let expects = self.partial.as_ref().is_some_and(|p| p.header.expects_continue());
        if !expects || payload_size.is_empty() || !self.window.is_empty() {
            return None;
        }

        let output = self.io.output();
        if let Err(e) = output.write(CONTINUE).and_then(|_| output.flush()) {
            debug!(cause = %e, "buffering 100-continue failed");
            return Some(Step::Close("output failed"));
        }
        match self.write_out(cx) {
            Step::Continue => None,
            close => Some(close),
        }
    }

    fn append_body(&mut self, bytes: &[u8]) -> Result<(), ParseError> {
        let max = self.endpoint.config.max_body_size;
        let Some(partial) = self.partial.as_mut() else {
            return Ok(());
        };
        let size = (partial.body.len() + bytes.len()) as u64;
        ensure!(size <= max, ParseError::body_too_large(size, max));
        partial.body.extend_from_slice(bytes);
        Ok(())
    }

    fn dispatch(&mut self, cx: &mut Context<'_>) -> Step {
        let Some(partial) = self.partial.take() else {
            return Step::Continue;
        };
        self.disarm(cx);

        let version = partial.header.version();
        let mut body = partial.body.freeze();
        if partial.gzip {
            body = match inflate_gzip(&body, self.endpoint.config.max_body_size) {
                Ok(inflated) => inflated,
                Err(e) => return self.reject(cx, e, version),
            };
            Metrics::global().gzipped_request_completed();
        }
        if partial.chunked {
            Metrics::global().chunked_request_completed();
        }

        self.io.record_request();
        let context = ResponseContext::for_request(&partial.header);
        let mut request = partial.header.body(body);
        request.extensions_mut().insert(PeerAddr(self.io.peer_addr()));
        if let Some(pool) = &self.endpoint.reports_on {
            request.extensions_mut().insert(EngineStatus {
                connections: cx.open_connections,
                worker_threads: pool.threads(),
                busy_workers: pool.busy(),
                queued_tasks: pool.queue_len(),
                metrics: Metrics::global().snapshot(),
            });
        }

        let handler = Arc::clone(&self.endpoint.handler);
        self.queue(request, context, handler)
    }

    fn queue(&mut self, request: Request, context: ResponseContext, handler: Arc<dyn Handler>) -> Step {
        debug!(peer = %self.io.peer_addr(), method = %request.method(), uri = %request.uri(), "request queued");
        self.io.set_state(ConnectionState::Queued);

        let sink = ConnectionSink::blocking(Arc::clone(&self.io));
        let response = Response::new(context, Arc::clone(&self.endpoint.response_options), Box::new(sink));
        let exchange = Exchange::new(
            request,
            response,
            Arc::clone(&self.io),
            Arc::clone(&self.endpoint.pool),
            self.endpoint.config.exit_on_fatal,
        );
        self.endpoint.pool.submit(move || exchange.run(handler.as_ref()));
        Step::Continue
    }

    fn reject(&mut self, cx: &mut Context<'_>, error: ParseError, version: Version) -> Step {
        let status = error.status();
        warn!(peer = %self.conn.peer(), %status, cause = %error, "bad request");
        Metrics::global().bad_request();

        self.disarm(cx);
        self.decoder.reset();
        self.partial = None;
        // nothing after a bad request can be framed reliably
        self.window.clear();

        if let Some(handler) = &self.endpoint.bad_request_handler {
            let handler = Arc::clone(handler);
            let mut request = placeholder_request(BadRequest { status, reason: error.to_string() });
            *request.version_mut() = version;
            request.extensions_mut().insert(PeerAddr(self.io.peer_addr()));
            let context = ResponseContext::from_parts(version, request.method(), request.headers());
            return self.queue(request, context, handler);
        }

        self.io.set_state(ConnectionState::Writing);
        let sink = ConnectionSink::non_blocking(Arc::clone(&self.io));
        let mut response =
            Response::new(ResponseContext::closing(version), Arc::clone(&self.endpoint.response_options), Box::new(sink));
        if let Err(e) = response.send_error_page(status) {
            debug!(cause = %e, "error page failed");
            return Step::Close("error page failed");
        }
        self.completion = Some(false);
        self.write_out(cx)
    }

    /// Writes pending output, then applies a recorded completion once everything drained.
    fn write_out(&mut self, cx: &mut Context<'_>) -> Step {
        let ticket = self.io.write_ticket();
        let written = match self.conn.write_pending() {
            Ok(written) => written,
            Err(e) => {
                debug!(peer = %self.conn.peer(), cause = %e, "write failed");
                return Step::Close("write failed");
            }
        };

        if !self.io.output().is_empty() {
            let waiting = matches!(self.timer, Some((_, TimerKind::Write)));
            if written > 0 || !waiting {
                self.arm(cx, TimerKind::Write);
            }
            return self.update_interest(cx);
        }

        self.io.notify_drained(ticket);
        if matches!(self.timer, Some((_, TimerKind::Write))) {
            self.disarm(cx);
        }
        if let Step::Close(cause) = self.update_interest(cx) {
            return Step::Close(cause);
        }

        match self.completion.take() {
            None => Step::Continue,
            Some(false) => Step::Close("response complete"),
            Some(true) if cx.quitting => Step::Close("quitting"),
            Some(true) => self.reuse(cx),
        }
    }

    fn reuse(&mut self, cx: &mut Context<'_>) -> Step {
        debug!(peer = %self.conn.peer(), requests = self.io.requests(), pipelined = self.window.len(), "connection reused");
        self.io.reset_for_reuse();
        self.decoder.reset();
        self.arm(cx, TimerKind::KeepAlive);
        self.read_and_parse(cx)
    }

    fn update_interest(&mut self, cx: &mut Context<'_>) -> Step {
        match self.conn.update_interest(cx.registry) {
            Ok(()) => Step::Continue,
            Err(e) => {
                debug!(peer = %self.conn.peer(), cause = %e, "reregister failed");
                Step::Close("reregister failed")
            }
        }
    }

    fn arm(&mut self, cx: &mut Context<'_>, kind: TimerKind) {
        self.disarm(cx);
        let config = &self.endpoint.config;
        let timeout = match kind {
            TimerKind::Startup => config.startup_timeout,
            TimerKind::Read => config.read_timeout,
            TimerKind::Write => config.write_timeout,
            TimerKind::KeepAlive => config.keep_alive_timeout,
        };
        let key = cx.timers.schedule(self.io.token(), kind, Instant::now() + timeout);
        self.timer = Some((key, kind));
    }

    fn disarm(&mut self, cx: &mut Context<'_>) {
        if let Some((key, _)) = self.timer.take() {
            cx.timers.cancel(key);
        }
    }
}

/// Accepts `identity` and a single `gzip` (or `x-gzip`) content coding.
fn request_is_gzipped(header: &RequestHeader) -> Result<bool, ParseError> {
    let mut codings = Vec::new();
    for value in header.headers().get_all(CONTENT_ENCODING) {
        let value = value.to_str().map_err(ParseError::invalid_header)?;
        codings.extend(
            value
                .split(',')
                .map(|c| c.trim().to_ascii_lowercase())
                .filter(|c| !c.is_empty() && c != "identity"),
        );
    }

    match codings.as_slice() {
        [] => Ok(false),
        [coding] if coding == "gzip" || coding == "x-gzip" => Ok(true),
        _ => Err(ParseError::unsupported_content_encoding(codings.join(", "))),
    }
}
