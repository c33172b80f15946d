//! Server assembly: listeners, worker pools and the reactor thread.
//!
//! ```no_run
//! use micro_nio::handler::handler_fn;
//! use micro_nio::server::Server;
//!
//! let server = Server::builder()
//!     .bind("127.0.0.1:8080")
//!     .handler(handler_fn(|exchange| {
//!         exchange.response().write(b"hello")?;
//!         Ok(())
//!     }))
//!     .build()
//!     .expect("invalid server setup");
//!
//! let handle = server.start().expect("failed to start");
//! handle.join().expect("reactor failed");
//! ```

use std::fmt;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use mio::net::TcpListener;
use mio::{Poll, Waker};
use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use thiserror::Error;
use tracing::{error, info};

use crate::config::{ConfigError, EngineConfig};
use crate::connection::{Endpoint, Intercept};
use crate::handler::{Handler, StatusHandler};
use crate::pool::WorkerPool;
use crate::protocol::{EngineError, ResponseOptions};
use crate::reactor::{EventLoop, Listener, ReactorError, Shared, WAKE};

#[derive(Debug, Error)]
pub enum ServerBuildError {
    #[error("no listen address configured")]
    MissingAddress,

    #[error("no handler configured")]
    MissingHandler,

    #[error("invalid config: {source}")]
    Config {
        #[from]
        source: ConfigError,
    },

    #[error("failed to resolve listen address: {source}")]
    Resolve {
        #[source]
        source: io::Error,
    },
}

/// A configured, not yet started server.
pub struct Server {
    config: Arc<EngineConfig>,
    addresses: Vec<SocketAddr>,
    status_address: Option<SocketAddr>,
    handler: Arc<dyn Handler>,
    bad_request_handler: Option<Arc<dyn Handler>>,
    status_handler: Arc<dyn Handler>,
    intercept: Option<Arc<dyn Intercept>>,
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("config", &self.config)
            .field("addresses", &self.addresses)
            .field("status_address", &self.status_address)
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
pub struct ServerBuilder {
    config: EngineConfig,
    addresses: Vec<SocketAddr>,
    status_address: Option<SocketAddr>,
    handler: Option<Arc<dyn Handler>>,
    bad_request_handler: Option<Arc<dyn Handler>>,
    status_handler: Option<Arc<dyn Handler>>,
    intercept: Option<Arc<dyn Intercept>>,
    resolve_error: Option<io::Error>,
}

impl fmt::Debug for ServerBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerBuilder")
            .field("config", &self.config)
            .field("addresses", &self.addresses)
            .field("status_address", &self.status_address)
            .finish_non_exhaustive()
    }
}

impl ServerBuilder {
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Adds a listen address. Can be called several times.
    pub fn bind<A: ToSocketAddrs>(mut self, address: A) -> Self {
        match address.to_socket_addrs() {
            Ok(resolved) => self.addresses.extend(resolved),
            Err(e) => self.resolve_error = Some(e),
        }
        self
    }

    /// Listen address of the status endpoint.
    pub fn status_bind<A: ToSocketAddrs>(mut self, address: A) -> Self {
        match address.to_socket_addrs().map(|mut resolved| resolved.next()) {
            Ok(Some(resolved)) => self.status_address = Some(resolved),
            Ok(None) => self.resolve_error = Some(io::ErrorKind::AddrNotAvailable.into()),
            Err(e) => self.resolve_error = Some(e),
        }
        self
    }

    pub fn handler<H: Handler + 'static>(mut self, handler: H) -> Self {
        self.handler = Some(Arc::new(handler));
        self
    }

    /// Handler invoked for requests that failed parsing or verification, instead of the
    /// built-in error page.
    pub fn bad_request_handler<H: Handler + 'static>(mut self, handler: H) -> Self {
        self.bad_request_handler = Some(Arc::new(handler));
        self
    }

    /// Replaces [`StatusHandler`] on the status endpoint.
    pub fn status_handler<H: Handler + 'static>(mut self, handler: H) -> Self {
        self.status_handler = Some(Arc::new(handler));
        self
    }

    pub fn intercept<I: Intercept + 'static>(mut self, intercept: I) -> Self {
        self.intercept = Some(Arc::new(intercept));
        self
    }

    pub fn build(self) -> Result<Server, ServerBuildError> {
        if let Some(source) = self.resolve_error {
            return Err(ServerBuildError::Resolve { source });
        }
        if self.addresses.is_empty() {
            return Err(ServerBuildError::MissingAddress);
        }
        let handler = self.handler.ok_or(ServerBuildError::MissingHandler)?;
        self.config.validate()?;

        Ok(Server {
            config: Arc::new(self.config),
            addresses: self.addresses,
            status_address: self.status_address,
            handler,
            bad_request_handler: self.bad_request_handler,
            status_handler: self.status_handler.unwrap_or_else(|| Arc::new(StatusHandler)),
            intercept: self.intercept,
        })
    }
}

impl Server {
    pub fn builder() -> ServerBuilder {
        ServerBuilder::default()
    }

    /// Binds every listener, starts the worker pools and spawns the reactor thread.
    pub fn start(self) -> Result<ServerHandle, EngineError> {
        let config = self.config;
        let sockets = self
            .addresses
            .iter()
            .map(|address| bind_listener(*address, config.backlog))
            .collect::<io::Result<Vec<_>>>()?;
        let status_socket = self.status_address.map(|address| bind_listener(address, config.backlog)).transpose()?;
        let local_addrs = sockets.iter().map(TcpListener::local_addr).collect::<io::Result<Vec<_>>>()?;
        let status_addr = status_socket.as_ref().map(TcpListener::local_addr).transpose()?;

        let response_options = Arc::new(ResponseOptions::from(config.as_ref()));
        let pool = Arc::new(WorkerPool::new("nio-worker", config.worker_threads, config.exit_on_fatal)?);
        let mut pools = vec![Arc::clone(&pool)];

        let endpoint = Arc::new(Endpoint {
            handler: self.handler,
            bad_request_handler: self.bad_request_handler,
            pool: Arc::clone(&pool),
            config: Arc::clone(&config),
            response_options: Arc::clone(&response_options),
            intercept: self.intercept,
            reports_on: None,
        });
        let mut listeners: Vec<_> =
            sockets.into_iter().map(|socket| Listener::new(socket, Arc::clone(&endpoint))).collect();

        if let Some(socket) = status_socket {
            let status_pool = match WorkerPool::new("nio-status", 1, config.exit_on_fatal) {
                Ok(status_pool) => Arc::new(status_pool),
                Err(e) => {
                    stop_pools(&pools, &config);
                    return Err(e.into());
                }
            };
            let status_endpoint = Arc::new(Endpoint {
                handler: self.status_handler,
                bad_request_handler: None,
                pool: Arc::clone(&status_pool),
                config: Arc::clone(&config),
                response_options,
                intercept: None,
                reports_on: Some(pool),
            });
            listeners.push(Listener::new(socket, status_endpoint));
            pools.push(status_pool);
        }

        let (shared, reactor) = match spawn_reactor(listeners, &config) {
            Ok(spawned) => spawned,
            Err(e) => {
                stop_pools(&pools, &config);
                return Err(e.into());
            }
        };

        info!(addresses = ?local_addrs, status = ?status_addr, workers = config.worker_threads, "server started");
        Ok(ServerHandle {
            shared,
            reactor: Mutex::new(Some(reactor)),
            pools: Mutex::new(pools),
            local_addrs,
            status_addr,
            config,
        })
    }
}

type ReactorThread = JoinHandle<Result<(), ReactorError>>;

fn spawn_reactor(listeners: Vec<Listener>, config: &Arc<EngineConfig>) -> io::Result<(Arc<Shared>, ReactorThread)> {
    let poll = Poll::new()?;
    let shared = Arc::new(Shared::new(Waker::new(poll.registry(), WAKE)?));
    let event_loop = EventLoop::new(poll, Arc::clone(&shared), listeners, Arc::clone(config))?;
    let reactor = thread::Builder::new().name("nio-reactor".to_owned()).spawn(move || event_loop.run())?;
    Ok((shared, reactor))
}

fn stop_pools(pools: &[Arc<WorkerPool>], config: &EngineConfig) -> bool {
    pools.iter().fold(true, |clean, pool| pool.quit(config.quit_timeout) && clean)
}

fn bind_listener(address: SocketAddr, backlog: i32) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(address), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&address.into())?;
    socket.listen(backlog)?;
    Ok(TcpListener::from_std(socket.into()))
}

/// A running server.
///
/// Dropping the handle stops the server without waiting for in-flight requests.
pub struct ServerHandle {
    shared: Arc<Shared>,
    reactor: Mutex<Option<ReactorThread>>,
    pools: Mutex<Vec<Arc<WorkerPool>>>,
    local_addrs: Vec<SocketAddr>,
    status_addr: Option<SocketAddr>,
    config: Arc<EngineConfig>,
}

impl fmt::Debug for ServerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerHandle")
            .field("local_addrs", &self.local_addrs)
            .field("status_addr", &self.status_addr)
            .field("connections", &self.connections())
            .finish_non_exhaustive()
    }
}

impl ServerHandle {
    /// Address of the first listener.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addrs[0]
    }

    pub fn local_addrs(&self) -> &[SocketAddr] {
        &self.local_addrs
    }

    pub fn status_addr(&self) -> Option<SocketAddr> {
        self.status_addr
    }

    /// Open connections, as last published by the reactor.
    pub fn connections(&self) -> usize {
        self.shared.open_connections()
    }

    /// Stops accepting and shuts the server down.
    ///
    /// With `wait`, in-flight connections get until the quit timeout to finish; without,
    /// they are closed right away. Returns `false` when some worker was still busy at the
    /// deadline and had to be detached.
    pub fn quit(&self, wait: bool) -> Result<bool, EngineError> {
        self.shared.request_quit(wait);
        let reactor = self.join_reactor();

        let pools = std::mem::take(&mut *self.pools.lock());
        let clean = stop_pools(&pools, &self.config);
        info!(clean, "server stopped");

        reactor?;
        Ok(clean)
    }

    /// Blocks until the reactor stops, either after [`quit`](Self::quit) or on a fatal error.
    pub fn join(&self) -> Result<(), EngineError> {
        self.join_reactor()
    }

    fn join_reactor(&self) -> Result<(), EngineError> {
        let Some(reactor) = self.reactor.lock().take() else {
            return Ok(());
        };
        match reactor.join() {
            Ok(result) => result.map_err(EngineError::from),
            Err(_) => {
                error!("reactor thread panicked");
                Err(io::Error::other("reactor thread panicked").into())
            }
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        let running = self.reactor.lock().is_some() || !self.pools.lock().is_empty();
        if running {
            if let Err(e) = self.quit(false) {
                error!(cause = %e, "server shutdown failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpStream;
    use std::sync::mpsc;
    use std::time::Duration;

    use bytes::Bytes;
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use http::HeaderValue;
    use http::header::CONTENT_TYPE;
    use indoc::indoc;

    use crate::connection::Exchange;
    use crate::handler::handler_fn;
    use crate::protocol::{BadRequest, BoxError, EngineError, SendError, UsageError};

    /// Larger than what loopback socket buffers absorb.
    const STALLED: usize = 32 * 1024 * 1024;

    fn test_config() -> EngineConfig {
        EngineConfig::builder()
            .worker_threads(2)
            .poll_interval(Duration::from_millis(50))
            .quit_timeout(Duration::from_secs(2))
            .build()
            .unwrap()
    }

    fn serve<H: Handler + 'static>(handler: H) -> ServerHandle {
        serve_with(test_config(), handler)
    }

    fn serve_with<H: Handler + 'static>(config: EngineConfig, handler: H) -> ServerHandle {
        Server::builder().config(config).bind("127.0.0.1:0").handler(handler).build().unwrap().start().unwrap()
    }

    /// Output never reaches a client that stops reading, so writes stay in flight.
    fn stalled_config() -> EngineConfig {
        EngineConfig::builder()
            .worker_threads(2)
            .poll_interval(Duration::from_millis(50))
            .quit_timeout(Duration::from_secs(2))
            .write_timeout(Duration::from_millis(300))
            .output_buffer_limit(40 * 1024 * 1024)
            .build()
            .unwrap()
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| b"0123456789abcdef"[i % 16]).collect()
    }

    /// Reads until the received bytes end with `end`.
    fn read_until(stream: &mut TcpStream, end: &[u8]) -> Vec<u8> {
        let mut received = Vec::new();
        let mut buf = [0u8; 4096];
        while !received.ends_with(end) {
            let n = stream.read(&mut buf).unwrap();
            assert_ne!(n, 0, "closed after {:?}", String::from_utf8_lossy(&received));
            received.extend_from_slice(&buf[..n]);
        }
        received
    }

    fn connect(addr: SocketAddr) -> TcpStream {
        let stream = TcpStream::connect(addr).unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        stream
    }

    /// Sends `request` and reads until the server closes the connection.
    fn exchange(addr: SocketAddr, request: &[u8]) -> String {
        let mut stream = connect(addr);
        stream.write_all(request).unwrap();
        let mut response = Vec::new();
        stream.read_to_end(&mut response).unwrap();
        String::from_utf8_lossy(&response).into_owned()
    }

    fn hello(exchange: &mut Exchange) -> Result<(), BoxError> {
        exchange.response().write(b"hello")?;
        Ok(())
    }

    fn echo(exchange: &mut Exchange) -> Result<(), BoxError> {
        let body: Bytes = exchange.request().body().clone();
        exchange.response().set_content_length(body.len() as u64)?;
        exchange.response().write(&body)?;
        Ok(())
    }

    #[test]
    fn chunked_responses_on_a_kept_alive_connection() {
        let server = serve(handler_fn(hello));
        let request = indoc! {"
            GET /first HTTP/1.1\r
            Host: localhost\r
            \r
            GET /second HTTP/1.1\r
            Host: localhost\r
            Connection: close\r
            \r
        "};

        let response = exchange(server.local_addr(), request.as_bytes());
        assert_eq!(response.matches("HTTP/1.1 200 OK\r\n").count(), 2);
        assert_eq!(response.matches("transfer-encoding: chunked\r\n").count(), 2);
        assert_eq!(response.matches("5\r\nhello\r\n0\r\n\r\n").count(), 2);
        assert_eq!(response.matches("connection: close\r\n").count(), 1);
        assert!(server.quit(true).unwrap());
    }

    #[test]
    fn single_byte_range() {
        let server = serve(handler_fn(|exchange: &mut Exchange| {
            let body: Vec<u8> = (0..100u8).map(|i| b'0' + i % 10).collect();
            exchange.response().set_content_length(body.len() as u64)?;
            exchange.response().write(&body)?;
            Ok(())
        }));

        let request = "GET / HTTP/1.1\r\nHost: localhost\r\nRange: bytes=50-59\r\nConnection: close\r\n\r\n";
        let response = exchange(server.local_addr(), request.as_bytes());
        assert!(response.starts_with("HTTP/1.1 206 Partial Content\r\n"), "{response}");
        assert!(response.contains("content-range: bytes 50-59/100\r\n"));
        assert!(response.contains("content-length: 10\r\n"));
        assert!(response.ends_with("\r\n\r\n0123456789"));
    }

    #[test]
    fn malformed_request_gets_400_and_close() {
        let server = serve(handler_fn(hello));
        let request = "GET / HTTP/1.1\r\nHost: localhost\r\nContent-Length: abc\r\n\r\n";
        let response = exchange(server.local_addr(), request.as_bytes());
        assert!(response.starts_with("HTTP/1.1 400 Bad Request\r\n"), "{response}");
        assert!(response.contains("connection: close\r\n"));
        assert!(response.ends_with("Bad Request"));
    }

    #[test]
    fn http11_without_host_is_rejected() {
        let server = serve(handler_fn(hello));
        let response = exchange(server.local_addr(), b"GET / HTTP/1.1\r\n\r\n");
        assert!(response.starts_with("HTTP/1.1 400 Bad Request\r\n"), "{response}");
    }

    #[test]
    fn oversized_body_gets_413() {
        let config = EngineConfig::builder().worker_threads(1).max_body_size(4).build().unwrap();
        let server = Server::builder().config(config).bind("127.0.0.1:0").handler(handler_fn(echo)).build().unwrap();
        let server = server.start().unwrap();

        let request = "POST / HTTP/1.1\r\nHost: localhost\r\nContent-Length: 10\r\n\r\n0123456789";
        let response = exchange(server.local_addr(), request.as_bytes());
        assert!(response.starts_with("HTTP/1.1 413 Payload Too Large\r\n"), "{response}");
    }

    #[test]
    fn bad_request_handler_sees_the_cause() {
        let server = Server::builder()
            .config(test_config())
            .bind("127.0.0.1:0")
            .handler(handler_fn(hello))
            .bad_request_handler(handler_fn(|exchange: &mut Exchange| {
                let status = exchange.request().extensions().get::<BadRequest>().map(|b| b.status);
                let text = format!("custom {}", status.map(|s| s.as_u16()).unwrap_or_default());
                exchange.response().set_status(http::StatusCode::BAD_REQUEST)?;
                exchange.response().write(text.as_bytes())?;
                Ok(())
            }))
            .build()
            .unwrap()
            .start()
            .unwrap();

        let response = exchange(server.local_addr(), b"GET / HTTP/1.1\r\n\r\n");
        assert!(response.starts_with("HTTP/1.1 400 Bad Request\r\n"), "{response}");
        assert!(response.contains("custom 400"));
    }

    #[test]
    fn http10_response_is_close_delimited() {
        let server = serve(handler_fn(hello));
        let response = exchange(server.local_addr(), b"GET / HTTP/1.0\r\n\r\n");
        assert!(response.starts_with("HTTP/1.0 200 OK\r\n"), "{response}");
        assert!(!response.contains("transfer-encoding"));
        assert!(response.contains("connection: close\r\n"));
        assert!(response.ends_with("\r\n\r\nhello"));
    }

    #[test]
    fn handler_error_becomes_500() {
        let server = serve(handler_fn(|_: &mut Exchange| Err("boom".into())));
        let response = exchange(server.local_addr(), b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n");
        assert!(response.starts_with("HTTP/1.1 500 Internal Server Error\r\n"), "{response}");
        assert!(response.contains("connection: close\r\n"));
    }

    #[test]
    fn handler_panic_becomes_500() {
        let server = serve(handler_fn(|_: &mut Exchange| panic!("handler bug")));
        let response = exchange(server.local_addr(), b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n");
        assert!(response.starts_with("HTTP/1.1 500 Internal Server Error\r\n"), "{response}");
    }

    #[test]
    fn detached_exchange_completes_on_resume() {
        let server = serve(handler_fn(|exchange: &mut Exchange| {
            let reattach = exchange.detach()?;
            assert_eq!(exchange.detach().unwrap_err(), crate::protocol::UsageError::AlreadyDetached);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                reattach
                    .resume(|exchange| {
                        exchange.response().write(b"later")?;
                        Ok(())
                    })
                    .unwrap();
            });
            Ok(())
        }));

        let request = "GET / HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n";
        let response = exchange(server.local_addr(), request.as_bytes());
        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"), "{response}");
        assert!(response.contains("5\r\nlater\r\n0\r\n\r\n"));
    }

    #[test]
    fn dropped_reattach_finishes_the_response() {
        let server = serve(handler_fn(|exchange: &mut Exchange| {
            exchange.response().set_content_length(2)?;
            exchange.response().write(b"ok")?;
            let reattach = exchange.detach()?;
            thread::spawn(move || drop(reattach));
            Ok(())
        }));

        let request = "GET / HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n";
        let response = exchange(server.local_addr(), request.as_bytes());
        assert!(response.ends_with("\r\n\r\nok"), "{response}");
    }

    #[test]
    fn expect_continue_before_body() {
        let server = serve(handler_fn(echo));
        let mut stream = connect(server.local_addr());
        let head = "POST / HTTP/1.1\r\nHost: localhost\r\nContent-Length: 5\r\nExpect: 100-continue\r\nConnection: close\r\n\r\n";
        stream.write_all(head.as_bytes()).unwrap();

        let mut interim = [0u8; 25];
        stream.read_exact(&mut interim).unwrap();
        assert_eq!(&interim, b"HTTP/1.1 100 Continue\r\n\r\n");

        stream.write_all(b"hello").unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).unwrap();
        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"), "{response}");
        assert!(response.ends_with("\r\n\r\nhello"));
    }

    #[test]
    fn gzip_request_body_is_inflated() {
        let server = serve(handler_fn(echo));
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"compressed payload").unwrap();
        let body = encoder.finish().unwrap();

        let mut request = format!(
            "POST / HTTP/1.1\r\nHost: localhost\r\nContent-Encoding: gzip\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            body.len()
        )
        .into_bytes();
        request.extend_from_slice(&body);

        let response = exchange(server.local_addr(), &request);
        assert!(response.ends_with("\r\n\r\ncompressed payload"), "{response}");
    }

    #[test]
    fn chunked_request_body() {
        let server = serve(handler_fn(echo));
        let request = indoc! {"
            POST / HTTP/1.1\r
            Host: localhost\r
            Transfer-Encoding: chunked\r
            Connection: close\r
            \r
            4\r
            wiki\r
            5\r
            pedia\r
            0\r
            \r
        "};
        let response = exchange(server.local_addr(), request.as_bytes());
        assert!(response.ends_with("\r\n\r\nwikipedia"), "{response}");
    }

    #[test]
    fn status_endpoint_reports_counters() {
        let server = Server::builder()
            .config(test_config())
            .bind("127.0.0.1:0")
            .status_bind("127.0.0.1:0")
            .handler(handler_fn(hello))
            .build()
            .unwrap()
            .start()
            .unwrap();

        let status_addr = server.status_addr().unwrap();
        let response = exchange(status_addr, b"GET / HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"), "{response}");
        assert!(response.contains("worker_threads: 2\n"));
        assert!(response.contains("requests_handled: "));
    }

    #[test]
    fn response_headers_reach_the_wire() {
        let server = serve(handler_fn(|exchange: &mut Exchange| {
            exchange.response().insert_header(CONTENT_TYPE, HeaderValue::from_static("text/plain"))?;
            exchange.response().write_str("text")?;
            Ok(())
        }));
        let request = "GET / HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n";
        let response = exchange(server.local_addr(), request.as_bytes());
        assert!(response.contains("content-type: text/plain; charset=utf-8\r\n"), "{response}");
        assert!(response.contains("date: "));
    }

    #[test]
    fn write_callback_resume_streams_past_the_buffer_limit() {
        const BODY: usize = 256 * 1024;
        let (tx, rx) = mpsc::channel();
        let server = serve(handler_fn(move |exchange: &mut Exchange| {
            if exchange.request().uri().path() != "/stream" {
                return hello(exchange);
            }
            exchange.response().set_content_length((5 + BODY) as u64)?;
            exchange.response().write(b"first")?;
            let reattach = exchange.detach()?;
            let tx = tx.clone();
            exchange.write_async(move |result| {
                let _ = tx.send(result);
                reattach
                    .resume(|exchange| {
                        exchange.response().write(&pattern(BODY))?;
                        Ok(())
                    })
                    .unwrap();
            })?;
            Ok(())
        }));

        let request = "GET /stream HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n";
        let mut stream = connect(server.local_addr());
        stream.write_all(request.as_bytes()).unwrap();
        let mut response = Vec::new();
        stream.read_to_end(&mut response).unwrap();

        let mut expected = b"\r\n\r\nfirst".to_vec();
        expected.extend_from_slice(&pattern(BODY));
        assert!(response.ends_with(&expected), "received {} bytes", response.len());
        assert!(matches!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), Ok(())));

        let response = exchange(server.local_addr(), b"GET / HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
        assert!(response.ends_with("5\r\nhello\r\n0\r\n\r\n"), "{response}");
        assert!(server.quit(true).unwrap());
    }

    #[test]
    fn write_callback_sees_the_connection_close() {
        let (tx, rx) = mpsc::channel();
        let server = serve_with(
            stalled_config(),
            handler_fn(move |exchange: &mut Exchange| {
                exchange.response().write(&vec![b'x'; STALLED])?;
                let tx = tx.clone();
                exchange.write_async(move |result| {
                    let _ = tx.send(result);
                })?;
                Ok(())
            }),
        );

        // never reads, the write timeout closes the connection
        let mut stream = connect(server.local_addr());
        stream.write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n").unwrap();
        let result = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(matches!(result, Err(SendError::Closed)), "{result:?}");
    }

    #[test]
    fn second_write_async_is_rejected_while_one_is_in_flight() {
        let (tx, rx) = mpsc::channel();
        let server = serve_with(
            stalled_config(),
            handler_fn(move |exchange: &mut Exchange| {
                exchange.response().write(&vec![b'x'; STALLED])?;
                exchange.write_async(|_| {})?;
                let _ = tx.send(exchange.write_async(|_| {}));
                Ok(())
            }),
        );

        let mut stream = connect(server.local_addr());
        stream.write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n").unwrap();
        let second = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(matches!(second, Err(SendError::Usage { source: UsageError::WriteInFlight })), "{second:?}");
    }

    #[test]
    fn blocking_write_past_the_limit_fails_while_a_write_is_in_flight() {
        let (tx, rx) = mpsc::channel();
        let server = serve_with(
            stalled_config(),
            handler_fn(move |exchange: &mut Exchange| {
                exchange.response().write(&vec![b'x'; STALLED])?;
                exchange.write_async(|_| {})?;
                exchange.response().write(&vec![b'y'; 24 * 1024 * 1024])?;
                let _ = tx.send(exchange.response().push());
                Ok(())
            }),
        );

        let mut stream = connect(server.local_addr());
        stream.write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n").unwrap();
        let pushed = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(matches!(pushed, Err(SendError::Usage { source: UsageError::WriteInFlight })), "{pushed:?}");
    }

    #[test]
    fn failing_continuation_is_reported_to_resume() {
        let (tx, rx) = mpsc::channel();
        let server = serve(handler_fn(move |exchange: &mut Exchange| {
            let reattach = exchange.detach()?;
            let tx = tx.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                let _ = tx.send(reattach.resume(|_| Err("backend unavailable".into())));
            });
            Ok(())
        }));

        let response = exchange(server.local_addr(), b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n");
        assert!(response.starts_with("HTTP/1.1 500 Internal Server Error\r\n"), "{response}");
        match rx.recv_timeout(Duration::from_secs(5)).unwrap() {
            Err(EngineError::Handler(cause)) => assert_eq!(cause.to_string(), "backend unavailable"),
            other => panic!("unexpected resume result: {other:?}"),
        }
    }

    #[test]
    fn large_body_is_delivered_through_a_small_buffer() {
        const BODY: usize = 64 * 1024;
        let config = EngineConfig::builder().worker_threads(1).output_buffer_limit(16 * 1024).build().unwrap();
        let server = serve_with(
            config,
            handler_fn(|exchange: &mut Exchange| {
                exchange.response().set_content_length(BODY as u64)?;
                exchange.response().write(&pattern(BODY))?;
                Ok(())
            }),
        );

        let mut stream = connect(server.local_addr());
        stream.write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n").unwrap();
        // let the worker block on the full buffer before reading
        thread::sleep(Duration::from_millis(50));
        let mut response = Vec::new();
        stream.read_to_end(&mut response).unwrap();

        let head_end = response.windows(4).position(|w| w == b"\r\n\r\n").unwrap() + 4;
        assert_eq!(&response[head_end..], pattern(BODY).as_slice());
    }

    #[test]
    fn idle_kept_alive_connection_is_closed() {
        let config = EngineConfig::builder()
            .worker_threads(1)
            .poll_interval(Duration::from_millis(20))
            .keep_alive_timeout(Duration::from_millis(200))
            .build()
            .unwrap();
        let server = serve_with(config, handler_fn(hello));

        let mut stream = connect(server.local_addr());
        stream.write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n").unwrap();
        let response = read_until(&mut stream, b"0\r\n\r\n");
        assert!(response.starts_with(b"HTTP/1.1 200 OK\r\n"));

        let idle = std::time::Instant::now();
        let mut rest = Vec::new();
        stream.read_to_end(&mut rest).unwrap();
        assert!(rest.is_empty());
        assert!(idle.elapsed() >= Duration::from_millis(100));
    }

    #[test]
    fn stalled_request_head_is_dropped() {
        let config = EngineConfig::builder()
            .worker_threads(1)
            .poll_interval(Duration::from_millis(20))
            .read_timeout(Duration::from_millis(200))
            .build()
            .unwrap();
        let server = serve_with(config, handler_fn(hello));

        let mut stream = connect(server.local_addr());
        stream.write_all(b"GET / HTTP/1.1\r\nHost: loc").unwrap();
        let mut response = Vec::new();
        stream.read_to_end(&mut response).unwrap();
        assert!(response.is_empty(), "{}", String::from_utf8_lossy(&response));
    }

    #[test]
    fn silent_connection_is_dropped() {
        let config = EngineConfig::builder()
            .worker_threads(1)
            .poll_interval(Duration::from_millis(20))
            .startup_timeout(Duration::from_millis(200))
            .build()
            .unwrap();
        let server = serve_with(config, handler_fn(hello));

        let mut stream = connect(server.local_addr());
        let mut response = Vec::new();
        stream.read_to_end(&mut response).unwrap();
        assert!(response.is_empty());
    }

    #[test]
    fn quit_without_connections() {
        let server = serve(handler_fn(hello));
        assert_eq!(server.connections(), 0);
        assert!(server.quit(true).unwrap());
        TcpStream::connect(server.local_addr()).unwrap_err();
    }

    #[test]
    fn builder_errors() {
        assert!(matches!(Server::builder().handler(handler_fn(hello)).build(), Err(ServerBuildError::MissingAddress)));
        assert!(matches!(Server::builder().bind("127.0.0.1:0").build(), Err(ServerBuildError::MissingHandler)));

        let config = EngineConfig { worker_threads: 0, ..Default::default() };
        let result = Server::builder().config(config).bind("127.0.0.1:0").handler(handler_fn(hello)).build();
        assert!(matches!(result, Err(ServerBuildError::Config { .. })));
    }
}
