//! A non-blocking HTTP/1.x engine meant to be embedded in other programs.
//!
//! One reactor thread owns every socket. It accepts connections, reads and parses
//! requests, and moves response bytes back to the network, all without blocking.
//! Complete requests are handed to a fixed pool of worker threads, where a
//! [`Handler`] writes the response through an [`Exchange`] in plain blocking style.
//! The reactor takes care of keep-alive, pipelining, timeouts and backpressure.
//!
//! # Example
//!
//! ```no_run
//! use micro_nio::{EngineConfig, Server, handler_fn};
//! use tracing::info;
//!
//! let config = EngineConfig::builder().worker_threads(8).build().expect("invalid config");
//! let handle = Server::builder()
//!     .config(config)
//!     .bind("127.0.0.1:8080")
//!     .status_bind("127.0.0.1:8081")
//!     .handler(handler_fn(|exchange| {
//!         let path = exchange.request().uri().path().to_owned();
//!         info!(path = %path, "serving");
//!         exchange.response().write_str("Hello World!\r\n")?;
//!         Ok(())
//!     }))
//!     .build()
//!     .expect("invalid server setup")
//!     .start()
//!     .expect("failed to start");
//!
//! handle.join().expect("reactor failed");
//! ```
//!
//! # Architecture
//!
//! - [`server`]: assembles listeners, worker pools and the reactor thread
//! - [`reactor`]: the event loop, timers and admission control
//! - [`connection`]: per-connection state machine, I/O buffers and the [`Exchange`]
//! - [`protocol`]: requests, responses, ranges and content negotiation
//! - [`codec`]: wire-level decoding and encoding
//! - [`buffer`]: the chunked byte buffer shared between reactor and workers
//! - [`handler`]: the [`Handler`] trait and the status endpoint
//! - [`pool`], [`config`], [`metrics`]
//!
//! # Threads
//!
//! Handlers must not assume they run on any particular worker. A handler can
//! [`detach`](Exchange::detach) its exchange and finish it later from another thread;
//! until then the worker stays parked and the connection is kept open.
//!
//! # Limitations
//!
//! - HTTP/1.0 and HTTP/1.1 only
//! - No TLS (use a reverse proxy for HTTPS)
//! - Request bodies are buffered in memory up to the configured limit

pub mod buffer;
pub mod codec;
pub mod config;
pub mod connection;
pub mod handler;
pub mod metrics;
pub mod pool;
pub mod protocol;
pub mod reactor;
pub mod server;

mod date;
mod utils;
pub(crate) use utils::ensure;

pub use config::EngineConfig;
pub use connection::{Exchange, Reattach};
pub use handler::{Handler, handler_fn};
pub use server::{Server, ServerHandle};
