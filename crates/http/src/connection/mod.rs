//! Connection handling.
//!
//! Each accepted socket is driven by a state machine on the reactor thread, which reads
//! and parses requests, verifies them and queues complete ones to the worker pool as an
//! [`Exchange`]. Workers write responses into the connection's output buffer through
//! [`ConnectionIo`]; the reactor moves those bytes to the socket and decides, once a
//! response is complete, whether the connection is reused or closed.

mod exchange;
mod intercept;
mod io;
mod socket;
mod state_machine;

pub use exchange::{Exchange, Reattach};
pub use intercept::{Intercept, TraceIntercept};
pub use io::{ConnectionIo, ConnectionState, WriteCallback};

pub(crate) use socket::Connection;
pub(crate) use state_machine::{StateMachine, Step};

use std::fmt;
use std::sync::Arc;

use crate::config::EngineConfig;
use crate::handler::Handler;
use crate::pool::WorkerPool;
use crate::protocol::ResponseOptions;

/// Everything connections accepted on one listener share.
pub(crate) struct Endpoint {
    pub(crate) handler: Arc<dyn Handler>,
    pub(crate) bad_request_handler: Option<Arc<dyn Handler>>,
    pub(crate) pool: Arc<WorkerPool>,
    pub(crate) config: Arc<EngineConfig>,
    pub(crate) response_options: Arc<ResponseOptions>,
    pub(crate) intercept: Option<Arc<dyn Intercept>>,
    /// Pool whose load is attached to each request as an `EngineStatus`.
    pub(crate) reports_on: Option<Arc<WorkerPool>>,
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("pool", &self.pool)
            .field("bad_request_handler", &self.bad_request_handler.is_some())
            .field("intercept", &self.intercept.is_some())
            .field("reports_on", &self.reports_on)
            .finish_non_exhaustive()
    }
}
