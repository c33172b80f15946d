//! One request/response pair, as seen by a handler.
//!
//! An exchange is normally completed by the worker as soon as the handler returns: the
//! response is finished and the connection handed back to the reactor. A handler that
//! needs to answer later calls [`Exchange::detach`] and keeps the returned [`Reattach`].
//! The exchange is then parked when the handler returns, and completed once the
//! continuation given to [`Reattach::resume`] ran, or when the `Reattach` is dropped.
//!
//! Parking is the barrier `resume` waits on when called from another thread. Called from
//! the handler's own thread, `resume` defers the continuation to right after the handler.
//! The reactor thread never runs a continuation: `resume` and dropping a `Reattach` from
//! a write callback hand the work to the worker pool.

use std::fmt;
use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, ThreadId};

use http::StatusCode;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error};

use crate::connection::{ConnectionIo, ConnectionState};
use crate::handler::Handler;
use crate::metrics::Metrics;
use crate::ensure;
use crate::pool::{WorkerPool, panic_message};
use crate::protocol::{BoxError, EngineError, Request, Response, SendError, UsageError};
use crate::reactor;

type Continuation = Box<dyn FnOnce(&mut Exchange) -> Result<(), BoxError> + Send + 'static>;

enum SlotState {
    /// The handler is still running.
    Running,
    /// The handler returned, waiting for a resume.
    Parked(Box<Exchange>),
    /// Resumed before the handler returned.
    Resumed(Continuation),
    /// The `Reattach` was dropped before the handler returned.
    Released,
    Done,
}

struct CallSlot {
    state: Mutex<SlotState>,
    parked: Condvar,
    worker: ThreadId,
    pool: Arc<WorkerPool>,
    exit_on_fatal: bool,
}

pub struct Exchange {
    request: Request,
    response: Response,
    io: Arc<ConnectionIo>,
    pool: Arc<WorkerPool>,
    slot: Option<Arc<CallSlot>>,
    exit_on_fatal: bool,
}

impl fmt::Debug for Exchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Exchange")
            .field("request", &self.request)
            .field("response", &self.response)
            .field("detached", &self.is_detached())
            .finish_non_exhaustive()
    }
}

impl Exchange {
    pub(crate) fn new(
        request: Request,
        response: Response,
        io: Arc<ConnectionIo>,
        pool: Arc<WorkerPool>,
        exit_on_fatal: bool,
    ) -> Self {
        Self { request, response, io, pool, slot: None, exit_on_fatal }
    }

    #[inline]
    pub fn request(&self) -> &Request {
        &self.request
    }

    #[inline]
    pub fn request_mut(&mut self) -> &mut Request {
        &mut self.request
    }

    #[inline]
    pub fn response(&mut self) -> &mut Response {
        &mut self.response
    }

    #[inline]
    pub fn peer_addr(&self) -> SocketAddr {
        self.io.peer_addr()
    }

    /// The connection carrying this exchange.
    #[inline]
    pub fn connection(&self) -> &ConnectionIo {
        &self.io
    }

    pub fn is_detached(&self) -> bool {
        self.slot.is_some()
    }

    /// Keeps the exchange open after the handler returns.
    ///
    /// Can be called once per exchange.
    pub fn detach(&mut self) -> Result<Reattach, UsageError> {
        ensure!(self.slot.is_none(), UsageError::AlreadyDetached);
        let slot = Arc::new(CallSlot {
            state: Mutex::new(SlotState::Running),
            parked: Condvar::new(),
            worker: thread::current().id(),
            pool: Arc::clone(&self.pool),
            exit_on_fatal: self.exit_on_fatal,
        });
        self.slot = Some(Arc::clone(&slot));
        Ok(Reattach { slot: Some(slot) })
    }

    /// Pushes the staged body and returns without waiting for the socket.
    ///
    /// `callback` runs on the reactor thread once the output buffer drained, or with
    /// [`SendError::Closed`] if the connection went away first. Only one asynchronous
    /// write may be in flight.
    pub fn write_async<F>(&mut self, callback: F) -> Result<(), SendError>
    where
        F: FnOnce(Result<(), SendError>) + Send + 'static,
    {
        ensure!(!self.io.write_in_flight(), UsageError::WriteInFlight.into());
        self.response.push()?;
        self.io.write_async(Box::new(callback))?;
        Ok(())
    }

    /// Runs `handler` on the current worker thread.
    pub(crate) fn run(mut self, handler: &dyn Handler) {
        self.io.transition(ConnectionState::Queued, ConnectionState::Processing);
        let outcome = guarded(self.exit_on_fatal, || handler.handle(&mut self));

        let Some(slot) = self.slot.as_ref().map(Arc::clone) else {
            return self.complete(outcome);
        };

        if outcome.is_err() {
            *slot.state.lock() = SlotState::Done;
            slot.parked.notify_all();
            return self.complete(outcome);
        }

        let mut state = slot.state.lock();
        match std::mem::replace(&mut *state, SlotState::Done) {
            SlotState::Running => {
                debug!(peer = %self.peer_addr(), "exchange parked");
                *state = SlotState::Parked(Box::new(self));
                drop(state);
                slot.parked.notify_all();
            }
            SlotState::Resumed(continuation) => {
                drop(state);
                let outcome = guarded(self.exit_on_fatal, || continuation(&mut self));
                self.complete(outcome);
            }
            _ => {
                drop(state);
                self.complete(Ok(()));
            }
        }
    }

    fn complete(mut self, outcome: Result<(), BoxError>) {
        let peer = self.peer_addr();
        Metrics::global().request_handled();

        let result = match outcome {
            Ok(()) => self.response.finish(),
            Err(cause) => {
                error!(%peer, %cause, "handler failed");
                if self.response.is_committed() {
                    self.io.abandon();
                    return;
                }
                self.response.send_error_page(StatusCode::INTERNAL_SERVER_ERROR)
            }
        };

        match result {
            Ok(()) if !self.response.output_failed() => self.io.complete(self.response.is_keep_alive()),
            Ok(()) => self.io.abandon(),
            Err(e) => {
                debug!(%peer, cause = %e, "finishing response failed");
                self.io.abandon();
            }
        }
    }
}

/// Handle to a detached [`Exchange`].
pub struct Reattach {
    slot: Option<Arc<CallSlot>>,
}

impl fmt::Debug for Reattach {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reattach").finish_non_exhaustive()
    }
}

impl Reattach {
    /// Runs `continuation` on the exchange, then completes it.
    ///
    /// Waits until the handler returned, then runs `continuation` on the calling thread
    /// and reports its failure back. From inside the handler itself, `continuation` is
    /// queued to run on the worker right after the handler and `Ok` is returned.
    ///
    /// Called on the reactor thread, typically from a write callback, the whole resume is
    /// submitted to the worker pool and `Ok` is returned at once. A failing continuation
    /// is then only logged.
    pub fn resume<F>(mut self, continuation: F) -> Result<(), EngineError>
    where
        F: FnOnce(&mut Exchange) -> Result<(), BoxError> + Send + 'static,
    {
        let Some(slot) = self.slot.take() else {
            return Ok(());
        };

        if reactor::on_reactor_thread() {
            let pool = Arc::clone(&slot.pool);
            let reattach = Reattach { slot: Some(slot) };
            pool.submit(move || {
                if let Err(e) = reattach.resume(continuation) {
                    debug!(cause = %e, "deferred resume failed");
                }
            });
            return Ok(());
        }

        let mut state = slot.state.lock();
        if thread::current().id() != slot.worker {
            while matches!(*state, SlotState::Running) {
                slot.parked.wait(&mut state);
            }
        }

        match std::mem::replace(&mut *state, SlotState::Done) {
            SlotState::Parked(mut exchange) => {
                drop(state);
                let outcome = guarded(slot.exit_on_fatal, || continuation(&mut *exchange));
                let failure = outcome.as_ref().err().map(ToString::to_string);
                (*exchange).complete(outcome);
                match failure {
                    Some(message) => Err(EngineError::Handler(message.into())),
                    None => Ok(()),
                }
            }
            SlotState::Running => {
                *state = SlotState::Resumed(Box::new(continuation));
                Ok(())
            }
            other => {
                *state = other;
                Err(UsageError::Finished.into())
            }
        }
    }
}

impl Drop for Reattach {
    fn drop(&mut self) {
        let Some(slot) = self.slot.take() else {
            return;
        };

        let mut state = slot.state.lock();
        if reactor::on_reactor_thread() && matches!(*state, SlotState::Parked(_)) {
            drop(state);
            let pool = Arc::clone(&slot.pool);
            let reattach = Reattach { slot: Some(slot) };
            pool.submit(move || drop(reattach));
            return;
        }

        match std::mem::replace(&mut *state, SlotState::Done) {
            SlotState::Parked(exchange) => {
                drop(state);
                (*exchange).complete(Ok(()));
            }
            SlotState::Running => *state = SlotState::Released,
            other => *state = other,
        }
    }
}

fn guarded<F>(exit_on_fatal: bool, f: F) -> Result<(), BoxError>
where
    F: FnOnce() -> Result<(), BoxError>,
{
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            error!(panic = %message, "handler panicked");
            if exit_on_fatal {
                error!("exiting on fatal handler failure");
                std::process::exit(70);
            }
            Err(format!("handler panicked: {message}").into())
        }
    }
}
