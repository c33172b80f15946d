//! Connection state shared between the reactor and the workers.
//!
//! The reactor owns the socket. Workers only ever touch a connection through its
//! [`ConnectionIo`]: they append response bytes to the output buffer and ask the reactor,
//! through a pending entry and a wake-up, to write them out.
//!
//! Write handshake: every write request takes a ticket. The reactor snapshots the newest
//! ticket before writing and, once the output buffer is empty, marks that ticket drained.
//! Bytes appended before a ticket was taken are therefore on the wire when the ticket
//! drains. Blocking writers wait on a condition variable; an asynchronous writer leaves
//! a callback the reactor runs instead.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use mio::Token;
use parking_lot::{Condvar, Mutex};
use tracing::trace;

use crate::buffer::Buffer;
use crate::config::EngineConfig;
use crate::ensure;
use crate::protocol::{BodySink, SendError, UsageError};
use crate::reactor::{self, Pending, Shared};

/// Called on the reactor thread once an asynchronous write drained, or failed.
pub type WriteCallback = Box<dyn FnOnce(Result<(), SendError>) + Send + 'static>;

/// Lifecycle of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    /// Parsing a request.
    Reading = 0,
    /// Request complete, waiting for a worker.
    Queued = 1,
    /// A handler is running.
    Processing = 2,
    /// The response is committed and being written.
    Writing = 3,
    Closed = 4,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionState::Reading,
            1 => ConnectionState::Queued,
            2 => ConnectionState::Processing,
            3 => ConnectionState::Writing,
            _ => ConnectionState::Closed,
        }
    }
}

#[derive(Default)]
struct WriteHandshake {
    requested: u64,
    drained: u64,
    callback: Option<(u64, WriteCallback)>,
}

pub struct ConnectionIo {
    token: Token,
    generation: u64,
    peer: SocketAddr,
    input: Buffer,
    output: Buffer,
    state: AtomicU8,
    closed: AtomicBool,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
    requests: AtomicU64,
    handshake: Mutex<WriteHandshake>,
    drained: Condvar,
    reactor: Arc<Shared>,
}

impl fmt::Debug for ConnectionIo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionIo")
            .field("token", &self.token)
            .field("peer", &self.peer)
            .field("state", &self.state())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl ConnectionIo {
    pub(crate) fn new(
        token: Token,
        generation: u64,
        peer: SocketAddr,
        reactor: Arc<Shared>,
        config: &EngineConfig,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this: &Weak<ConnectionIo>| {
            let output = Buffer::with_chunk_sizes(config.min_chunk_size, config.max_chunk_size);
            output.set_size_limit(config.output_buffer_limit);
            let this = Weak::clone(this);
            output.set_drain_callback(Box::new(move |_, _| {
                if let Some(io) = this.upgrade() {
                    io.request_write();
                }
                Ok(())
            }));

            Self {
                token,
                generation,
                peer,
                input: Buffer::with_chunk_sizes(config.min_chunk_size, config.max_chunk_size),
                output,
                state: AtomicU8::new(ConnectionState::Reading as u8),
                closed: AtomicBool::new(false),
                bytes_read: AtomicU64::new(0),
                bytes_written: AtomicU64::new(0),
                requests: AtomicU64::new(0),
                handshake: Mutex::new(WriteHandshake::default()),
                drained: Condvar::new(),
                reactor,
            }
        })
    }

    #[inline]
    pub(crate) fn token(&self) -> Token {
        self.token
    }

    #[inline]
    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    #[inline]
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    #[inline]
    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        let previous = ConnectionState::from_u8(self.state.swap(state as u8, Ordering::AcqRel));
        if previous != state {
            trace!(token = ?self.token, from = ?previous, to = ?state, "connection state");
        }
    }

    /// Moves `from` to `to`, leaving any other state alone.
    pub(crate) fn transition(&self, from: ConnectionState, to: ConnectionState) -> bool {
        self.state.compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire).is_ok()
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    #[inline]
    pub fn input(&self) -> &Buffer {
        &self.input
    }

    #[inline]
    pub fn output(&self) -> &Buffer {
        &self.output
    }

    /// Bytes read for the current request.
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read.load(Ordering::Acquire)
    }

    /// Bytes written for the current response.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Acquire)
    }

    /// Requests served on this connection so far.
    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::Acquire)
    }

    pub(crate) fn record_read(&self, n: usize) {
        self.bytes_read.fetch_add(n as u64, Ordering::AcqRel);
    }

    pub(crate) fn record_write(&self, n: usize) {
        self.bytes_written.fetch_add(n as u64, Ordering::AcqRel);
    }

    pub(crate) fn record_request(&self) {
        self.requests.fetch_add(1, Ordering::AcqRel);
    }

    /// Asks the reactor to write pending output, without waiting.
    pub(crate) fn request_write(&self) {
        self.post(Pending { flush: true, ..self.pending() });
    }

    /// Reports the end of the exchange to the reactor.
    pub(crate) fn complete(&self, keep_alive: bool) {
        self.post(Pending { completed: Some(keep_alive), ..self.pending() });
    }

    /// Asks the reactor to close the connection, dropping unwritten output.
    pub(crate) fn abandon(&self) {
        self.post(Pending { close: true, ..self.pending() });
    }

    /// Blocks until everything in the output buffer reached the socket.
    pub fn flush_sync(&self) -> Result<(), SendError> {
        ensure!(!reactor::on_reactor_thread(), UsageError::ReactorThread.into());
        let mut handshake = self.handshake.lock();
        if handshake.callback.is_some() {
            return Err(UsageError::WriteInFlight.into());
        }

        handshake.requested += 1;
        let ticket = handshake.requested;
        self.request_write();

        while handshake.drained < ticket {
            if self.is_closed() {
                return Err(SendError::Closed);
            }
            self.drained.wait(&mut handshake);
        }
        Ok(())
    }

    /// Registers `callback` to run on the reactor thread once the output buffer drained.
    pub fn write_async(&self, callback: WriteCallback) -> Result<(), UsageError> {
        let mut handshake = self.handshake.lock();
        if handshake.callback.is_some() {
            return Err(UsageError::WriteInFlight);
        }
        if self.is_closed() {
            drop(handshake);
            callback(Err(SendError::Closed));
            return Ok(());
        }

        handshake.requested += 1;
        let ticket = handshake.requested;
        handshake.callback = Some((ticket, callback));
        drop(handshake);

        self.request_write();
        Ok(())
    }

    pub fn write_in_flight(&self) -> bool {
        self.handshake.lock().callback.is_some()
    }

    /// The newest write ticket. Snapshot it before writing, see [`notify_drained`](Self::notify_drained).
    pub(crate) fn write_ticket(&self) -> u64 {
        self.handshake.lock().requested
    }

    /// Marks `ticket` drained, waking blocked writers and running a due callback.
    pub(crate) fn notify_drained(&self, ticket: u64) {
        let callback = {
            let mut handshake = self.handshake.lock();
            handshake.drained = handshake.drained.max(ticket);
            match handshake.callback.take() {
                Some((due, callback)) if due <= handshake.drained => Some(callback),
                pending => {
                    handshake.callback = pending;
                    None
                }
            }
        };
        self.drained.notify_all();
        if let Some(callback) = callback {
            callback(Ok(()));
        }
    }

    /// Marks the connection closed and fails every waiting writer.
    pub(crate) fn mark_closed(&self) {
        self.set_state(ConnectionState::Closed);
        self.closed.store(true, Ordering::Release);
        let callback = self.handshake.lock().callback.take();
        self.drained.notify_all();
        if let Some((_, callback)) = callback {
            callback(Err(SendError::Closed));
        }
    }

    /// Prepares the connection for its next request. Buffered input is kept.
    pub(crate) fn reset_for_reuse(&self) {
        self.output.clear();
        self.bytes_read.store(0, Ordering::Release);
        self.bytes_written.store(0, Ordering::Release);
        self.set_state(ConnectionState::Reading);
    }

    fn pending(&self) -> Pending {
        Pending { generation: self.generation, ..Default::default() }
    }

    fn post(&self, pending: Pending) {
        if !self.is_closed() {
            self.reactor.post(self.token, pending);
        }
    }
}

/// [`BodySink`] writing into the output buffer of a connection.
///
/// A blocking sink waits for the reactor whenever the output buffer reaches its size
/// limit. The reactor's own sink never blocks.
pub(crate) struct ConnectionSink {
    io: Arc<ConnectionIo>,
    blocking: bool,
}

impl ConnectionSink {
    pub(crate) fn blocking(io: Arc<ConnectionIo>) -> Self {
        Self { io, blocking: true }
    }

    pub(crate) fn non_blocking(io: Arc<ConnectionIo>) -> Self {
        Self { io, blocking: false }
    }
}

impl BodySink for ConnectionSink {
    fn send(&mut self, bytes: Bytes) -> Result<(), SendError> {
        if self.io.is_closed() {
            return Err(SendError::Closed);
        }
        self.io.transition(ConnectionState::Processing, ConnectionState::Writing);

        let output = self.io.output();
        // past the limit a blocking sink must wait for the reactor, which the pending callback forbids
        ensure!(
            !(self.blocking
                && self.io.write_in_flight()
                && output.available_bytes() + bytes.len() >= output.size_limit()),
            UsageError::WriteInFlight.into()
        );
        output.write(&bytes)?;
        output.flush()?;

        if self.blocking && output.available_bytes() >= output.size_limit() {
            self.io.flush_sync()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), SendError> {
        if self.blocking {
            return self.io.flush_sync();
        }
        self.io.request_write();
        Ok(())
    }
}
