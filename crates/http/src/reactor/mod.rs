//! The event loop.
//!
//! One reactor thread owns the poller, every listener and every connection socket. It
//! multiplexes readiness, timer expiry and work posted by other threads into a single
//! [`Event`] stream and feeds it to the per-connection state machines.
//!
//! Other threads never touch a registration. They merge a [`Pending`] entry into the
//! shared table and wake the poller; the loop applies the table at the top of the next
//! iteration.

mod admission;
mod idle_guard;
mod slab;
mod timer;

pub use timer::TimerKind;
pub(crate) use timer::{TimerKey, Timers};

use std::cell::Cell;
use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

use crate::config::EngineConfig;
use crate::connection::{Connection, ConnectionIo, Endpoint, StateMachine, Step};
use crate::metrics::Metrics;
use admission::Admission;
use idle_guard::IdleGuard;
use slab::Slab;

thread_local! {
    static ON_REACTOR: Cell<bool> = const { Cell::new(false) };
}

/// Whether the calling thread runs an event loop. Nothing may block there.
pub(crate) fn on_reactor_thread() -> bool {
    ON_REACTOR.with(Cell::get)
}

pub(crate) const WAKE: Token = Token(usize::MAX);

const EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Error)]
pub enum ReactorError {
    #[error("poll failed: {source}")]
    Poll {
        #[from]
        source: io::Error,
    },

    #[error("reactor spun {iterations} iterations without doing any work")]
    Livelock { iterations: u32 },
}

/// Work posted for a connection by a non-reactor thread.
///
/// Entries of the same connection merge; an entry of a newer connection generation
/// replaces an older one, and the reactor drops entries whose generation no longer
/// matches the connection behind the token.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Pending {
    pub(crate) generation: u64,
    pub(crate) flush: bool,
    pub(crate) completed: Option<bool>,
    pub(crate) close: bool,
}

impl Pending {
    fn merge(&mut self, other: Pending) {
        if other.generation != self.generation {
            if other.generation > self.generation {
                *self = other;
            }
            return;
        }
        self.flush |= other.flush;
        self.completed = other.completed.or(self.completed);
        self.close |= other.close;
    }
}

/// State shared between the reactor and every other thread.
pub(crate) struct Shared {
    waker: Waker,
    pending: Mutex<HashMap<Token, Pending>>,
    quit: Mutex<Option<bool>>,
    connections: AtomicUsize,
    next_generation: AtomicU64,
}

impl std::fmt::Debug for Shared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shared")
            .field("connections", &self.open_connections())
            .field("pending", &self.pending.lock().len())
            .finish_non_exhaustive()
    }
}

impl Shared {
    pub(crate) fn new(waker: Waker) -> Self {
        Self {
            waker,
            pending: Mutex::new(HashMap::new()),
            quit: Mutex::new(None),
            connections: AtomicUsize::new(0),
            next_generation: AtomicU64::new(1),
        }
    }

    pub(crate) fn post(&self, token: Token, pending: Pending) {
        self.pending.lock().entry(token).and_modify(|p| p.merge(pending)).or_insert(pending);
        self.wake();
    }

    /// Asks the loop to stop. A later request without `wait` escalates an earlier one.
    pub(crate) fn request_quit(&self, wait: bool) {
        {
            let mut quit = self.quit.lock();
            *quit = Some(quit.map_or(wait, |earlier| earlier && wait));
        }
        self.wake();
    }

    #[inline]
    pub(crate) fn open_connections(&self) -> usize {
        self.connections.load(Ordering::Acquire)
    }

    fn wake(&self) {
        if let Err(e) = self.waker.wake() {
            warn!(cause = %e, "failed to wake the reactor");
        }
    }
}

/// What a connection handler may touch while the reactor drives it.
pub(crate) struct Context<'a> {
    pub(crate) registry: &'a Registry,
    pub(crate) timers: &'a mut Timers,
    pub(crate) quitting: bool,
    pub(crate) open_connections: usize,
}

/// Everything one loop iteration reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Event {
    Accept(usize),
    Readable(Token),
    Writable(Token),
    Timer(Token, TimerKind),
    Wake,
}

pub(crate) struct Listener {
    socket: TcpListener,
    endpoint: Arc<Endpoint>,
    registered: bool,
}

impl Listener {
    pub(crate) fn new(socket: TcpListener, endpoint: Arc<Endpoint>) -> Self {
        Self { socket, endpoint, registered: false }
    }
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("local_addr", &self.socket.local_addr().ok())
            .field("registered", &self.registered)
            .finish()
    }
}

fn listener_token(index: usize) -> Token {
    Token(usize::MAX - 1 - index)
}

pub(crate) struct EventLoop {
    poll: Poll,
    events: Events,
    shared: Arc<Shared>,
    listeners: Vec<Listener>,
    connections: Slab<StateMachine>,
    timers: Timers,
    admission: Admission,
    idle_guard: IdleGuard,
    config: Arc<EngineConfig>,
    quit_deadline: Option<Instant>,
}

impl std::fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoop")
            .field("listeners", &self.listeners)
            .field("connections", &self.connections.len())
            .field("timers", &self.timers.len())
            .field("quitting", &self.quit_deadline.is_some())
            .finish_non_exhaustive()
    }
}

impl EventLoop {
    pub(crate) fn new(
        poll: Poll,
        shared: Arc<Shared>,
        listeners: Vec<Listener>,
        config: Arc<EngineConfig>,
    ) -> io::Result<Self> {
        let mut event_loop = Self {
            poll,
            events: Events::with_capacity(EVENT_CAPACITY),
            shared,
            listeners,
            connections: Slab::with_capacity(config.max_connections.min(4096)),
            timers: Timers::new(),
            admission: Admission::new(config.max_connections),
            idle_guard: IdleGuard::new(config.livelock_threshold),
            config,
            quit_deadline: None,
        };

        let registry = event_loop.poll.registry();
        for (index, listener) in event_loop.listeners.iter_mut().enumerate() {
            registry.register(&mut listener.socket, listener_token(index), Interest::READABLE)?;
            listener.registered = true;
        }
        Ok(event_loop)
    }

    /// Runs until a quit request completed.
    pub(crate) fn run(mut self) -> Result<(), ReactorError> {
        ON_REACTOR.with(|flag| flag.set(true));
        info!(listeners = self.listeners.len(), "reactor started");
        let mut batch = Vec::with_capacity(EVENT_CAPACITY);

        loop {
            let mut worked = self.apply_pending();
            if self.should_exit() {
                break;
            }

            let timeout = self.poll_timeout();
            let started = Instant::now();
            if let Err(e) = self.poll.poll(&mut self.events, Some(timeout)) {
                if e.kind() != io::ErrorKind::Interrupted {
                    error!(cause = %e, "poll failed");
                    self.shutdown();
                    return Err(e.into());
                }
            }
            let waited_out = started.elapsed() >= timeout;

            self.collect(&mut batch);
            worked |= !batch.is_empty();
            for event in batch.drain(..) {
                self.dispatch(event);
            }

            if let Err(e) = self.idle_guard.record(worked || waited_out) {
                error!(cause = %e, "reactor is spinning");
                if self.config.exit_on_fatal {
                    error!("exiting on fatal reactor failure");
                    std::process::exit(70);
                }
                self.shutdown();
                return Err(e);
            }
        }

        self.shutdown();
        info!("reactor stopped");
        Ok(())
    }

    fn collect(&mut self, batch: &mut Vec<Event>) {
        for event in self.events.iter() {
            let token = event.token();
            if token == WAKE {
                batch.push(Event::Wake);
                continue;
            }
            if let Some(index) = self.listener_index(token) {
                batch.push(Event::Accept(index));
                continue;
            }

            // errors and hang-ups surface through the next read or write
            if event.is_readable() || event.is_read_closed() || event.is_error() {
                batch.push(Event::Readable(token));
            }
            if event.is_writable() {
                batch.push(Event::Writable(token));
            }
        }

        for (token, kind) in self.timers.expire(Instant::now()) {
            batch.push(Event::Timer(token, kind));
        }
    }

    fn dispatch(&mut self, event: Event) {
        trace!(?event, "dispatch");
        match event {
            Event::Wake => {}
            Event::Accept(index) => self.accept(index),
            Event::Readable(token) => self.drive(token, |machine, cx| machine.on_readable(cx)),
            Event::Writable(token) => self.drive(token, |machine, cx| machine.on_writable(cx)),
            Event::Timer(token, kind) => self.drive(token, |machine, _| machine.on_timer(kind)),
        }
    }

    fn listener_index(&self, token: Token) -> Option<usize> {
        let index = usize::MAX.checked_sub(1)?.checked_sub(token.0)?;
        (index < self.listeners.len()).then_some(index)
    }

    /// Runs `f` on the connection behind `token` and drops the connection on [`Step::Close`].
    fn drive<F>(&mut self, token: Token, f: F)
    where
        F: FnOnce(&mut StateMachine, &mut Context<'_>) -> Step,
    {
        let open_connections = self.connections.len();
        let quitting = self.quit_deadline.is_some();
        let Some(machine) = self.connections.get_mut(token) else {
            return;
        };

        let mut cx = Context { registry: self.poll.registry(), timers: &mut self.timers, quitting, open_connections };
        if let Step::Close(cause) = f(machine, &mut cx) {
            machine.close(&mut cx, cause);
            self.remove(token);
        }
    }

    fn remove(&mut self, token: Token) {
        if self.connections.remove(token).is_some() {
            Metrics::global().connection_closed();
            self.shared.connections.store(self.connections.len(), Ordering::Release);
            self.update_admission();
        }
    }

    fn accept(&mut self, index: usize) {
        loop {
            let (stream, peer) = match self.listeners[index].socket.accept() {
                Ok(accepted) => accepted,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(cause = %e, "accept failed");
                    return;
                }
            };

            if self.quit_deadline.is_some() {
                Metrics::global().connection_rejected();
                debug!(%peer, "connection refused while quitting");
                continue;
            }
            if let Err(e) = stream.set_nodelay(true) {
                debug!(%peer, cause = %e, "set_nodelay failed");
            }

            let endpoint = Arc::clone(&self.listeners[index].endpoint);
            let generation = self.shared.next_generation.fetch_add(1, Ordering::AcqRel);
            let shared = Arc::clone(&self.shared);
            let config = &self.config;
            let registry = self.poll.registry();
            let timers = &mut self.timers;
            let open_connections = self.connections.len() + 1;

            let accepted = self.connections.insert_with(|token| {
                let io = ConnectionIo::new(token, generation, peer, shared, config);
                let intercept = endpoint.intercept.as_ref().map(Arc::clone);
                let conn = Connection::new(stream, Arc::clone(&io), intercept);
                let mut machine = StateMachine::new(conn, io, endpoint);
                let mut cx = Context { registry, timers, quitting: false, open_connections };
                machine.start(&mut cx).map(|()| machine)
            });

            match accepted {
                Ok(token) => {
                    Metrics::global().connection_accepted();
                    self.shared.connections.store(self.connections.len(), Ordering::Release);
                    debug!(%peer, ?token, connections = self.connections.len(), "connection accepted");
                    self.update_admission();
                    if !self.admission.is_accepting() {
                        return;
                    }
                }
                Err(e) => {
                    Metrics::global().connection_rejected();
                    warn!(%peer, cause = %e, "failed to register connection");
                }
            }
        }
    }

    fn update_admission(&mut self) {
        if self.quit_deadline.is_some() {
            return;
        }
        match self.admission.update(self.connections.len()) {
            Some(false) => {
                warn!(connections = self.connections.len(), "connection limit reached, pausing accept");
                self.set_listening(false);
            }
            Some(true) => {
                info!(connections = self.connections.len(), "resuming accept");
                self.set_listening(true);
            }
            None => {}
        }
    }

    fn set_listening(&mut self, listening: bool) {
        let registry = self.poll.registry();
        for (index, listener) in self.listeners.iter_mut().enumerate() {
            if listener.registered == listening {
                continue;
            }
            let result = if listening {
                registry.register(&mut listener.socket, listener_token(index), Interest::READABLE)
            } else {
                registry.deregister(&mut listener.socket)
            };
            match result {
                Ok(()) => listener.registered = listening,
                Err(e) => warn!(?listener, cause = %e, "failed to update listener registration"),
            }
        }
    }

    /// Applies posted work. Returns whether there was any.
    fn apply_pending(&mut self) -> bool {
        let pending = std::mem::take(&mut *self.shared.pending.lock());
        let quit = self.shared.quit.lock().take();
        let mut worked = !pending.is_empty();

        if let Some(wait) = quit {
            worked = true;
            self.begin_quit(wait);
        }

        for (token, posted) in pending {
            let current = self.connections.get_mut(token).map(|machine| machine.io().generation());
            if current != Some(posted.generation) {
                trace!(?token, "dropping stale pending entry");
                continue;
            }
            self.drive(token, |machine, cx| machine.on_pending(cx, posted.flush, posted.completed, posted.close));
        }
        worked
    }

    fn begin_quit(&mut self, wait: bool) {
        info!(wait, connections = self.connections.len(), "reactor quitting");
        if self.quit_deadline.is_none() {
            self.set_listening(false);
            self.quit_deadline = Some(Instant::now() + self.config.quit_timeout);
        }

        for token in self.connections.tokens() {
            let close = !wait || self.connections.get_mut(token).is_some_and(|machine| machine.is_idle());
            if close {
                self.drive(token, |_, _| Step::Close("quit"));
            }
        }
    }

    fn should_exit(&self) -> bool {
        match self.quit_deadline {
            None => false,
            Some(_) if self.connections.is_empty() => true,
            Some(deadline) if Instant::now() >= deadline => {
                warn!(remaining = self.connections.len(), "quit deadline passed, closing remaining connections");
                true
            }
            Some(_) => false,
        }
    }

    fn poll_timeout(&self) -> Duration {
        let now = Instant::now();
        let mut timeout = self.config.poll_interval;
        if let Some(next) = self.timers.next_deadline() {
            timeout = timeout.min(next.saturating_duration_since(now));
        }
        if let Some(deadline) = self.quit_deadline {
            timeout = timeout.min(deadline.saturating_duration_since(now));
        }
        timeout
    }

    fn shutdown(&mut self) {
        for token in self.connections.tokens() {
            self.drive(token, |_, _| Step::Close("reactor stopped"));
        }
        self.set_listening(false);
    }
}
