use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::sync::Arc;

use mio::net::TcpStream;
use mio::{Interest, Registry, Token};
use tracing::{debug, trace};

use crate::connection::{ConnectionIo, Intercept};

const READ_CHUNK: usize = 16 * 1024;

/// Outcome of draining the socket into the input buffer.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ReadStatus {
    pub(crate) read: usize,
    pub(crate) eof: bool,
}

/// The reactor side of a connection: the socket and its poll registration.
pub(crate) struct Connection {
    stream: TcpStream,
    io: Arc<ConnectionIo>,
    interest: Option<Interest>,
    intercept: Option<Arc<dyn Intercept>>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection").field("io", &self.io).field("interest", &self.interest).finish()
    }
}

impl Connection {
    pub(crate) fn new(stream: TcpStream, io: Arc<ConnectionIo>, intercept: Option<Arc<dyn Intercept>>) -> Self {
        Self { stream, io, interest: None, intercept }
    }

    #[inline]
    pub(crate) fn token(&self) -> Token {
        self.io.token()
    }

    #[inline]
    pub(crate) fn peer(&self) -> SocketAddr {
        self.io.peer_addr()
    }

    /// Reads until the socket would block, `budget` bytes were read or the peer closed.
    pub(crate) fn read_available(&mut self, budget: usize) -> io::Result<ReadStatus> {
        let mut status = ReadStatus::default();
        let mut chunk = [0u8; READ_CHUNK];

        while status.read < budget {
            let want = READ_CHUNK.min(budget - status.read);
            match self.stream.read(&mut chunk[..want]) {
                Ok(0) => {
                    status.eof = true;
                    break;
                }
                Ok(n) => {
                    let data = &chunk[..n];
                    if let Some(intercept) = &self.intercept {
                        intercept.on_read(self.peer(), data);
                    }
                    self.io.input().write(data).map_err(io::Error::other)?;
                    self.io.record_read(n);
                    status.read += n;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        self.io.input().flush().map_err(io::Error::other)?;
        trace!(token = ?self.token(), read = status.read, eof = status.eof, "socket read");
        Ok(status)
    }

    /// Writes buffered output until it is empty or the socket would block.
    ///
    /// Returns the number of bytes written.
    pub(crate) fn write_pending(&mut self) -> io::Result<usize> {
        let output = self.io.output();
        let mut written = 0;

        while let Some(chunk) = output.readable() {
            match self.stream.write(&chunk) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    if let Some(intercept) = &self.intercept {
                        intercept.on_write(self.peer(), &chunk[..n]);
                    }
                    output.release(n);
                    self.io.record_write(n);
                    written += n;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        trace!(token = ?self.token(), written, remaining = output.available_bytes(), "socket write");
        Ok(written)
    }

    pub(crate) fn register(&mut self, registry: &Registry) -> io::Result<()> {
        let token = self.token();
        registry.register(&mut self.stream, token, Interest::READABLE)?;
        self.interest = Some(Interest::READABLE);
        Ok(())
    }

    /// Adds write interest while output is pending, reregistering only on change.
    pub(crate) fn update_interest(&mut self, registry: &Registry) -> io::Result<()> {
        let wanted = if self.io.output().is_empty() {
            Interest::READABLE
        } else {
            Interest::READABLE | Interest::WRITABLE
        };
        if self.interest == Some(wanted) {
            return Ok(());
        }

        let token = self.token();
        match self.interest {
            Some(_) => registry.reregister(&mut self.stream, token, wanted)?,
            None => registry.register(&mut self.stream, token, wanted)?,
        }
        self.interest = Some(wanted);
        Ok(())
    }

    pub(crate) fn close(&mut self, registry: &Registry) {
        if self.interest.take().is_some() {
            if let Err(e) = registry.deregister(&mut self.stream) {
                debug!(token = ?self.token(), cause = %e, "deregister failed");
            }
        }
        if let Err(e) = self.stream.shutdown(Shutdown::Both) {
            debug!(token = ?self.token(), cause = %e, "shutdown failed");
        }
    }
}
