use std::net::SocketAddr;

use tracing::trace;

/// Observer of the raw bytes crossing a socket.
///
/// Called on the reactor thread for every successful read and write, so
/// implementations must be quick.
pub trait Intercept: Send + Sync {
    fn on_read(&self, _peer: SocketAddr, _data: &[u8]) {}

    fn on_write(&self, _peer: SocketAddr, _data: &[u8]) {}
}

/// Logs every transfer at `trace` level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TraceIntercept;

const PREVIEW: usize = 64;

impl Intercept for TraceIntercept {
    fn on_read(&self, peer: SocketAddr, data: &[u8]) {
        trace!(%peer, len = data.len(), preview = %preview(data), "read");
    }

    fn on_write(&self, peer: SocketAddr, data: &[u8]) {
        trace!(%peer, len = data.len(), preview = %preview(data), "write");
    }
}

fn preview(data: &[u8]) -> String {
    let end = data.len().min(PREVIEW);
    String::from_utf8_lossy(&data[..end]).escape_debug().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preview_is_bounded_and_escaped() {
        assert_eq!(preview(b"GET / HTTP/1.1\r\n"), "GET / HTTP/1.1\\r\\n");
        assert_eq!(preview(&[b'a'; 100]).len(), PREVIEW);
    }
}
