//! Process-wide engine counters.
//!
//! Counters are cumulative and never reset; they have no effect on request processing and
//! exist for external monitoring (see the status handler).

use std::sync::atomic::{AtomicU64, Ordering};

use once_cell::sync::Lazy;
use serde::Serialize;

static GLOBAL: Lazy<Metrics> = Lazy::new(Metrics::default);

#[derive(Debug, Default)]
pub struct Metrics {
    connections_accepted: AtomicU64,
    connections_closed: AtomicU64,
    connections_rejected: AtomicU64,
    timeouts: AtomicU64,
    requests_handled: AtomicU64,
    bad_requests: AtomicU64,
    chunked_requests_seen: AtomicU64,
    chunked_requests_completed: AtomicU64,
    gzipped_requests_seen: AtomicU64,
    gzipped_requests_completed: AtomicU64,
}

/// Plain copy of the counters at one point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub connections_accepted: u64,
    pub connections_closed: u64,
    pub connections_rejected: u64,
    pub timeouts: u64,
    pub requests_handled: u64,
    pub bad_requests: u64,
    pub chunked_requests_seen: u64,
    pub chunked_requests_completed: u64,
    pub gzipped_requests_seen: u64,
    pub gzipped_requests_completed: u64,
}

macro_rules! counter {
    ($incr:ident, $field:ident) => {
        #[inline]
        pub fn $incr(&self) {
            self.$field.fetch_add(1, Ordering::Relaxed);
        }
    };
}

impl Metrics {
    /// The instance shared by every server in this process.
    pub fn global() -> &'static Metrics {
        &GLOBAL
    }

    counter!(connection_accepted, connections_accepted);
    counter!(connection_closed, connections_closed);
    counter!(connection_rejected, connections_rejected);
    counter!(timeout, timeouts);
    counter!(request_handled, requests_handled);
    counter!(bad_request, bad_requests);
    counter!(chunked_request_seen, chunked_requests_seen);
    counter!(chunked_request_completed, chunked_requests_completed);
    counter!(gzipped_request_seen, gzipped_requests_seen);
    counter!(gzipped_request_completed, gzipped_requests_completed);

    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            connections_accepted: load(&self.connections_accepted),
            connections_closed: load(&self.connections_closed),
            connections_rejected: load(&self.connections_rejected),
            timeouts: load(&self.timeouts),
            requests_handled: load(&self.requests_handled),
            bad_requests: load(&self.bad_requests),
            chunked_requests_seen: load(&self.chunked_requests_seen),
            chunked_requests_completed: load(&self.chunked_requests_completed),
            gzipped_requests_seen: load(&self.gzipped_requests_seen),
            gzipped_requests_completed: load(&self.gzipped_requests_completed),
        }
    }
}
