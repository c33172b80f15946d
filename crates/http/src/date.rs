//! Cached `Date` header values.
//!
//! Formatting an RFC 7231 date for every response is wasteful, so a background thread
//! refreshes one shared value a little more often than once per second and responses
//! just load it.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use arc_swap::ArcSwap;
use bytes::Bytes;
use http::HeaderValue;
use once_cell::sync::Lazy;
use tracing::error;

const UPDATE_INTERVAL: Duration = Duration::from_millis(800);

/// Maintains the current HTTP date string.
#[derive(Debug)]
pub struct DateService {
    current: Arc<ArcSwap<Bytes>>,
}

static DATE_SERVICE: Lazy<DateService> = Lazy::new(|| DateService::new_with_update_interval(UPDATE_INTERVAL));

impl DateService {
    /// Returns the process-wide instance, starting its refresh thread on first use.
    pub fn get_global_instance() -> &'static DateService {
        &DATE_SERVICE
    }

    fn new_with_update_interval(update_interval: Duration) -> Self {
        let current = Arc::new(ArcSwap::from_pointee(format_now()));
        let current_arc = Arc::clone(&current);

        let spawned = thread::Builder::new().name("nio-date".into()).spawn(move || {
            loop {
                thread::sleep(update_interval);
                current_arc.store(Arc::new(format_now()));
            }
        });
        if let Err(e) = spawned {
            error!(cause = %e, "failed to start date refresh thread, Date headers will be stale");
        }

        DateService { current }
    }

    /// The current value for the `Date` header.
    pub fn http_date(&self) -> HeaderValue {
        let date = self.current.load().as_ref().clone();
        // SAFETY: the bytes are produced by faf_http_date and are visible ASCII only.
        unsafe { HeaderValue::from_maybe_shared_unchecked(date) }
    }
}

fn format_now() -> Bytes {
    let mut buf = faf_http_date::get_date_buff_no_key();
    faf_http_date::get_date_no_key(&mut buf);
    Bytes::from_owner(buf)
}
