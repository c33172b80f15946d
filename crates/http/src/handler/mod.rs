//! Request handler abstraction.
//!
//! A [`Handler`] runs on a worker thread, once per request. It reads the request and
//! writes the response through the [`Exchange`]. Returning an error (or panicking)
//! produces a `500` when the response is still uncommitted, and closes the connection
//! otherwise.
//!
//! Plain functions and closures become handlers with [`handler_fn`].

mod status;

pub use status::{EngineStatus, StatusHandler};

use std::fmt;
use std::sync::Arc;

use crate::connection::Exchange;
use crate::protocol::BoxError;

pub trait Handler: Send + Sync {
    fn handle(&self, exchange: &mut Exchange) -> Result<(), BoxError>;
}

/// A [`Handler`] backed by a function or closure.
pub struct FnHandler<F> {
    f: F,
}

impl<F> fmt::Debug for FnHandler<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnHandler").finish_non_exhaustive()
    }
}

impl<F> Handler for FnHandler<F>
where
    F: Fn(&mut Exchange) -> Result<(), BoxError> + Send + Sync,
{
    fn handle(&self, exchange: &mut Exchange) -> Result<(), BoxError> {
        (self.f)(exchange)
    }
}

pub fn handler_fn<F>(f: F) -> FnHandler<F>
where
    F: Fn(&mut Exchange) -> Result<(), BoxError> + Send + Sync,
{
    FnHandler { f }
}

impl<H: Handler + ?Sized> Handler for Arc<H> {
    fn handle(&self, exchange: &mut Exchange) -> Result<(), BoxError> {
        (**self).handle(exchange)
    }
}

impl<H: Handler + ?Sized> Handler for Box<H> {
    fn handle(&self, exchange: &mut Exchange) -> Result<(), BoxError> {
        (**self).handle(exchange)
    }
}
