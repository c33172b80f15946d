//! Utility macros and functions for the engine.
//!
//! This module provides helper macros that are used internally across the
//! codec, protocol and connection layers.

/// A macro for early returns with an error if a condition is not met.
///
/// This is similar to the `assert!` macro, but returns an error instead of panicking.
/// It's used for request verification where a failed check must turn into a
/// wire-level error response rather than a crash.
///
/// # Example
///
/// ```ignore
/// ensure!(headers.len() < max_headers, ParseError::too_many_headers(max_headers));
/// ```
macro_rules! ensure {
    ($predicate:expr, $error:expr) => {
        if !$predicate {
            return Err($error);
        }
    };
}

pub(crate) use ensure;
