//! Process-wide configuration.
//!
//! The configuration is read-mostly: it is consulted when a request is
//! started, so changing it at runtime affects only subsequently-started
//! requests. Logging goes through the [`log`](https://docs.rs/log) crate
//! facade and is configured by the application's chosen logger backend.

use once_cell::sync::Lazy;
use std::sync::RwLock;
use std::time::Duration;

/// Default deadline applied to requests that do not override it.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

static REQUEST_TIMEOUT: Lazy<RwLock<Duration>> =
    Lazy::new(|| RwLock::new(DEFAULT_REQUEST_TIMEOUT));

/// Get the process-wide default request timeout.
pub fn request_timeout() -> Duration {
    *REQUEST_TIMEOUT.read().unwrap()
}

/// Set the process-wide default request timeout.
///
/// Takes effect for requests started after the call; requests already in
/// flight keep their deadline.
pub fn set_request_timeout(timeout: Duration) {
    *REQUEST_TIMEOUT.write().unwrap() = timeout;
}
