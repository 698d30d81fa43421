//! Typed error types for the pool crate.

use std::time::Duration;

use driver::BackendError;
use thiserror::Error;

use crate::ConnectionId;

/// Errors produced while checking connections out of, or back into, a pool.
#[derive(Debug, Error, Clone)]
pub enum PoolError {
    /// No connection became available before the deadline.
    #[error("timed out after {0:?} waiting for a database connection")]
    Timeout(Duration),

    /// The backend refused to open a new session (auth, network).
    #[error("backend could not establish a session: {0}")]
    Exhausted(#[source] BackendError),

    /// An idle connection failed fatally; the pool accepts no more work.
    #[error("connection pool is unusable: {0}")]
    Unrecoverable(String),

    /// A connection was released into a pool that did not hand it out.
    #[error("connection {0} is not checked out of this pool")]
    DoubleRelease(ConnectionId),

    /// The pool was shut down.
    #[error("connection pool has been closed")]
    Closed,
}

impl PoolError {
    /// `true` for errors that should end the owning subsystem rather than be retried.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Exhausted(_) | Self::Unrecoverable(_))
    }

    /// `true` when a caller may retry after backing off.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

/// Errors produced while loading settings.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required environment variables: {}", .0.join(", "))]
    Missing(Vec<&'static str>),

    #[error("environment variable {name} has invalid value '{value}'")]
    Invalid { name: &'static str, value: String },

    #[error("pool max_size must be at least 1")]
    PoolSize,
}
