//! Backend-level error type.

use thiserror::Error;

/// Errors returned by a [`Backend`](crate::Backend) or [`Session`](crate::Session).
///
/// The pool uses the variant to decide what happens to the session:
/// - `Connect`       : no session was established; surfaced as pool exhaustion.
/// - `ConnectionLost`: the session is unusable and must not be reused.
/// - `Statement`     : the statement failed but the session is still healthy.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum BackendError {
    /// The backend refused or could not reach a new session (auth, network).
    #[error("could not establish session: {0}")]
    Connect(String),

    /// The transport under an established session failed.
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// The backend rejected the statement (syntax, constraint, type mismatch).
    #[error("{message}")]
    Statement {
        /// SQLSTATE code when the backend reports one.
        code: Option<String>,
        message: String,
    },

    /// A returned column has a type the driver cannot map to JSON.
    #[error("cannot decode column '{column}' of type {type_name}")]
    Decode {
        column: String,
        type_name: String,
    },
}

impl BackendError {
    /// Shorthand for a statement failure without a SQLSTATE code.
    pub fn statement(message: impl Into<String>) -> Self {
        Self::Statement { code: None, message: message.into() }
    }

    /// `true` when the session that produced this error must be discarded.
    pub fn is_connection_error(&self) -> bool {
        matches!(self, Self::Connect(_) | Self::ConnectionLost(_))
    }
}
