//! Executor-level error types.

use driver::BackendError;
use pool::PoolError;
use thiserror::Error;

use crate::TransactionScope;

/// Errors produced by the query executor (pooling, statements, transactions
/// and schema bootstrap).
#[derive(Debug, Error)]
pub enum ExecutorError {
    // ------ Pool errors ------

    /// No connection could be checked out.
    #[error("connection pool error: {0}")]
    Pool(#[from] PoolError),

    // ------ Statement errors ------

    /// The backend rejected a statement or lost the connection while running it.
    #[error("query failed: {source}")]
    Query {
        statement: String,
        #[source]
        source: BackendError,
    },

    // ------ Transaction errors ------

    /// A transaction scope was driven through a transition its state does not allow.
    #[error("invalid transaction transition from {from} to {to}")]
    InvalidTransition {
        from: TransactionScope,
        to: TransactionScope,
    },

    /// The transaction handle was used after its scope committed or rolled back.
    #[error("transaction is no longer open")]
    TransactionClosed,

    // ------ Bootstrap errors ------

    /// Two table definitions share a name (compared case-insensitively).
    #[error("duplicate table definition: '{0}'")]
    DuplicateTable(String),

    /// A table or referenced identifier is not a plain SQL identifier.
    #[error("invalid table name: '{0}'")]
    InvalidTableName(String),

    /// The foreign-key references between tables form a cycle.
    #[error("table references form a cycle through: {}", .0.join(", "))]
    ReferenceCycle(Vec<String>),
}

impl ExecutorError {
    /// The backend error behind a failed statement, if that is what this is.
    pub fn backend_error(&self) -> Option<&BackendError> {
        match self {
            Self::Query { source, .. } => Some(source),
            _ => None,
        }
    }

    /// `true` when the pool itself can no longer serve requests.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Pool(e) if e.is_fatal())
    }
}
