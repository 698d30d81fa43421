//! The `Backend` and `Session` traits, the contract every driver must fulfil.

use async_trait::async_trait;
use serde_json::Value;

use crate::{BackendError, QueryResult};

/// Opens sessions against one relational backend.
///
/// Implementations are shared by every task using the pool, so they must be
/// cheap to call concurrently.
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    /// Establish a new session.
    async fn connect(&self) -> Result<Box<dyn Session>, BackendError>;
}

/// A single backend session, owned by at most one caller at a time.
#[async_trait]
pub trait Session: Send + 'static {
    /// Run `statement`, binding `params` to its positional placeholders
    /// (`$1`, `$2`, …) in order.
    async fn query(
        &mut self,
        statement: &str,
        params: &[Value],
    ) -> Result<QueryResult, BackendError>;

    /// Cheap liveness check used on idle sessions.
    async fn ping(&mut self) -> Result<(), BackendError>;

    /// Close the session gracefully.
    async fn close(self: Box<Self>) -> Result<(), BackendError>;
}
