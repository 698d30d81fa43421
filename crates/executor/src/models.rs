//! Request and report types passed across the executor's API.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use driver::{QueryResult, Row};

// ---------------------------------------------------------------------------
// QueryRequest
// ---------------------------------------------------------------------------

/// A statement and its positional parameters.
///
/// Parameters are bound to `$1..$n`; they are never spliced into the
/// statement text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryRequest {
    pub statement: String,
    #[serde(default)]
    pub params: Vec<Value>,
}

impl QueryRequest {
    pub fn new(statement: impl Into<String>) -> Self {
        Self { statement: statement.into(), params: Vec::new() }
    }

    /// Append the next positional parameter.
    pub fn bind(mut self, value: impl Into<Value>) -> Self {
        self.params.push(value.into());
        self
    }
}

// ---------------------------------------------------------------------------
// BootstrapReport
// ---------------------------------------------------------------------------

/// Outcome of a successful [`bootstrap_schema`](crate::QueryExecutor::bootstrap_schema).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BootstrapReport {
    /// Table names in the order their `CREATE TABLE IF NOT EXISTS` ran.
    pub applied: Vec<String>,
}

impl BootstrapReport {
    pub fn len(&self) -> usize {
        self.applied.len()
    }

    pub fn is_empty(&self) -> bool {
        self.applied.is_empty()
    }
}
