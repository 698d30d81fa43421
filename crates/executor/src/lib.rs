//! `executor` crate: pooled statement execution, transaction scopes and
//! schema bootstrap on top of the `pool` crate.

pub mod models;
pub mod error;
pub mod schema;
pub mod tables;
pub mod transaction;
pub mod executor;

pub use models::{BootstrapReport, QueryRequest, QueryResult, Row};
pub use error::ExecutorError;
pub use schema::{bootstrap_order, ForeignKey, TableDefinition};
pub use tables::{default_tables, ProductsVariant};
pub use transaction::{Transaction, TransactionScope};
pub use executor::QueryExecutor;

#[cfg(test)]
mod executor_tests;
