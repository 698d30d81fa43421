//! `driver` crate: the backend capability the pool and executor talk to.
//!
//! A [`Backend`] opens [`Session`]s; a session runs parameterized statements
//! and reports results as field-name keyed JSON rows.  The PostgreSQL
//! implementation lives in [`postgres`], the in-memory test double in [`mock`].

pub mod error;
pub mod traits;
pub mod result;
pub mod mock;
pub mod postgres;

pub use error::BackendError;
pub use traits::{Backend, Session};
pub use result::{QueryResult, Row};
pub use postgres::PgBackend;

/// Bound parameter and column value type.
pub use serde_json::Value;
