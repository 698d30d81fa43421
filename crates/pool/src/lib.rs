//! `pool` crate: bounded connection pool over a [`driver::Backend`].
//!
//! Hands out exclusive connections on demand, takes them back on release,
//! evicts idle sessions in the background and turns idle-connection failures
//! into a terminal pool state instead of exiting the process.

pub mod config;
pub mod error;
pub mod pool;

pub use config::{DatabaseConfig, PoolConfig, Settings};
pub use error::{ConfigError, PoolError};
pub use pool::{ConnectionId, Pool, PoolStatus, PooledConnection};
