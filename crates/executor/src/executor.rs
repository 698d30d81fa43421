//! Pooled query execution.
//!
//! `QueryExecutor` is the single entry point callers use:
//! 1. `execute` checks a connection out, runs one statement, and returns the
//!    connection whatever the outcome.
//! 2. `with_transaction` wraps a body in `BEGIN` / `COMMIT` / `ROLLBACK`,
//!    joining an already open transaction through a savepoint.
//! 3. `bootstrap_schema` creates the given tables in reference order.

use std::future::Future;

use driver::{QueryResult, Value};
use pool::{Pool, PooledConnection};
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use crate::schema::{bootstrap_order, TableDefinition};
use crate::transaction::Transaction;
use crate::{BootstrapReport, ExecutorError, QueryRequest};

// ---------------------------------------------------------------------------
// Statement helpers shared with transactions
// ---------------------------------------------------------------------------

/// Run one statement on `conn`, logging text, parameter count, row count and
/// elapsed time.  Parameter values are never logged.
pub(crate) async fn run_statement(
    conn: &mut PooledConnection,
    statement: &str,
    params: &[Value],
) -> Result<QueryResult, ExecutorError> {
    let started = Instant::now();
    match conn.query(statement, params).await {
        Ok(result) => {
            info!(
                "Executed query: {} - params: {}, rows: {}, duration: {}ms",
                compact(statement),
                params.len(),
                result.row_count,
                started.elapsed().as_millis()
            );
            Ok(result)
        }
        Err(source) => {
            error!(
                "Database query error on connection {} after {}ms: {source} (statement: {})",
                conn.id(),
                started.elapsed().as_millis(),
                compact(statement)
            );
            Err(ExecutorError::Query { statement: statement.to_owned(), source })
        }
    }
}

/// Hand `conn` back to its pool.
pub(crate) fn release(conn: PooledConnection) {
    let id = conn.id();
    if let Err(e) = conn.release() {
        warn!("failed to release connection {id}: {e}");
    }
}

/// Statement text on one line, for logs.
fn compact(statement: &str) -> String {
    statement.split_whitespace().collect::<Vec<_>>().join(" ")
}

// ---------------------------------------------------------------------------
// QueryExecutor
// ---------------------------------------------------------------------------

/// Runs statements against a shared [`Pool`].
///
/// Cheap to clone; clones share the pool.
#[derive(Debug, Clone)]
pub struct QueryExecutor {
    pool: Pool,
}

impl QueryExecutor {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Run one statement on a freshly checked-out connection.
    ///
    /// The connection is released before this returns, on success and on
    /// failure.  Inside a transaction body use the [`Transaction`] handle
    /// instead: this always checks out a separate connection.
    ///
    /// # Errors
    /// - [`ExecutorError::Pool`] if no connection could be checked out.
    /// - [`ExecutorError::Query`] if the backend rejected the statement.
    #[instrument(level = "debug", skip(self, params), fields(pool = self.pool.id()))]
    pub async fn execute(
        &self,
        statement: &str,
        params: &[Value],
    ) -> Result<QueryResult, ExecutorError> {
        let mut conn = self.pool.acquire().await?;
        let result = run_statement(&mut conn, statement, params).await;
        release(conn);
        result
    }

    pub async fn execute_request(&self, request: &QueryRequest) -> Result<QueryResult, ExecutorError> {
        self.execute(&request.statement, &request.params).await
    }

    /// Run `body` inside a transaction.
    ///
    /// `Ok` commits and returns the body's value.  `Err` rolls back and
    /// returns the body's error unchanged; a failing `ROLLBACK` is logged,
    /// never substituted for it.  If this task is already inside a
    /// transaction on the same pool, `body` runs in a savepoint of that
    /// transaction on the same connection.
    ///
    /// Dropping the returned future mid-body discards the connection rather
    /// than returning it with the transaction open.
    #[instrument(level = "debug", skip_all, fields(pool = self.pool.id()))]
    pub async fn with_transaction<F, Fut, T, E>(&self, body: F) -> Result<T, E>
    where
        F: FnOnce(Transaction) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<ExecutorError>,
    {
        if let Some(active) = Transaction::current(self.pool.id()) {
            debug!(
                "joining open transaction on connection {} through a savepoint",
                active.connection_id()
            );
            return active.with_transaction(body).await;
        }

        let tx = Transaction::begin(&self.pool).await?;
        match tx.scoped(body(tx.clone())).await {
            Ok(value) => {
                tx.commit().await?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = tx.rollback().await {
                    error!(
                        "rollback failed on connection {}: {rollback_err}",
                        tx.connection_id()
                    );
                }
                Err(err)
            }
        }
    }

    /// Create every table in `tables` that does not exist yet.
    ///
    /// Tables are created so that referenced tables come first; running
    /// this again is a no-op on the backend.  Stops at the first failing
    /// table and returns its error as is.
    ///
    /// # Errors
    /// - [`ExecutorError::InvalidTableName`], [`ExecutorError::DuplicateTable`]
    ///   or [`ExecutorError::ReferenceCycle`] before anything is sent.
    /// - Any error from [`QueryExecutor::execute`] for the failing table.
    #[instrument(skip(self, tables), fields(tables = tables.len()))]
    pub async fn bootstrap_schema(
        &self,
        tables: &[TableDefinition],
    ) -> Result<BootstrapReport, ExecutorError> {
        let ordered = bootstrap_order(tables)?;
        info!(
            "Initializing database schema: {} tables in order {:?}",
            ordered.len(),
            ordered.iter().map(|t| t.name.as_str()).collect::<Vec<_>>()
        );

        let mut report = BootstrapReport::default();
        for table in ordered {
            if let Err(err) = self.execute(&table.create_statement(), &[]).await {
                error!(
                    "Error initializing database schema at table '{}' ({} of {} tables applied): {err}",
                    table.name,
                    report.len(),
                    tables.len()
                );
                return Err(err);
            }
            info!("{} table created or already exists", table.name);
            report.applied.push(table.name.clone());
        }

        info!("Database schema initialized successfully");
        Ok(report)
    }
}
