//! Transaction scopes.
//!
//! A [`Transaction`] owns one pooled connection from `BEGIN` until exactly
//! one of `COMMIT` / `ROLLBACK` has been sent.  While a body runs, the
//! transaction is registered for the current task, so a nested
//! `with_transaction` against the same pool joins it through a savepoint
//! instead of checking out a second connection.
//!
//! Registration is a tokio task-local: tasks spawned from inside a body do
//! not inherit it and start their own transactions.
//!
//! A nested body dropped before it finishes leaves its savepoint marked as
//! abandoned; the next statement on the transaction, or its `COMMIT`, first
//! rolls back to it.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use driver::{QueryResult, Value};
use pool::{ConnectionId, Pool, PooledConnection};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

use crate::executor::{release, run_statement};
use crate::{ExecutorError, QueryRequest};

tokio::task_local! {
    static ACTIVE_TRANSACTION: Transaction;
}

/// `Shared::abandoned` when no savepoint is waiting to be rolled back.
const NO_SAVEPOINT: u32 = u32::MAX;

// ---------------------------------------------------------------------------
// TransactionScope
// ---------------------------------------------------------------------------

/// Lifecycle of one transaction.
///
/// `Idle → Started → Committed | RolledBack`; every other transition is
/// rejected with [`ExecutorError::InvalidTransition`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionScope {
    #[default]
    Idle,
    Started,
    Committed,
    RolledBack,
}

impl TransactionScope {
    pub fn begin(&mut self) -> Result<(), ExecutorError> {
        self.advance(Self::Started)
    }

    pub fn commit(&mut self) -> Result<(), ExecutorError> {
        self.advance(Self::Committed)
    }

    pub fn roll_back(&mut self) -> Result<(), ExecutorError> {
        self.advance(Self::RolledBack)
    }

    /// Statements may run.
    pub fn is_active(self) -> bool {
        self == Self::Started
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Committed | Self::RolledBack)
    }

    fn advance(&mut self, to: Self) -> Result<(), ExecutorError> {
        let allowed = matches!(
            (*self, to),
            (Self::Idle, Self::Started)
                | (Self::Started, Self::Committed)
                | (Self::Started, Self::RolledBack)
        );
        if !allowed {
            return Err(ExecutorError::InvalidTransition { from: *self, to });
        }
        *self = to;
        Ok(())
    }
}

impl fmt::Display for TransactionScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Idle => "idle",
            Self::Started => "started",
            Self::Committed => "committed",
            Self::RolledBack => "rolled back",
        })
    }
}

// ---------------------------------------------------------------------------
// Transaction
// ---------------------------------------------------------------------------

/// Handle to an open transaction, passed to `with_transaction` bodies.
///
/// Clones share the same connection.  Once the scope has committed or rolled
/// back, every handle fails with [`ExecutorError::TransactionClosed`].
#[derive(Clone)]
pub struct Transaction {
    shared: Arc<Shared>,
}

struct Shared {
    pool_id: u64,
    connection_id: ConnectionId,
    open: AtomicBool,
    /// Lowest savepoint whose nested body was dropped mid-flight.
    abandoned: AtomicU32,
    inner: Mutex<Inner>,
}

struct Inner {
    conn: Option<PooledConnection>,
    scope: TransactionScope,
    savepoints: u32,
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("pool", &self.shared.pool_id)
            .field("connection", &self.shared.connection_id)
            .field("open", &self.is_open())
            .finish()
    }
}

impl Transaction {
    /// Check a connection out of `pool` and issue `BEGIN` on it.
    pub(crate) async fn begin(pool: &Pool) -> Result<Self, ExecutorError> {
        let mut conn = pool.acquire().await?;
        let mut scope = TransactionScope::Idle;
        scope.begin()?;

        if let Err(err) = run_statement(&mut conn, "BEGIN", &[]).await {
            release(conn);
            return Err(err);
        }
        conn.set_transaction_open(true);
        debug!("transaction started on connection {}", conn.id());

        Ok(Self {
            shared: Arc::new(Shared {
                pool_id: conn.pool_id(),
                connection_id: conn.id(),
                open: AtomicBool::new(true),
                abandoned: AtomicU32::new(NO_SAVEPOINT),
                inner: Mutex::new(Inner { conn: Some(conn), scope, savepoints: 0 }),
            }),
        })
    }

    /// The open transaction this task is running inside, if it belongs to
    /// the pool with `pool_id`.
    pub(crate) fn current(pool_id: u64) -> Option<Self> {
        ACTIVE_TRANSACTION
            .try_with(Transaction::clone)
            .ok()
            .filter(|tx| tx.shared.pool_id == pool_id && tx.is_open())
    }

    /// Poll `fut` with this transaction registered for the current task.
    pub(crate) async fn scoped<Fut: Future>(&self, fut: Fut) -> Fut::Output {
        ACTIVE_TRANSACTION.scope(self.clone(), fut).await
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.shared.connection_id
    }

    /// `false` once `COMMIT` or `ROLLBACK` has been issued.
    pub fn is_open(&self) -> bool {
        self.shared.open.load(Ordering::SeqCst)
    }

    pub async fn scope(&self) -> TransactionScope {
        self.shared.inner.lock().await.scope
    }

    /// Run one statement inside this transaction.
    pub async fn execute(
        &self,
        statement: &str,
        params: &[Value],
    ) -> Result<QueryResult, ExecutorError> {
        let mut inner = self.shared.inner.lock().await;
        if !inner.scope.is_active() {
            return Err(ExecutorError::TransactionClosed);
        }
        let conn = inner.conn.as_mut().ok_or(ExecutorError::TransactionClosed)?;
        self.roll_back_abandoned(conn).await?;
        run_statement(conn, statement, params).await
    }

    pub async fn execute_request(&self, request: &QueryRequest) -> Result<QueryResult, ExecutorError> {
        self.execute(&request.statement, &request.params).await
    }

    /// Run `body` inside a savepoint of this transaction.
    ///
    /// `Ok` releases the savepoint; `Err` rolls back to it and returns the
    /// body's error unchanged, leaving the enclosing transaction usable.  A
    /// failed `RELEASE` also rolls back to the savepoint and is returned as
    /// the error.
    pub async fn with_transaction<F, Fut, T, E>(&self, body: F) -> Result<T, E>
    where
        F: FnOnce(Transaction) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<ExecutorError>,
    {
        let number = self.savepoint().await?;
        let guard = AbandonGuard { shared: &*self.shared, number, armed: true };
        let outcome = self.scoped(body(self.clone())).await;
        guard.disarm();

        let name = savepoint_name(number);
        match outcome {
            Ok(value) => {
                if let Err(err) = self.execute(&format!("RELEASE SAVEPOINT {name}"), &[]).await {
                    self.roll_back_to(&name).await;
                    return Err(err.into());
                }
                Ok(value)
            }
            Err(err) => {
                self.roll_back_to(&name).await;
                Err(err)
            }
        }
    }

    async fn roll_back_to(&self, name: &str) {
        if let Err(err) = self.execute(&format!("ROLLBACK TO SAVEPOINT {name}"), &[]).await {
            error!("could not roll back to savepoint {name}: {err}");
        }
    }

    async fn savepoint(&self) -> Result<u32, ExecutorError> {
        let mut inner = self.shared.inner.lock().await;
        if !inner.scope.is_active() {
            return Err(ExecutorError::TransactionClosed);
        }
        inner.savepoints += 1;
        let number = inner.savepoints;
        let name = savepoint_name(number);
        let conn = inner.conn.as_mut().ok_or(ExecutorError::TransactionClosed)?;
        self.roll_back_abandoned(conn).await?;
        run_statement(conn, &format!("SAVEPOINT {name}"), &[]).await?;
        debug!("nested transaction on connection {} using savepoint {name}", self.shared.connection_id);
        Ok(number)
    }

    /// Undo the writes of a nested body that was dropped before finishing.
    async fn roll_back_abandoned(&self, conn: &mut PooledConnection) -> Result<(), ExecutorError> {
        let number = self.shared.abandoned.swap(NO_SAVEPOINT, Ordering::SeqCst);
        if number == NO_SAVEPOINT {
            return Ok(());
        }
        let name = savepoint_name(number);
        warn!("nested transaction using savepoint {name} was cancelled, rolling it back");
        if let Err(err) = run_statement(conn, &format!("ROLLBACK TO SAVEPOINT {name}"), &[]).await {
            self.shared.abandoned.fetch_min(number, Ordering::SeqCst);
            return Err(err);
        }
        Ok(())
    }

    pub(crate) async fn commit(&self) -> Result<(), ExecutorError> {
        self.finish(TransactionScope::Committed).await
    }

    pub(crate) async fn rollback(&self) -> Result<(), ExecutorError> {
        self.finish(TransactionScope::RolledBack).await
    }

    /// Send the terminal marker and hand the connection back to the pool.
    async fn finish(&self, to: TransactionScope) -> Result<(), ExecutorError> {
        let mut inner = self.shared.inner.lock().await;
        inner.scope.advance(to)?;
        self.shared.open.store(false, Ordering::SeqCst);
        let mut conn = inner.conn.take().ok_or(ExecutorError::TransactionClosed)?;

        let result = if to == TransactionScope::Committed {
            match self.roll_back_abandoned(&mut conn).await {
                Ok(()) => run_statement(&mut conn, "COMMIT", &[]).await,
                Err(err) => Err(err),
            }
        } else {
            self.shared.abandoned.store(NO_SAVEPOINT, Ordering::SeqCst);
            run_statement(&mut conn, "ROLLBACK", &[]).await
        };
        match &result {
            Ok(_) => conn.set_transaction_open(false),
            // The server ends a transaction whose COMMIT failed by rolling it
            // back; a session left mid-transaction is discarded on release.
            Err(_) if to == TransactionScope::Committed => inner.scope = TransactionScope::RolledBack,
            Err(_) => {}
        }
        release(conn);
        result.map(|_| ())
    }
}

fn savepoint_name(number: u32) -> String {
    format!("sp_{number}")
}

/// Marks a savepoint as abandoned if the nested body holding it is dropped.
struct AbandonGuard<'a> {
    shared: &'a Shared,
    number: u32,
    armed: bool,
}

impl AbandonGuard<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for AbandonGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.shared.abandoned.fetch_min(self.number, Ordering::SeqCst);
        }
    }
}
