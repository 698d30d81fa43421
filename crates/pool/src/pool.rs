//! Bounded connection pool.
//!
//! Capacity is a `tokio::sync::Semaphore` with `max_size` permits: holding a
//! permit is what "checked out" means, so `acquire` suspends on the semaphore
//! and `release` never blocks.  Pool membership (idle sessions, checked-out
//! ids, fatal state) sits behind one `std::sync::Mutex` that is never held
//! across an `.await`.
//!
//! A new session is only opened by a permit holder that found no idle
//! session, which keeps idle + checked-out sessions within `max_size`.

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use driver::{Backend, BackendError, QueryResult, Session, Value};
use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

use crate::{ConfigError, PoolConfig, PoolError, Settings};

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

/// Identifies one checkout of a session, unique within its pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Point-in-time view of pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    pub max_size: usize,
    /// Open sessions waiting to be handed out.
    pub idle: usize,
    /// Sessions currently owned by callers.
    pub checked_out: usize,
    /// Callers suspended in `acquire`.
    pub waiting: usize,
}

impl PoolStatus {
    /// Live sessions (idle + checked out).
    pub fn size(&self) -> usize {
        self.idle + self.checked_out
    }
}

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

struct IdleSession {
    id: ConnectionId,
    session: Box<dyn Session>,
    idle_since: Instant,
    /// Last time the session was returned or answered a ping.
    checked_at: Instant,
}

impl IdleSession {
    fn new(id: ConnectionId, session: Box<dyn Session>) -> Self {
        let now = Instant::now();
        Self { id, session, idle_since: now, checked_at: now }
    }
}

#[derive(Default)]
struct PoolState {
    idle: VecDeque<IdleSession>,
    checked_out: HashSet<ConnectionId>,
    next_id: u64,
    fatal: Option<String>,
    closed: bool,
}

impl PoolState {
    fn usable(&self) -> Result<(), PoolError> {
        if let Some(cause) = &self.fatal {
            return Err(PoolError::Unrecoverable(cause.clone()));
        }
        if self.closed {
            return Err(PoolError::Closed);
        }
        Ok(())
    }

    fn next_id(&mut self) -> ConnectionId {
        self.next_id += 1;
        ConnectionId(self.next_id)
    }
}

struct PoolInner {
    id: u64,
    backend: Arc<dyn Backend>,
    config: PoolConfig,
    semaphore: Arc<Semaphore>,
    state: Mutex<PoolState>,
    waiting: AtomicUsize,
}

impl PoolInner {
    fn state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take the most recently returned idle session, marking it checked out.
    fn checkout_idle(&self) -> Result<Option<(ConnectionId, Box<dyn Session>)>, PoolError> {
        let mut state = self.state();
        state.usable()?;
        let Some(entry) = state.idle.pop_back() else {
            return Ok(None);
        };
        state.checked_out.insert(entry.id);
        Ok(Some((entry.id, entry.session)))
    }

    /// Record a freshly opened session as checked out.
    fn register(&self) -> Result<ConnectionId, PoolError> {
        let mut state = self.state();
        state.usable()?;
        let id = state.next_id();
        state.checked_out.insert(id);
        Ok(id)
    }

    /// Take a session back.  Unusable sessions are dropped, not pooled.
    fn checkin(
        &self,
        id: ConnectionId,
        session: Option<Box<dyn Session>>,
        reusable: bool,
    ) -> Result<(), PoolError> {
        let discarded = {
            let mut state = self.state();
            if !state.checked_out.remove(&id) {
                return if cfg!(debug_assertions) {
                    Err(PoolError::DoubleRelease(id))
                } else {
                    Ok(())
                };
            }
            match session {
                Some(session) if reusable && state.usable().is_ok() => {
                    state.idle.push_back(IdleSession::new(id, session));
                    None
                }
                other => other,
            }
        };
        if discarded.is_some() {
            debug!("discarding connection {id} instead of returning it to the pool");
        }
        Ok(())
    }

    /// Enter the terminal fatal state and drop every idle session.
    fn poison(&self, cause: &BackendError) {
        let dropped: Vec<IdleSession> = {
            let mut state = self.state();
            if state.fatal.is_some() {
                return;
            }
            state.fatal = Some(cause.to_string());
            state.idle.drain(..).collect()
        };
        self.semaphore.close();
        error!(
            "unexpected error on idle connection, pool is no longer usable ({} idle sessions dropped): {cause}",
            dropped.len()
        );
    }

    fn unusable_error(&self) -> PoolError {
        self.state().usable().err().unwrap_or(PoolError::Closed)
    }

    /// One reaper pass: close expired idle sessions, then ping the ones
    /// that have gone a health-check interval without being checked.
    async fn reap(&self) {
        let expired: Vec<IdleSession> = {
            let mut state = self.state();
            if state.usable().is_err() {
                return;
            }
            let timeout = self.config.idle_timeout;
            let (expired, keep): (VecDeque<_>, VecDeque<_>) = state
                .idle
                .drain(..)
                .partition(|entry| entry.idle_since.elapsed() >= timeout);
            state.idle = keep;
            expired.into_iter().collect()
        };
        for entry in expired {
            debug!("closing connection {} after idle timeout", entry.id);
            if let Err(e) = entry.session.close().await {
                debug!("error while closing idle connection {}: {e}", entry.id);
            }
        }

        let interval = self.config.health_check_interval();
        let due = |entry: &IdleSession| entry.checked_at.elapsed() >= interval;
        let candidates = self.state().idle.iter().filter(|&entry| due(entry)).count();
        for _ in 0..candidates {
            // A ping holds a slot so live sessions stay within max_size.
            let Ok(permit) = Arc::clone(&self.semaphore).try_acquire_owned() else {
                break;
            };
            let next = {
                let mut state = self.state();
                let position = state.idle.iter().position(|entry| due(entry));
                match position {
                    Some(i) => state.idle.remove(i),
                    None => None,
                }
            };
            let Some(mut entry) = next else {
                break;
            };
            let deadline = self.config.connect_timeout;
            let outcome = match tokio::time::timeout(deadline, entry.session.ping()).await {
                Ok(outcome) => outcome,
                Err(_elapsed) => Err(BackendError::ConnectionLost(format!(
                    "health check timed out after {deadline:?}"
                ))),
            };
            match outcome {
                Ok(()) => {
                    entry.checked_at = Instant::now();
                    let mut state = self.state();
                    if state.usable().is_ok() {
                        state.idle.push_back(entry);
                    }
                }
                Err(err) if err.is_connection_error() => {
                    self.poison(&err);
                    return;
                }
                Err(err) => {
                    warn!("idle connection {} failed its health check: {err}", entry.id);
                }
            }
            drop(permit);
        }
    }
}

// ---------------------------------------------------------------------------
// Pool
// ---------------------------------------------------------------------------

/// Cheaply clonable handle to one connection pool.
///
/// Must be created inside a tokio runtime: construction spawns the
/// background reaper.  The reaper only holds a weak reference, so dropping
/// every handle tears the pool down.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

impl fmt::Debug for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("id", &self.inner.id)
            .field("config", &self.inner.config)
            .field("status", &self.status())
            .finish()
    }
}

impl Pool {
    /// Create a pool that opens sessions through `backend` lazily.
    pub fn new<B: Backend>(backend: B, config: PoolConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let inner = Arc::new(PoolInner {
            id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            backend: Arc::new(backend),
            semaphore: Arc::new(Semaphore::new(config.max_size)),
            config,
            state: Mutex::new(PoolState::default()),
            waiting: AtomicUsize::new(0),
        });
        spawn_reaper(&inner);
        info!(
            "Created connection pool (max_size={}, idle_timeout={:?}, connect_timeout={:?})",
            inner.config.max_size, inner.config.idle_timeout, inner.config.connect_timeout
        );
        Ok(Self { inner })
    }

    /// Create a PostgreSQL pool from loaded settings.
    pub fn from_settings(settings: &Settings) -> Result<Self, ConfigError> {
        Self::new(settings.database.backend(), settings.pool.clone())
    }

    /// Process-unique id of this pool.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    pub fn status(&self) -> PoolStatus {
        let state = self.inner.state();
        PoolStatus {
            max_size: self.inner.config.max_size,
            idle: state.idle.len(),
            checked_out: state.checked_out.len(),
            waiting: self.inner.waiting.load(Ordering::SeqCst),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state().closed
    }

    /// Check out a connection, waiting at most `connect_timeout`.
    pub async fn acquire(&self) -> Result<PooledConnection, PoolError> {
        self.acquire_timeout(self.inner.config.connect_timeout).await
    }

    /// Check out a connection, waiting at most `timeout`.
    ///
    /// # Errors
    /// - [`PoolError::Timeout`] if no slot frees up (or the backend does not
    ///   answer) before the deadline.
    /// - [`PoolError::Exhausted`] if the backend refuses a new session.
    /// - [`PoolError::Unrecoverable`] / [`PoolError::Closed`] once the pool
    ///   is no longer usable, including for callers already waiting.
    #[instrument(level = "debug", skip(self), fields(pool = self.inner.id))]
    pub async fn acquire_timeout(&self, timeout: Duration) -> Result<PooledConnection, PoolError> {
        self.inner.state().usable()?;
        let deadline = Instant::now() + timeout;

        let permit = {
            let _waiting = WaitingGuard::enter(&self.inner.waiting);
            tokio::time::timeout_at(deadline, Arc::clone(&self.inner.semaphore).acquire_owned())
                .await
        };

        let permit = match permit {
            Ok(Ok(permit)) => permit,
            Ok(Err(_closed)) => return Err(self.inner.unusable_error()),
            Err(_elapsed) => {
                warn!("timed out after {timeout:?} waiting for a database connection");
                return Err(PoolError::Timeout(timeout));
            }
        };

        if let Some((id, session)) = self.inner.checkout_idle()? {
            debug!("reusing idle connection {id}");
            return Ok(PooledConnection::new(Arc::clone(&self.inner), id, session, permit));
        }

        let session = match tokio::time::timeout_at(deadline, self.inner.backend.connect()).await {
            Ok(Ok(session)) => session,
            Ok(Err(err)) => {
                error!("could not connect to database: {err}");
                return Err(PoolError::Exhausted(err));
            }
            Err(_elapsed) => {
                warn!("timed out after {timeout:?} opening a database session");
                return Err(PoolError::Timeout(timeout));
            }
        };
        let id = self.inner.register()?;
        info!("Connected to database (connection {id})");
        Ok(PooledConnection::new(Arc::clone(&self.inner), id, session, permit))
    }

    /// Return `conn` to this pool.
    ///
    /// Equivalent to [`PooledConnection::release`] when `conn` came from this
    /// pool.  A connection from another pool is still returned to its own
    /// pool, and in debug builds the misuse is reported as
    /// [`PoolError::DoubleRelease`].
    pub fn release(&self, conn: PooledConnection) -> Result<(), PoolError> {
        if conn.pool.id != self.inner.id && cfg!(debug_assertions) {
            let id = conn.id;
            drop(conn);
            return Err(PoolError::DoubleRelease(id));
        }
        conn.release()
    }

    /// Shut the pool down.
    ///
    /// Waiting and future `acquire` calls fail with [`PoolError::Closed`];
    /// idle sessions are closed now, checked-out ones when released.
    pub async fn close(&self) {
        let idle: Vec<IdleSession> = {
            let mut state = self.inner.state();
            state.closed = true;
            state.idle.drain(..).collect()
        };
        self.inner.semaphore.close();
        for entry in idle {
            if let Err(e) = entry.session.close().await {
                debug!("error while closing connection {}: {e}", entry.id);
            }
        }
        info!("connection pool {} closed", self.inner.id);
    }
}

/// Counts a caller as waiting for as long as it is suspended in `acquire`,
/// including when the acquire future is dropped.
struct WaitingGuard<'a>(&'a AtomicUsize);

impl<'a> WaitingGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for WaitingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

fn spawn_reaper(inner: &Arc<PoolInner>) {
    let pool: Weak<PoolInner> = Arc::downgrade(inner);
    let period = inner.config.reap_interval();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let Some(inner) = pool.upgrade() else { break };
            if inner.state().usable().is_err() {
                break;
            }
            inner.reap().await;
        }
        debug!("pool reaper stopped");
    });
}

// ---------------------------------------------------------------------------
// PooledConnection
// ---------------------------------------------------------------------------

/// A session checked out of a [`Pool`], owned exclusively by its holder.
///
/// Returned to the pool by [`PooledConnection::release`] or on drop, which
/// covers error and cancellation paths.  The session is closed instead of
/// reused when it saw a connection failure, when a statement was cut off
/// mid-flight, or when it is released with a transaction still open.
pub struct PooledConnection {
    pool: Arc<PoolInner>,
    id: ConnectionId,
    session: Option<Box<dyn Session>>,
    permit: Option<OwnedSemaphorePermit>,
    broken: bool,
    in_flight: bool,
    transaction_open: bool,
}

impl fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.id)
            .field("pool", &self.pool.id)
            .field("broken", &self.broken)
            .field("transaction_open", &self.transaction_open)
            .finish()
    }
}

impl PooledConnection {
    fn new(
        pool: Arc<PoolInner>,
        id: ConnectionId,
        session: Box<dyn Session>,
        permit: OwnedSemaphorePermit,
    ) -> Self {
        Self {
            pool,
            id,
            session: Some(session),
            permit: Some(permit),
            broken: false,
            in_flight: false,
            transaction_open: false,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Id of the pool this connection was checked out of.
    pub fn pool_id(&self) -> u64 {
        self.pool.id
    }

    /// Run one statement on this connection.
    pub async fn query(
        &mut self,
        statement: &str,
        params: &[Value],
    ) -> Result<QueryResult, BackendError> {
        let session = self
            .session
            .as_mut()
            .ok_or_else(|| BackendError::ConnectionLost("connection already released".into()))?;

        self.in_flight = true;
        let result = session.query(statement, params).await;
        self.in_flight = false;

        if let Err(err) = &result {
            if err.is_connection_error() {
                self.broken = true;
            }
        }
        result
    }

    /// Record whether a transaction is open on this session.  A session
    /// released with an open transaction is discarded.
    pub fn set_transaction_open(&mut self, open: bool) {
        self.transaction_open = open;
    }

    pub fn is_transaction_open(&self) -> bool {
        self.transaction_open
    }

    /// `true` once a connection-level failure was observed.
    pub fn is_broken(&self) -> bool {
        self.broken
    }

    /// Return the connection to its pool.
    pub fn release(mut self) -> Result<(), PoolError> {
        self.return_to_pool()
    }

    fn return_to_pool(&mut self) -> Result<(), PoolError> {
        let Some(permit) = self.permit.take() else {
            return Ok(());
        };
        let reusable = !self.broken && !self.in_flight && !self.transaction_open;
        let result = self.pool.checkin(self.id, self.session.take(), reusable);
        // The slot is freed only after the session is back in the idle set,
        // so the waiter woken by the permit finds it.
        drop(permit);
        result
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Err(e) = self.return_to_pool() {
            warn!("failed to return connection {} to the pool: {e}", self.id);
        }
    }
}
