//! `MockBackend`: an in-memory test double for [`Backend`].
//!
//! Records every statement it receives, answers through a programmable
//! handler, and lets tests inject connect failures, statement failures,
//! latency and broken connections.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::{Backend, BackendError, QueryResult, Session};

/// Answers a statement on behalf of the mock.
pub type Handler =
    Arc<dyn Fn(&str, &[Value]) -> Result<QueryResult, BackendError> + Send + Sync>;

/// One statement as seen by a mock session.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutedStatement {
    /// 1-based id of the session that ran it, in connect order.
    pub session: usize,
    pub statement: String,
    pub params: Vec<Value>,
}

#[derive(Default)]
struct MockState {
    handler: Mutex<Option<Handler>>,
    failures: Mutex<Vec<(String, String)>>,
    connect_failure: Mutex<Option<String>>,
    latency: Mutex<Duration>,
    broken: AtomicBool,
    pings_hang: AtomicBool,
    connects: AtomicUsize,
    closes: AtomicUsize,
    pings: AtomicUsize,
    live: AtomicUsize,
    executed: Mutex<Vec<ExecutedStatement>>,
}

/// A backend that never leaves the process.
///
/// Clones share state, so a test can hand one clone to the pool and keep
/// another for assertions.
#[derive(Clone, Default)]
pub struct MockBackend {
    state: Arc<MockState>,
}

impl MockBackend {
    /// A backend that answers every statement with an empty result.
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer statements with `handler` instead of an empty result.
    pub fn with_handler<F>(self, handler: F) -> Self
    where
        F: Fn(&str, &[Value]) -> Result<QueryResult, BackendError> + Send + Sync + 'static,
    {
        *self.state.handler.lock().unwrap() = Some(Arc::new(handler));
        self
    }

    /// Delay every statement by `latency`.
    pub fn with_latency(self, latency: Duration) -> Self {
        *self.state.latency.lock().unwrap() = latency;
        self
    }

    /// Fail every statement containing `pattern` with a statement error.
    pub fn fail_on(&self, pattern: impl Into<String>, message: impl Into<String>) {
        self.state
            .failures
            .lock()
            .unwrap()
            .push((pattern.into(), message.into()));
    }

    /// Refuse new sessions with `message` until [`MockBackend::allow_connect`].
    pub fn fail_connect(&self, message: impl Into<String>) {
        *self.state.connect_failure.lock().unwrap() = Some(message.into());
    }

    pub fn allow_connect(&self) {
        *self.state.connect_failure.lock().unwrap() = None;
    }

    /// Make every existing and future session report a lost connection.
    pub fn break_connections(&self) {
        self.state.broken.store(true, Ordering::SeqCst);
    }

    /// Make pings never answer, like a session whose peer went silent.
    pub fn hang_pings(&self) {
        self.state.pings_hang.store(true, Ordering::SeqCst);
    }

    /// Number of sessions opened so far.
    pub fn connect_count(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    /// Number of sessions closed gracefully.
    pub fn close_count(&self) -> usize {
        self.state.closes.load(Ordering::SeqCst)
    }

    pub fn ping_count(&self) -> usize {
        self.state.pings.load(Ordering::SeqCst)
    }

    /// Sessions currently alive (opened and not yet closed or dropped).
    pub fn open_sessions(&self) -> usize {
        self.state.live.load(Ordering::SeqCst)
    }

    /// Every statement received so far, in arrival order.
    pub fn executed(&self) -> Vec<ExecutedStatement> {
        self.state.executed.lock().unwrap().clone()
    }

    /// Statement texts received so far, in arrival order.
    pub fn statements(&self) -> Vec<String> {
        self.executed().into_iter().map(|e| e.statement).collect()
    }

    /// How many times exactly `statement` was received.
    pub fn count(&self, statement: &str) -> usize {
        self.state
            .executed
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.statement == statement)
            .count()
    }
}

#[async_trait]
impl Backend for MockBackend {
    async fn connect(&self) -> Result<Box<dyn Session>, BackendError> {
        if let Some(message) = self.state.connect_failure.lock().unwrap().clone() {
            return Err(BackendError::Connect(message));
        }
        let id = self.state.connects.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.live.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockSession { id, state: Arc::clone(&self.state) }))
    }
}

struct MockSession {
    id: usize,
    state: Arc<MockState>,
}

#[async_trait]
impl Session for MockSession {
    async fn query(
        &mut self,
        statement: &str,
        params: &[Value],
    ) -> Result<QueryResult, BackendError> {
        self.state.executed.lock().unwrap().push(ExecutedStatement {
            session: self.id,
            statement: statement.to_owned(),
            params: params.to_vec(),
        });

        let latency = *self.state.latency.lock().unwrap();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        if self.state.broken.load(Ordering::SeqCst) {
            return Err(BackendError::ConnectionLost("connection reset by peer".into()));
        }

        let failure = self
            .state
            .failures
            .lock()
            .unwrap()
            .iter()
            .find(|(pattern, _)| statement.contains(pattern.as_str()))
            .map(|(_, message)| message.clone());
        if let Some(message) = failure {
            return Err(BackendError::statement(message));
        }

        let handler = self.state.handler.lock().unwrap().clone();
        match handler {
            Some(handler) => handler(statement, params),
            None => Ok(QueryResult::empty()),
        }
    }

    async fn ping(&mut self) -> Result<(), BackendError> {
        self.state.pings.fetch_add(1, Ordering::SeqCst);
        if self.state.pings_hang.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.state.broken.load(Ordering::SeqCst) {
            return Err(BackendError::ConnectionLost("connection reset by peer".into()));
        }
        Ok(())
    }

    async fn close(self: Box<Self>) -> Result<(), BackendError> {
        self.state.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl Drop for MockSession {
    fn drop(&mut self) {
        self.state.live.fetch_sub(1, Ordering::SeqCst);
    }
}
