//! Behaviour tests for the query executor.
//!
//! These tests run against `MockBackend`, so no Postgres connection is
//! required.  Tests against a live database are in `tests/postgres.rs` and
//! are ignored by default.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use driver::mock::MockBackend;
use driver::{BackendError, QueryResult, Row};
use pool::{Pool, PoolConfig, PoolError};
use serde_json::{json, Value};
use tokio::time::Instant;

use crate::{
    default_tables, ExecutorError, ProductsVariant, QueryExecutor, QueryRequest, TableDefinition,
    Transaction, TransactionScope,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn executor_with(backend: &MockBackend, config: PoolConfig) -> QueryExecutor {
    QueryExecutor::new(Pool::new(backend.clone(), config).expect("valid pool config"))
}

fn executor(backend: &MockBackend) -> QueryExecutor {
    executor_with(backend, PoolConfig::new(1).with_connect_timeout(Duration::from_millis(100)))
}

fn row(value: Value) -> Row {
    value.as_object().cloned().expect("object literal")
}

// ============================================================
// execute
// ============================================================

#[tokio::test]
async fn execute_returns_rows_and_releases_the_connection() {
    init_tracing();
    let backend = MockBackend::new().with_handler(|_, _| {
        Ok(QueryResult::from_rows(vec![
            row(json!({ "id": 1, "fname": "Ada" })),
            row(json!({ "id": 2, "fname": "Grace" })),
        ]))
    });
    let executor = executor(&backend);

    // Warm the pool so the idle count is stable across calls.
    executor.execute("SELECT 1", &[]).await.unwrap();
    let before = executor.pool().status();

    let result = executor.execute("SELECT id, fname FROM users", &[]).await.unwrap();
    assert_eq!(result.row_count, 2);
    assert_eq!(result.rows[1]["fname"], "Grace");
    assert_eq!(executor.pool().status(), before);
    assert_eq!(backend.connect_count(), 1);
}

#[tokio::test]
async fn failed_execute_releases_the_connection_and_reports_the_statement() {
    let backend = MockBackend::new();
    backend.fail_on("missing_table", "relation \"missing_table\" does not exist");
    let executor = executor(&backend);

    executor.execute("SELECT 1", &[]).await.unwrap();
    let before = executor.pool().status();

    let err = executor
        .execute("SELECT * FROM missing_table", &[])
        .await
        .unwrap_err();
    match &err {
        ExecutorError::Query { statement, source } => {
            assert_eq!(statement, "SELECT * FROM missing_table");
            assert_eq!(
                source,
                &BackendError::statement("relation \"missing_table\" does not exist")
            );
        }
        other => panic!("expected a query error, got {other:?}"),
    }
    assert!(!err.is_fatal());
    assert_eq!(executor.pool().status(), before);

    // The session survived a statement error and is reused.
    executor.execute("SELECT 2", &[]).await.unwrap();
    assert_eq!(backend.connect_count(), 1);
}

#[tokio::test]
async fn request_parameters_are_bound_not_interpolated() {
    let backend = MockBackend::new();
    let executor = executor(&backend);

    let request = QueryRequest::new("SELECT * FROM users WHERE age > $1 AND lname = $2")
        .bind(30)
        .bind("O'Brien");
    executor.execute_request(&request).await.unwrap();

    let executed = backend.executed();
    assert_eq!(executed[0].statement, request.statement);
    assert_eq!(executed[0].params, vec![json!(30), json!("O'Brien")]);
}

#[tokio::test]
async fn refused_connection_surfaces_as_fatal_pool_error() {
    let backend = MockBackend::new();
    backend.fail_connect("password authentication failed for user \"app\"");
    let executor = executor(&backend);

    let err = executor.execute("SELECT 1", &[]).await.unwrap_err();
    assert!(matches!(err, ExecutorError::Pool(PoolError::Exhausted(_))));
    assert!(err.is_fatal());
    assert!(backend.statements().is_empty());
}

#[tokio::test(start_paused = true)]
async fn exhausted_pool_times_out() {
    let backend = MockBackend::new();
    let executor = executor(&backend);
    let _held = executor.pool().acquire().await.unwrap();

    let err = executor.execute("SELECT 1", &[]).await.unwrap_err();
    assert!(matches!(err, ExecutorError::Pool(PoolError::Timeout(_))));
    assert!(!err.is_fatal());
}

#[tokio::test(start_paused = true)]
async fn third_concurrent_execute_runs_after_a_release() {
    let backend = MockBackend::new().with_latency(Duration::from_millis(50));
    let executor = executor_with(
        &backend,
        PoolConfig::new(2).with_connect_timeout(Duration::from_millis(100)),
    );

    let started = Instant::now();
    let (a, b, c) = tokio::join!(
        executor.execute("SELECT 1", &[]),
        executor.execute("SELECT 2", &[]),
        executor.execute("SELECT 3", &[]),
    );
    let elapsed = started.elapsed();

    assert!(a.is_ok() && b.is_ok() && c.is_ok());
    // Two round trips back to back, not one and not three.
    assert!(elapsed >= Duration::from_millis(100), "{elapsed:?}");
    assert!(elapsed < Duration::from_millis(150), "{elapsed:?}");
    assert_eq!(backend.connect_count(), 2);
}

#[tokio::test]
async fn rows_above_the_average_salary() -> anyhow::Result<()> {
    let salaries = [4200.0, 5100.0, 6000.0, 6900.0, 7800.0];
    let backend = MockBackend::new().with_handler(move |statement, params| {
        let staff = salaries
            .iter()
            .enumerate()
            .map(|(i, salary)| row(json!({ "employee_id": i + 1, "salary": salary })));

        if statement.starts_with("SELECT AVG(salary)") {
            let avg = salaries.iter().sum::<f64>() / salaries.len() as f64;
            return Ok(QueryResult::from_rows(vec![row(json!({ "avg": avg }))]));
        }
        if statement == "SELECT * FROM employees WHERE salary > $1" {
            let threshold = params
                .first()
                .and_then(Value::as_f64)
                .ok_or_else(|| BackendError::statement("salary threshold must be numeric"))?;
            let above = staff
                .filter(|r| r["salary"].as_f64().is_some_and(|s| s > threshold))
                .collect();
            return Ok(QueryResult::from_rows(above));
        }
        Err(BackendError::statement(format!("unexpected statement: {statement}")))
    });
    let executor = executor(&backend);

    let average = executor
        .execute("SELECT AVG(salary) AS avg FROM employees", &[])
        .await?;
    let avg = average
        .first()
        .and_then(|r| r["avg"].as_f64())
        .ok_or_else(|| anyhow::anyhow!("no average returned"))?;

    let above = executor
        .execute("SELECT * FROM employees WHERE salary > $1", &[json!(avg)])
        .await?;

    let ids: Vec<&Value> = above.column("employee_id").collect();
    assert_eq!(above.row_count, 2);
    assert_eq!(ids, vec![&json!(4), &json!(5)]);
    Ok(())
}

// ============================================================
// with_transaction
// ============================================================

#[tokio::test]
async fn successful_body_commits_exactly_once() {
    init_tracing();
    let backend = MockBackend::new();
    let executor = executor(&backend);

    let value = executor
        .with_transaction(|tx| async move {
            tx.execute("INSERT INTO skills VALUES ($1, $2, $3)", &[json!(1), json!("Rust"), json!("IT")])
                .await?;
            assert_eq!(tx.scope().await, TransactionScope::Started);
            Ok::<_, ExecutorError>(42)
        })
        .await
        .unwrap();

    assert_eq!(value, 42);
    assert_eq!(
        backend.statements(),
        vec!["BEGIN", "INSERT INTO skills VALUES ($1, $2, $3)", "COMMIT"]
    );
    assert_eq!(backend.count("COMMIT"), 1);
    assert_eq!(backend.count("ROLLBACK"), 0);

    // Committed cleanly, so the session went back to the idle set.
    let status = executor.pool().status();
    assert_eq!(status.checked_out, 0);
    assert_eq!(status.idle, 1);
}

#[derive(Debug, PartialEq)]
enum CheckoutError {
    OutOfStock { product_id: i64 },
    Executor(String),
}

impl From<ExecutorError> for CheckoutError {
    fn from(err: ExecutorError) -> Self {
        Self::Executor(err.to_string())
    }
}

#[tokio::test]
async fn failing_body_rolls_back_and_returns_its_error_unchanged() {
    let backend = MockBackend::new();
    let executor = executor(&backend);

    let err = executor
        .with_transaction(|tx| async move {
            tx.execute("INSERT INTO orders VALUES ($1)", &[json!(7)]).await?;
            Err::<(), _>(CheckoutError::OutOfStock { product_id: 3 })
        })
        .await
        .unwrap_err();

    assert_eq!(err, CheckoutError::OutOfStock { product_id: 3 });
    assert_eq!(backend.statements().last().map(String::as_str), Some("ROLLBACK"));
    assert_eq!(backend.count("ROLLBACK"), 1);
    assert_eq!(backend.count("COMMIT"), 0);
    assert_eq!(executor.pool().status().idle, 1);
}

#[tokio::test]
async fn failing_statement_in_body_rolls_back() {
    let backend = MockBackend::new();
    backend.fail_on("employee_skills", "insert or update violates foreign key constraint");
    let executor = executor(&backend);

    let err = executor
        .with_transaction(|tx| async move {
            tx.execute("INSERT INTO employee_skills VALUES ($1, $2)", &[json!(9), json!(9)])
                .await?;
            Ok::<_, anyhow::Error>(())
        })
        .await
        .unwrap_err();

    let err = err.downcast::<ExecutorError>().expect("executor error");
    assert!(matches!(err, ExecutorError::Query { .. }));
    assert_eq!(backend.count("ROLLBACK"), 1);
    assert_eq!(backend.count("COMMIT"), 0);
}

#[tokio::test]
async fn handle_used_after_the_scope_is_closed() {
    let backend = MockBackend::new();
    let executor = executor(&backend);

    let leaked = executor
        .with_transaction(|tx| async move { Ok::<_, ExecutorError>(tx) })
        .await
        .unwrap();

    assert!(!leaked.is_open());
    assert_eq!(leaked.scope().await, TransactionScope::Committed);
    assert!(matches!(
        leaked.execute("SELECT 1", &[]).await,
        Err(ExecutorError::TransactionClosed)
    ));
    assert_eq!(executor.pool().status().checked_out, 0);
}

fn capture() -> (Arc<Mutex<Option<Transaction>>>, Arc<Mutex<Option<Transaction>>>) {
    let slot = Arc::new(Mutex::new(None));
    (Arc::clone(&slot), slot)
}

fn captured(slot: &Mutex<Option<Transaction>>) -> Transaction {
    slot.lock().unwrap().clone().expect("body ran")
}

#[tokio::test]
async fn failed_rollback_still_returns_the_body_error() {
    let backend = MockBackend::new();
    backend.fail_on("ROLLBACK", "terminating connection due to administrator command");
    let executor = executor(&backend);
    let before = executor.pool().status();
    let (slot, seen) = capture();

    let err = executor
        .with_transaction(move |tx| async move {
            *slot.lock().unwrap() = Some(tx.clone());
            tx.execute("INSERT INTO orders VALUES ($1)", &[json!(5)]).await?;
            Err::<(), _>(CheckoutError::OutOfStock { product_id: 5 })
        })
        .await
        .unwrap_err();

    assert_eq!(err, CheckoutError::OutOfStock { product_id: 5 });
    let tx = captured(&seen);
    assert_eq!(tx.scope().await, TransactionScope::RolledBack);
    assert!(!tx.is_open());

    let after = executor.pool().status();
    assert_eq!((after.idle, after.checked_out), (before.idle, before.checked_out));
    // The session may still hold the transaction, so it was closed.
    assert_eq!(backend.open_sessions(), 0);
    assert_eq!(backend.count("COMMIT"), 0);
}

#[tokio::test]
async fn failed_commit_is_recorded_as_rolled_back() {
    let backend = MockBackend::new();
    backend.fail_on("COMMIT", "could not serialize access due to concurrent update");
    let executor = executor(&backend);
    let before = executor.pool().status();
    let (slot, seen) = capture();

    let err = executor
        .with_transaction(move |tx| async move {
            *slot.lock().unwrap() = Some(tx.clone());
            tx.execute("UPDATE employees SET salary = $1", &[json!(5000)]).await?;
            Ok::<_, ExecutorError>(())
        })
        .await
        .unwrap_err();

    assert!(matches!(err, ExecutorError::Query { ref statement, .. } if statement == "COMMIT"));
    let tx = captured(&seen);
    assert_eq!(tx.scope().await, TransactionScope::RolledBack);
    assert!(matches!(
        tx.execute("SELECT 1", &[]).await,
        Err(ExecutorError::TransactionClosed)
    ));

    let after = executor.pool().status();
    assert_eq!((after.idle, after.checked_out), (before.idle, before.checked_out));
    assert_eq!(backend.open_sessions(), 0);
    assert_eq!(backend.count("COMMIT"), 1);
    assert_eq!(backend.count("ROLLBACK"), 0);
}

#[tokio::test]
async fn failed_begin_releases_the_connection() {
    let backend = MockBackend::new();
    let executor = executor(&backend);
    executor.execute("SELECT 1", &[]).await.unwrap();
    let before = executor.pool().status();
    backend.fail_on("BEGIN", "out of shared memory");

    let ran = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&ran);
    let err = executor
        .with_transaction(move |_| async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<_, ExecutorError>(())
        })
        .await
        .unwrap_err();

    assert!(matches!(err, ExecutorError::Query { ref statement, .. } if statement == "BEGIN"));
    assert_eq!(ran.load(Ordering::SeqCst), 0);
    assert_eq!(executor.pool().status(), before);

    // BEGIN never took effect, so the session is still reusable.
    executor.execute("SELECT 1", &[]).await.unwrap();
    assert_eq!(backend.connect_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn cancelled_transaction_discards_its_connection() {
    let backend = MockBackend::new();
    let executor = executor(&backend);

    let outcome = tokio::time::timeout(
        Duration::from_millis(100),
        executor.with_transaction(|tx| async move {
            tx.execute("INSERT INTO orders VALUES ($1)", &[json!(1)]).await?;
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok::<_, ExecutorError>(())
        }),
    )
    .await;
    assert!(outcome.is_err());

    let status = executor.pool().status();
    assert_eq!(status.checked_out, 0);
    assert_eq!(status.idle, 0, "a session with an open transaction must not be pooled");
    assert_eq!(backend.open_sessions(), 0);
    assert_eq!(backend.count("COMMIT"), 0);

    // The pool keeps working with a fresh session.
    executor.execute("SELECT 1", &[]).await.unwrap();
    assert_eq!(backend.connect_count(), 2);
}

#[tokio::test]
async fn concurrent_transactions_use_separate_connections() {
    let backend = MockBackend::new().with_latency(Duration::from_millis(5));
    let executor = executor_with(
        &backend,
        PoolConfig::new(2).with_connect_timeout(Duration::from_secs(1)),
    );

    let tasks: Vec<_> = (0..2)
        .map(|i| {
            let executor = executor.clone();
            tokio::spawn(async move {
                executor
                    .with_transaction(|tx| async move {
                        tx.execute("UPDATE employees SET salary = salary * 1.1 WHERE employee_id = $1", &[json!(i)])
                            .await
                    })
                    .await
            })
        })
        .collect();
    for task in tasks {
        task.await.expect("task panicked").expect("transaction committed");
    }

    assert_eq!(backend.connect_count(), 2);
    for session in 1..=2 {
        let statements: Vec<String> = backend
            .executed()
            .into_iter()
            .filter(|e| e.session == session)
            .map(|e| e.statement)
            .collect();
        assert_eq!(statements.first().map(String::as_str), Some("BEGIN"));
        assert_eq!(statements.last().map(String::as_str), Some("COMMIT"));
        assert_eq!(statements.len(), 3);
    }
}

// ============================================================
// Nested transactions
// ============================================================

#[tokio::test]
async fn nested_transaction_reuses_the_connection_through_a_savepoint() {
    let backend = MockBackend::new();
    // One connection: a second checkout would time out.
    let executor = executor(&backend);
    let nested = executor.clone();

    executor
        .with_transaction(|tx| async move {
            tx.execute("INSERT INTO customers VALUES ($1)", &[json!(1)]).await?;
            nested
                .with_transaction(|inner| async move {
                    inner
                        .execute("INSERT INTO orders VALUES ($1, $2)", &[json!(10), json!(1)])
                        .await?;
                    Ok::<_, ExecutorError>(())
                })
                .await?;
            Ok::<_, ExecutorError>(())
        })
        .await
        .unwrap();

    assert_eq!(
        backend.statements(),
        vec![
            "BEGIN",
            "INSERT INTO customers VALUES ($1)",
            "SAVEPOINT sp_1",
            "INSERT INTO orders VALUES ($1, $2)",
            "RELEASE SAVEPOINT sp_1",
            "COMMIT",
        ]
    );
    assert_eq!(backend.connect_count(), 1);
}

#[tokio::test]
async fn failed_nested_body_rolls_back_to_its_savepoint_only() {
    let backend = MockBackend::new();
    backend.fail_on("duplicate_skill", "duplicate key value violates unique constraint");
    let executor = executor(&backend);

    executor
        .with_transaction(|tx| async move {
            let nested = tx
                .with_transaction(|inner| async move {
                    inner.execute("INSERT INTO skills SELECT * FROM duplicate_skill", &[]).await
                })
                .await;
            assert!(matches!(nested, Err(ExecutorError::Query { .. })));

            // The outer transaction is still usable.
            tx.execute("INSERT INTO skills VALUES ($1)", &[json!(2)]).await?;
            Ok::<_, ExecutorError>(())
        })
        .await
        .unwrap();

    let statements = backend.statements();
    assert!(statements.contains(&"ROLLBACK TO SAVEPOINT sp_1".to_string()));
    assert!(!statements.contains(&"RELEASE SAVEPOINT sp_1".to_string()));
    assert_eq!(statements.last().map(String::as_str), Some("COMMIT"));
    assert_eq!(backend.count("ROLLBACK"), 0);
}

#[tokio::test]
async fn savepoints_are_numbered_per_transaction() {
    let backend = MockBackend::new();
    let executor = executor(&backend);

    executor
        .with_transaction(|tx| async move {
            for _ in 0..2 {
                tx.with_transaction(|inner| async move {
                    inner.with_transaction(|_| async { Ok::<_, ExecutorError>(()) }).await
                })
                .await?;
            }
            Ok::<_, ExecutorError>(())
        })
        .await
        .unwrap();

    let savepoints: Vec<String> = backend
        .statements()
        .into_iter()
        .filter(|s| s.starts_with("SAVEPOINT"))
        .collect();
    assert_eq!(
        savepoints,
        vec!["SAVEPOINT sp_1", "SAVEPOINT sp_2", "SAVEPOINT sp_3", "SAVEPOINT sp_4"]
    );
}

#[tokio::test]
async fn failed_savepoint_release_rolls_the_nested_body_back() {
    let backend = MockBackend::new();
    backend.fail_on("RELEASE SAVEPOINT", "out of shared memory");
    let executor = executor(&backend);
    executor.execute("SELECT 1", &[]).await.unwrap();
    let before = executor.pool().status();
    let (slot, seen) = capture();

    executor
        .with_transaction(move |tx| async move {
            *slot.lock().unwrap() = Some(tx.clone());
            let nested = tx
                .with_transaction(|inner| async move {
                    inner.execute("INSERT INTO orders VALUES ($1)", &[json!(1)]).await?;
                    Ok::<_, ExecutorError>(())
                })
                .await;
            assert!(matches!(
                nested,
                Err(ExecutorError::Query { ref statement, .. }) if statement == "RELEASE SAVEPOINT sp_1"
            ));

            tx.execute("INSERT INTO customers VALUES ($1)", &[json!(1)]).await?;
            Ok::<_, ExecutorError>(())
        })
        .await
        .unwrap();

    assert_eq!(
        backend.statements(),
        vec![
            "SELECT 1",
            "BEGIN",
            "SAVEPOINT sp_1",
            "INSERT INTO orders VALUES ($1)",
            "RELEASE SAVEPOINT sp_1",
            "ROLLBACK TO SAVEPOINT sp_1",
            "INSERT INTO customers VALUES ($1)",
            "COMMIT",
        ]
    );
    assert_eq!(captured(&seen).scope().await, TransactionScope::Committed);
    assert_eq!(executor.pool().status(), before);
}

#[tokio::test(start_paused = true)]
async fn cancelled_nested_body_is_rolled_back_before_later_statements() {
    let backend = MockBackend::new();
    let executor = executor(&backend);

    executor
        .with_transaction(|tx| async move {
            let cancelled = tokio::time::timeout(
                Duration::from_millis(10),
                tx.with_transaction(|inner| async move {
                    inner.execute("INSERT INTO orders VALUES ($1)", &[json!(1)]).await?;
                    tokio::time::sleep(Duration::from_secs(10)).await;
                    Ok::<_, ExecutorError>(())
                }),
            )
            .await;
            assert!(cancelled.is_err());

            tx.execute("INSERT INTO customers VALUES ($1)", &[json!(1)]).await?;
            Ok::<_, ExecutorError>(())
        })
        .await
        .unwrap();

    assert_eq!(
        backend.statements(),
        vec![
            "BEGIN",
            "SAVEPOINT sp_1",
            "INSERT INTO orders VALUES ($1)",
            "ROLLBACK TO SAVEPOINT sp_1",
            "INSERT INTO customers VALUES ($1)",
            "COMMIT",
        ]
    );
    assert_eq!(executor.pool().status().idle, 1);
}

#[tokio::test(start_paused = true)]
async fn cancelled_nested_transaction_is_rolled_back_before_commit() {
    let backend = MockBackend::new();
    let executor = executor(&backend);
    let nested = executor.clone();

    executor
        .with_transaction(|tx| async move {
            tx.execute("INSERT INTO customers VALUES ($1)", &[json!(1)]).await?;
            let cancelled = tokio::time::timeout(
                Duration::from_millis(10),
                nested.with_transaction(|inner| async move {
                    inner.execute("INSERT INTO orders VALUES ($1)", &[json!(1)]).await?;
                    tokio::time::sleep(Duration::from_secs(10)).await;
                    Ok::<_, ExecutorError>(())
                }),
            )
            .await;
            assert!(cancelled.is_err());
            Ok::<_, ExecutorError>(())
        })
        .await
        .unwrap();

    let statements = backend.statements();
    assert_eq!(
        &statements[statements.len() - 2..],
        ["ROLLBACK TO SAVEPOINT sp_1", "COMMIT"]
    );
}

#[tokio::test(start_paused = true)]
async fn commit_is_refused_when_a_cancelled_savepoint_cannot_be_undone() {
    let backend = MockBackend::new();
    backend.fail_on("ROLLBACK TO SAVEPOINT", "connection is in an unexpected state");
    let executor = executor(&backend);
    let before = executor.pool().status();
    let (slot, seen) = capture();

    let err = executor
        .with_transaction(move |tx| async move {
            *slot.lock().unwrap() = Some(tx.clone());
            let _ = tokio::time::timeout(
                Duration::from_millis(10),
                tx.with_transaction(|inner| async move {
                    inner.execute("INSERT INTO orders VALUES ($1)", &[json!(1)]).await?;
                    tokio::time::sleep(Duration::from_secs(10)).await;
                    Ok::<_, ExecutorError>(())
                }),
            )
            .await;
            Ok::<_, ExecutorError>(())
        })
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        ExecutorError::Query { ref statement, .. } if statement == "ROLLBACK TO SAVEPOINT sp_1"
    ));
    assert_eq!(backend.count("COMMIT"), 0);
    assert_eq!(captured(&seen).scope().await, TransactionScope::RolledBack);
    let after = executor.pool().status();
    assert_eq!((after.idle, after.checked_out), (before.idle, before.checked_out));
    assert_eq!(backend.open_sessions(), 0);
}

// ============================================================
// bootstrap_schema
// ============================================================

/// Backend that remembers which tables exist, like `IF NOT EXISTS` would.
fn schema_backend() -> (MockBackend, Arc<Mutex<BTreeSet<String>>>, Arc<AtomicUsize>) {
    let existing = Arc::new(Mutex::new(BTreeSet::new()));
    let creations = Arc::new(AtomicUsize::new(0));
    let backend = MockBackend::new().with_handler({
        let existing = Arc::clone(&existing);
        let creations = Arc::clone(&creations);
        move |statement, _| {
            if let Some(rest) = statement.strip_prefix("CREATE TABLE IF NOT EXISTS ") {
                let name = rest.split_whitespace().next().unwrap_or_default().to_owned();
                if existing.lock().unwrap().insert(name) {
                    creations.fetch_add(1, Ordering::SeqCst);
                }
            }
            Ok(QueryResult::empty())
        }
    });
    (backend, existing, creations)
}

#[tokio::test]
async fn bootstrap_twice_creates_each_table_once() {
    init_tracing();
    let (backend, existing, creations) = schema_backend();
    let executor = executor(&backend);
    let tables = default_tables(ProductsVariant::WithStock);

    let first = executor.bootstrap_schema(&tables).await.unwrap();
    let second = executor.bootstrap_schema(&tables).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(first.len(), 8);
    assert_eq!(creations.load(Ordering::SeqCst), 8);
    assert_eq!(existing.lock().unwrap().len(), 8);
    assert_eq!(executor.pool().status().checked_out, 0);
}

#[tokio::test]
async fn bootstrap_creates_referenced_tables_first() {
    let (backend, _, _) = schema_backend();
    let executor = executor(&backend);

    // Deliberately reversed.
    let mut tables = default_tables(ProductsVariant::WithoutStock);
    tables.reverse();
    let report = executor.bootstrap_schema(&tables).await.unwrap();

    let position = |name: &str| report.applied.iter().position(|t| t == name).unwrap();
    for table in &tables {
        for referenced in table.references() {
            assert!(
                position(referenced) < position(table.name.as_str()),
                "{referenced} must be created before {}",
                table.name
            );
        }
    }
}

#[tokio::test]
async fn bootstrap_stops_at_the_first_failure() {
    let (backend, _, _) = schema_backend();
    backend.fail_on(
        "CREATE TABLE IF NOT EXISTS sales",
        "permission denied for schema public",
    );
    let executor = executor(&backend);

    let err = executor
        .bootstrap_schema(&default_tables(ProductsVariant::WithStock))
        .await
        .unwrap_err();

    match err {
        ExecutorError::Query { statement, source } => {
            assert!(statement.starts_with("CREATE TABLE IF NOT EXISTS sales"));
            assert_eq!(source, BackendError::statement("permission denied for schema public"));
        }
        other => panic!("expected the failing statement's error, got {other:?}"),
    }
    // users, products, then the failing sales; nothing after it.
    assert_eq!(backend.statements().len(), 3);
    assert_eq!(executor.pool().status().checked_out, 0);
}

#[tokio::test]
async fn invalid_definitions_are_rejected_before_any_statement() {
    let backend = MockBackend::new();
    let executor = executor(&backend);

    let cyclic = vec![
        TableDefinition::new("a").column("b_id INT").foreign_key("b_id", "b", "id"),
        TableDefinition::new("b").column("a_id INT").foreign_key("a_id", "a", "id"),
    ];
    assert!(matches!(
        executor.bootstrap_schema(&cyclic).await,
        Err(ExecutorError::ReferenceCycle(_))
    ));

    let duplicated = vec![
        default_tables(ProductsVariant::WithStock).remove(1),
        default_tables(ProductsVariant::WithoutStock).remove(1),
    ];
    assert!(matches!(
        executor.bootstrap_schema(&duplicated).await,
        Err(ExecutorError::DuplicateTable(name)) if name == "products"
    ));

    assert!(backend.statements().is_empty());
    assert_eq!(backend.connect_count(), 0);
}
