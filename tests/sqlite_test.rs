//! End-to-end tests against a real SQLite database file.
//!
//! Tests verify that:
//! - The pool opens and creates the database file on demand
//! - Writes report affected rows and generated ids
//! - Reads come back as canonical records with bound parameters
//! - A failing transaction block leaves no partial writes

use db_bridge::db::{DriverRegistry, PoolManager, QueryExecutor, ReleaseOutcome};
use db_bridge::error::DbError;
use db_bridge::models::{
    CanonicalValue, ConnectionDescriptor, Operation, RawConfig, Statement,
};
use std::sync::Arc;
use tempfile::TempDir;

fn sqlite_descriptor(dir: &TempDir) -> ConnectionDescriptor {
    let path = dir.path().join("bridge.db");
    ConnectionDescriptor::normalize(
        RawConfig::new("sqlite")
            .with("path", path.to_string_lossy().into_owned())
            .with("create_if_missing", true),
    )
    .unwrap()
}

async fn setup() -> (TempDir, PoolManager, ConnectionDescriptor) {
    let dir = TempDir::new().unwrap();
    let descriptor = sqlite_descriptor(&dir);
    let manager = PoolManager::new(Arc::new(DriverRegistry::with_builtins()));

    let mut conn = manager.acquire(&descriptor, None).await.unwrap();
    QueryExecutor::new()
        .run(
            &mut conn,
            &Statement::write(
                "CREATE TABLE items (id INTEGER PRIMARY KEY, name TEXT NOT NULL, score REAL, payload BLOB)",
            )
            .into(),
        )
        .await
        .unwrap();
    conn.release(ReleaseOutcome::Reusable);
    (dir, manager, descriptor)
}

async fn count_items(manager: &PoolManager, descriptor: &ConnectionDescriptor) -> i64 {
    let mut conn = manager.acquire(descriptor, None).await.unwrap();
    let result = QueryExecutor::new()
        .run_normalized(
            &mut conn,
            &Statement::read("SELECT COUNT(*) AS total FROM items").into(),
        )
        .await
        .unwrap();
    conn.release(ReleaseOutcome::Reusable);
    match result.records[0].get("total") {
        Some(CanonicalValue::Integer(n)) => *n,
        other => panic!("unexpected count value: {other:?}"),
    }
}

#[tokio::test]
async fn test_insert_reports_generated_id() {
    let (_dir, manager, descriptor) = setup().await;
    let mut conn = manager.acquire(&descriptor, None).await.unwrap();

    let result = QueryExecutor::new()
        .run_normalized(
            &mut conn,
            &Statement::write("INSERT INTO items (name, score) VALUES (?, ?)")
                .with_param("alpha")
                .with_param(1.5)
                .into(),
        )
        .await
        .unwrap();
    conn.release(ReleaseOutcome::Reusable);

    assert_eq!(result.affected, 1);
    assert_eq!(result.generated_ids, vec![CanonicalValue::Integer(1)]);
    assert!(result.records.is_empty());
    manager.shutdown_all(None).await;
}

#[tokio::test]
async fn test_update_and_delete_report_no_generated_ids() {
    let (_dir, manager, descriptor) = setup().await;
    let executor = QueryExecutor::new();
    let mut conn = manager.acquire(&descriptor, None).await.unwrap();

    let inserted = executor
        .run_normalized(
            &mut conn,
            &Statement::write("INSERT INTO items (name) VALUES ('one'), ('two')").into(),
        )
        .await
        .unwrap();
    assert_eq!(inserted.generated_ids, vec![CanonicalValue::Integer(2)]);

    let updated = executor
        .run_normalized(
            &mut conn,
            &Statement::write("UPDATE items SET score = 1.0").into(),
        )
        .await
        .unwrap();
    assert_eq!(updated.affected, 2);
    assert!(updated.generated_ids.is_empty());

    let deleted = executor
        .run_normalized(
            &mut conn,
            &Statement::write("DELETE FROM items WHERE name = ?")
                .with_param("two")
                .into(),
        )
        .await
        .unwrap();
    assert_eq!(deleted.affected, 1);
    assert!(deleted.generated_ids.is_empty());
    conn.release(ReleaseOutcome::Broken);

    // Opened after the discard, so it has never inserted
    let mut conn = manager.acquire(&descriptor, None).await.unwrap();
    assert!(conn.generation() > 1);
    let updated = executor
        .run_normalized(
            &mut conn,
            &Statement::write("UPDATE items SET score = 2.0").into(),
        )
        .await
        .unwrap();
    conn.release(ReleaseOutcome::Reusable);
    assert_eq!(updated.affected, 1);
    assert!(updated.generated_ids.is_empty());

    manager.shutdown_all(None).await;
}

#[tokio::test]
async fn test_select_returns_canonical_records() {
    let (_dir, manager, descriptor) = setup().await;
    let executor = QueryExecutor::new();
    let mut conn = manager.acquire(&descriptor, None).await.unwrap();

    executor
        .run(
            &mut conn,
            &Statement::write("INSERT INTO items (name, score, payload) VALUES (?, ?, ?)")
                .with_param("beta")
                .with_param(2.25)
                .with_param(b"hi".to_vec())
                .into(),
        )
        .await
        .unwrap();
    executor
        .run(
            &mut conn,
            &Statement::write("INSERT INTO items (name) VALUES (?)")
                .with_param("gamma")
                .into(),
        )
        .await
        .unwrap();

    let result = executor
        .run_normalized(
            &mut conn,
            &Statement::read("SELECT id, name, score, payload FROM items WHERE id >= ? ORDER BY id")
                .with_param(1i64)
                .into(),
        )
        .await
        .unwrap();
    conn.release(ReleaseOutcome::Reusable);

    assert_eq!(result.records.len(), 2);
    let first = &result.records[0];
    let names: Vec<&str> = first.iter().map(|(name, _)| name).collect();
    assert_eq!(names, vec!["id", "name", "score", "payload"]);
    assert_eq!(first.get("id"), Some(&CanonicalValue::Integer(1)));
    assert_eq!(
        first.get("name"),
        Some(&CanonicalValue::Text("beta".to_string()))
    );
    assert_eq!(first.get("score"), Some(&CanonicalValue::Float(2.25)));
    assert_eq!(
        first.get("payload"),
        Some(&CanonicalValue::Binary(b"hi".to_vec()))
    );
    assert_eq!(result.records[1].get("score"), Some(&CanonicalValue::Null));
    assert_eq!(result.affected, 0);

    manager.shutdown_all(None).await;
}

#[tokio::test]
async fn test_repeated_column_names_are_rejected() {
    let (_dir, manager, descriptor) = setup().await;
    let mut conn = manager.acquire(&descriptor, None).await.unwrap();

    let err = QueryExecutor::new()
        .run_normalized(&mut conn, &Statement::read("SELECT 1 AS id, 2 AS id").into())
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::ResultShape { ref field, .. } if field == "id"));
    conn.release(ReleaseOutcome::Reusable);
    manager.shutdown_all(None).await;
}

#[tokio::test]
async fn test_failed_block_leaves_no_partial_writes() {
    let (_dir, manager, descriptor) = setup().await;
    let mut conn = manager.acquire(&descriptor, None).await.unwrap();

    let block = Operation::Transaction(vec![
        Statement::write("INSERT INTO items (name) VALUES ('kept?')").into(),
        Statement::write("INSERT INTO missing_table (name) VALUES ('boom')").into(),
    ]);
    let err = QueryExecutor::new()
        .run(&mut conn, &block)
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::Database { .. }));
    assert!(conn.is_healthy());
    assert!(!conn.in_transaction());
    conn.release(ReleaseOutcome::Reusable);

    assert_eq!(count_items(&manager, &descriptor).await, 0);
    manager.shutdown_all(None).await;
}

#[tokio::test]
async fn test_committed_block_is_visible() {
    let (_dir, manager, descriptor) = setup().await;
    let mut conn = manager.acquire(&descriptor, None).await.unwrap();

    let block = Operation::Transaction(vec![
        Statement::write("INSERT INTO items (name) VALUES ('one')").into(),
        Statement::write("INSERT INTO items (name) VALUES ('two')").into(),
    ]);
    let result = QueryExecutor::new()
        .run_normalized(&mut conn, &block)
        .await
        .unwrap();
    conn.release(ReleaseOutcome::Reusable);

    assert_eq!(result.affected, 2);
    assert_eq!(
        result.generated_ids,
        vec![CanonicalValue::Integer(1), CanonicalValue::Integer(2)]
    );
    assert_eq!(count_items(&manager, &descriptor).await, 2);
    manager.shutdown_all(None).await;
}

#[tokio::test]
async fn test_missing_file_without_create_fails() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("absent.db");
    let descriptor = ConnectionDescriptor::normalize(
        RawConfig::new("sqlite")
            .with("path", path.to_string_lossy().into_owned())
            .with("retry_attempts", 1),
    )
    .unwrap();
    let manager = PoolManager::new(Arc::new(DriverRegistry::with_builtins()));

    let err = manager.acquire(&descriptor, None).await.unwrap_err();
    assert!(matches!(err, DbError::Connection { .. }));
    assert!(err.suggestion().is_some());
    assert!(!path.exists());
}
