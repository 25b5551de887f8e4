mod common;

use capture::CaptureConnection;
use checkpoint::CheckpointStore;
use common::{test_config, wait_for, MemoryWriter};
use engine::SyncEngine;
use rusqlite::types::Value as SqlParam;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use targets::TargetWriter;
use tempfile::TempDir;

fn paths(dir: &TempDir) -> (PathBuf, PathBuf) {
    (
        dir.path().join("source.db"),
        dir.path().join("checkpoints.db"),
    )
}

fn seed_users(path: &PathBuf) {
    let mut conn = CaptureConnection::open(path, &["users".to_string()]).unwrap();
    conn.execute("CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT)", &[])
        .unwrap();
    conn.execute("INSERT INTO users (name) VALUES (?)", &[SqlParam::Text("a".into())])
        .unwrap();
    conn.execute("INSERT INTO users (name) VALUES (?)", &[SqlParam::Text("b".into())])
        .unwrap();
    conn.execute("UPDATE users SET name = 'c' WHERE id = 1", &[])
        .unwrap();
    conn.execute("DELETE FROM users WHERE id = 2", &[]).unwrap();
    conn.commit().unwrap();
    conn.close().unwrap();
}

fn unconsumed_audit_rows(path: &PathBuf) -> i64 {
    let conn = rusqlite::Connection::open(path).unwrap();
    conn.query_row(
        "SELECT COUNT(*) FROM _cdc_audit_log WHERE consumed_at IS NULL",
        [],
        |row| row.get(0),
    )
    .unwrap()
}

#[tokio::test]
async fn captured_changes_stream_to_target() {
    let dir = TempDir::new().unwrap();
    let (source, ckpt) = paths(&dir);
    seed_users(&source);

    let config = test_config(source.to_str().unwrap(), &["users"], &["t1"]);
    let writer = MemoryWriter::new("t1");

    let mut engine = SyncEngine::new(config, &ckpt)
        .unwrap()
        .with_writers(vec![writer.clone() as Arc<dyn TargetWriter>]);
    let token = engine.cancel_token();

    let handle = tokio::spawn(async move { engine.start(None, false).await });

    let store = CheckpointStore::open(&ckpt).unwrap();
    let source_str = source.to_str().unwrap().to_string();
    assert!(
        wait_for(|| {
            store
                .load_position(&source_str, "t1")
                .map(|p| p.last_audit_id == 4)
                .unwrap_or(false)
        })
        .await,
        "cursor never reached audit id 4"
    );

    token.cancel();
    handle.await.unwrap().unwrap();

    // Events 1..4: two inserts, one update, one delete. Row 1 survives with
    // the updated name; row 2 is gone.
    assert_eq!(writer.row_count("users"), 1);
    let row = writer.get_row("users", "1").unwrap();
    assert_eq!(row["name"], json!("c"));

    // All targets checkpointed, so the audit rows are marked consumed.
    assert_eq!(unconsumed_audit_rows(&source), 0);
}

#[tokio::test]
async fn target_failure_is_isolated_and_does_not_advance_its_cursor() {
    let dir = TempDir::new().unwrap();
    let (source, ckpt) = paths(&dir);
    seed_users(&source);

    let config = test_config(source.to_str().unwrap(), &["users"], &["t1", "t2"]);
    let healthy = MemoryWriter::new("t1");
    let broken = MemoryWriter::new("t2");
    broken.fail_writes(true);

    let mut engine = SyncEngine::new(config, &ckpt).unwrap().with_writers(vec![
        healthy.clone() as Arc<dyn TargetWriter>,
        broken.clone() as Arc<dyn TargetWriter>,
    ]);
    let token = engine.cancel_token();
    let handle = tokio::spawn(async move { engine.start(None, false).await });

    let store = CheckpointStore::open(&ckpt).unwrap();
    let source_str = source.to_str().unwrap().to_string();
    assert!(
        wait_for(|| {
            store
                .load_position(&source_str, "t1")
                .map(|p| p.last_audit_id == 4)
                .unwrap_or(false)
        })
        .await,
        "healthy target never caught up"
    );

    token.cancel();
    handle.await.unwrap().unwrap();

    // The healthy target advanced; the broken one stayed at zero and will
    // replay after restart.
    assert_eq!(store.load_position(&source_str, "t1").unwrap().last_audit_id, 4);
    assert_eq!(store.load_position(&source_str, "t2").unwrap().last_audit_id, 0);

    // Not every target checkpointed, so nothing is marked consumed.
    assert_eq!(unconsumed_audit_rows(&source), 4);

    // The failure was recorded for the operator.
    let errors = store.list_unresolved_errors(&source_str, Some("t2")).unwrap();
    assert!(!errors.is_empty());
    assert!(errors[0].error_message.contains("simulated write failure"));
}

#[tokio::test]
async fn restart_replays_only_past_the_saved_cursor() {
    let dir = TempDir::new().unwrap();
    let (source, ckpt) = paths(&dir);
    seed_users(&source);

    let config = test_config(source.to_str().unwrap(), &["users"], &["t1"]);
    let source_str = source.to_str().unwrap().to_string();

    // First run applies everything.
    {
        let writer = MemoryWriter::new("t1");
        let mut engine = SyncEngine::new(config.clone(), &ckpt)
            .unwrap()
            .with_writers(vec![writer.clone() as Arc<dyn TargetWriter>]);
        let token = engine.cancel_token();
        let handle = tokio::spawn(async move { engine.start(None, false).await });
        let store = CheckpointStore::open(&ckpt).unwrap();
        assert!(
            wait_for(|| {
                store
                    .load_position(&source_str, "t1")
                    .map(|p| p.last_audit_id == 4)
                    .unwrap_or(false)
            })
            .await
        );
        token.cancel();
        handle.await.unwrap().unwrap();
    }

    // New source activity after the first run.
    {
        let mut conn = CaptureConnection::open(&source, &["users".to_string()]).unwrap();
        conn.execute(
            "INSERT INTO users (name) VALUES (?)",
            &[SqlParam::Text("late".into())],
        )
        .unwrap();
        conn.commit().unwrap();
        conn.close().unwrap();
    }

    // Second run starts from the saved cursor: the fresh writer only ever
    // sees audit id 5, so it holds exactly the late row. The late row reuses
    // id 2 (row 2 was deleted and users has no AUTOINCREMENT).
    let writer = MemoryWriter::new("t1");
    let mut engine = SyncEngine::new(config, &ckpt)
        .unwrap()
        .with_writers(vec![writer.clone() as Arc<dyn TargetWriter>]);
    let token = engine.cancel_token();
    let handle = tokio::spawn(async move { engine.start(None, false).await });

    assert!(wait_for(|| writer.row_count("users") == 1).await);
    token.cancel();
    handle.await.unwrap().unwrap();

    let row = writer.get_row("users", "2").unwrap();
    assert_eq!(row["name"], json!("late"));

    let store = CheckpointStore::open(&ckpt).unwrap();
    assert_eq!(store.load_position(&source_str, "t1").unwrap().last_audit_id, 5);
}

#[tokio::test]
async fn initial_sync_hands_over_to_streaming_without_gap() {
    let dir = TempDir::new().unwrap();
    let (source, ckpt) = paths(&dir);

    // Pre-existing data written without any capture wrapping: no audit rows.
    {
        let conn = rusqlite::Connection::open(&source).unwrap();
        conn.execute_batch("CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT)")
            .unwrap();
        for i in 0..50 {
            conn.execute("INSERT INTO users (name) VALUES (?1)", [format!("u{i}")])
                .unwrap();
        }
    }

    let config = test_config(source.to_str().unwrap(), &["users"], &["t1"]);
    let writer = MemoryWriter::new("t1");
    let mut engine = SyncEngine::new(config, &ckpt)
        .unwrap()
        .with_writers(vec![writer.clone() as Arc<dyn TargetWriter>]);
    let token = engine.cancel_token();
    let handle = tokio::spawn(async move { engine.start(None, true).await });

    // Snapshot lands first.
    assert!(wait_for(|| writer.row_count("users") == 50).await, "snapshot incomplete");

    // A captured write while streaming is live flows through the audit log.
    {
        let mut conn = CaptureConnection::open(&source, &["users".to_string()]).unwrap();
        conn.execute(
            "INSERT INTO users (name) VALUES (?)",
            &[SqlParam::Text("streamed".into())],
        )
        .unwrap();
        conn.commit().unwrap();
        conn.close().unwrap();
    }

    assert!(wait_for(|| writer.row_count("users") == 51).await, "streamed row never arrived");
    token.cancel();
    handle.await.unwrap().unwrap();

    let store = CheckpointStore::open(&ckpt).unwrap();
    let source_str = source.to_str().unwrap().to_string();
    let initial = store
        .load_initial_checkpoint(&source_str, "users")
        .unwrap()
        .unwrap();
    assert!(initial.is_completed());
    assert_eq!(initial.total_synced, 50);
    assert_eq!(store.load_position(&source_str, "t1").unwrap().last_audit_id, 1);
}
