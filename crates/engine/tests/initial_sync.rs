mod common;

use capture::CaptureConnection;
use checkpoint::CheckpointStore;
use common::{test_config, MemoryWriter};
use engine::InitialSync;
use model::{InitialSyncCheckpoint, RowKey};
use rusqlite::types::Value as SqlParam;
use rusqlite::Connection;
use std::sync::Arc;
use targets::TargetWriter;
use tempfile::TempDir;

struct Fixture {
    _dir: TempDir,
    source_path: String,
    store: CheckpointStore,
    writer: Arc<MemoryWriter>,
}

impl Fixture {
    fn new(rows: usize) -> Self {
        let dir = TempDir::new().unwrap();
        let source_path = dir.path().join("source.db");
        let source = Connection::open(&source_path).unwrap();
        source
            .execute_batch("CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT, active INTEGER)")
            .unwrap();
        for i in 1..=rows {
            source
                .execute(
                    "INSERT INTO users (name, active) VALUES (?1, ?2)",
                    rusqlite::params![format!("u{i}"), (i % 3 == 0) as i64],
                )
                .unwrap();
        }

        let store = CheckpointStore::open(dir.path().join("checkpoints.db")).unwrap();
        Fixture {
            source_path: source_path.to_str().unwrap().to_string(),
            _dir: dir,
            store,
            writer: MemoryWriter::new("t1"),
        }
    }

    fn open_source(&self) -> Connection {
        Connection::open(&self.source_path).unwrap()
    }

    fn targets(&self) -> Vec<Arc<dyn TargetWriter>> {
        vec![self.writer.clone() as Arc<dyn TargetWriter>]
    }
}

#[tokio::test]
async fn copies_all_rows_with_keyset_pagination() {
    let fx = Fixture::new(25);
    let mut config = test_config(&fx.source_path, &["users"], &["t1"]);
    config.batch_size = 10; // three pages: 10, 10, 5

    let targets = fx.targets();
    let mut initial = InitialSync::new(fx.open_source(), &fx.source_path, &targets, &config, &fx.store);

    let synced = initial.sync_table("users", true).await.unwrap();
    assert_eq!(synced, 25);
    assert_eq!(fx.writer.row_count("users"), 25);

    let ckpt = fx
        .store
        .load_initial_checkpoint(&fx.source_path, "users")
        .unwrap()
        .unwrap();
    assert!(ckpt.is_completed());
    assert_eq!(ckpt.total_synced, 25);
}

#[tokio::test]
async fn resumes_from_checkpoint_and_concatenates_totals() {
    let fx = Fixture::new(25);
    let mut config = test_config(&fx.source_path, &["users"], &["t1"]);
    config.batch_size = 5;

    // Simulate an interrupted run that had copied rows 1..=10.
    let mut ckpt = InitialSyncCheckpoint::begin("users");
    ckpt.update_progress(RowKey::Int(10), 10);
    fx.store
        .save_initial_checkpoint(&fx.source_path, &ckpt)
        .unwrap();

    let targets = fx.targets();
    let mut initial = InitialSync::new(fx.open_source(), &fx.source_path, &targets, &config, &fx.store);

    let synced = initial.sync_table("users", true).await.unwrap();
    assert_eq!(synced, 25, "prior and resumed totals concatenate");
    // Only rows past the checkpoint were re-copied.
    assert_eq!(fx.writer.row_count("users"), 15);
    assert!(fx.writer.get_row("users", "10").is_none());
    assert!(fx.writer.get_row("users", "11").is_some());
}

#[tokio::test]
async fn completed_checkpoint_skips_the_copy() {
    let fx = Fixture::new(10);
    let config = test_config(&fx.source_path, &["users"], &["t1"]);

    let mut ckpt = InitialSyncCheckpoint::begin("users");
    ckpt.total_synced = 10;
    ckpt.complete();
    fx.store
        .save_initial_checkpoint(&fx.source_path, &ckpt)
        .unwrap();

    let targets = fx.targets();
    let mut initial = InitialSync::new(fx.open_source(), &fx.source_path, &targets, &config, &fx.store);

    let synced = initial.sync_table("users", true).await.unwrap();
    assert_eq!(synced, 10);
    assert_eq!(fx.writer.row_count("users"), 0, "no rows should move");
}

#[tokio::test]
async fn resume_false_recopies_from_scratch() {
    let fx = Fixture::new(10);
    let config = test_config(&fx.source_path, &["users"], &["t1"]);

    let mut ckpt = InitialSyncCheckpoint::begin("users");
    ckpt.update_progress(RowKey::Int(8), 8);
    fx.store
        .save_initial_checkpoint(&fx.source_path, &ckpt)
        .unwrap();

    let targets = fx.targets();
    let mut initial = InitialSync::new(fx.open_source(), &fx.source_path, &targets, &config, &fx.store);

    let synced = initial.sync_table("users", false).await.unwrap();
    assert_eq!(synced, 10);
    assert_eq!(fx.writer.row_count("users"), 10);
}

#[tokio::test]
async fn filter_condition_restricts_initial_rows() {
    let fx = Fixture::new(12);
    let mut config = test_config(&fx.source_path, &["users"], &["t1"]);
    config.mappings[0].filter_condition = Some("active = 1".into());

    let targets = fx.targets();
    let mut initial = InitialSync::new(fx.open_source(), &fx.source_path, &targets, &config, &fx.store);

    // Rows 3, 6, 9, 12 have active = 1.
    let synced = initial.sync_table("users", true).await.unwrap();
    assert_eq!(synced, 4);
    assert_eq!(fx.writer.row_count("users"), 4);
    assert!(fx.writer.get_row("users", "3").is_some());
    assert!(fx.writer.get_row("users", "1").is_none());
}

#[tokio::test]
async fn failing_target_fails_the_table() {
    let fx = Fixture::new(10);
    let config = test_config(&fx.source_path, &["users"], &["t1"]);
    fx.writer.fail_writes(true);

    let targets = fx.targets();
    let mut initial = InitialSync::new(fx.open_source(), &fx.source_path, &targets, &config, &fx.store);

    assert!(initial.sync_table("users", true).await.is_err());
}

#[tokio::test]
async fn handover_id_reflects_audit_high_water_mark() {
    let fx = Fixture::new(5);
    let config = test_config(&fx.source_path, &["users"], &["t1"]);

    // No audit table yet: hand-over is zero.
    {
        let targets = fx.targets();
        let mut initial = InitialSync::new(fx.open_source(), &fx.source_path, &targets, &config, &fx.store);
        assert_eq!(initial.run_with_handover(&[]).await.unwrap(), 0);
    }

    // Two captured writes raise the high-water mark to 2.
    {
        let mut conn = CaptureConnection::open(&fx.source_path, &["users".to_string()]).unwrap();
        conn.execute(
            "INSERT INTO users (name, active) VALUES (?, 0)",
            &[SqlParam::Text("x".into())],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO users (name, active) VALUES (?, 0)",
            &[SqlParam::Text("y".into())],
        )
        .unwrap();
        conn.commit().unwrap();
        conn.close().unwrap();
    }

    let targets = fx.targets();
    let mut initial = InitialSync::new(fx.open_source(), &fx.source_path, &targets, &config, &fx.store);
    let handover = initial.run_with_handover(&["users".to_string()]).await.unwrap();
    assert_eq!(handover, 2);
    assert_eq!(fx.writer.row_count("users"), 7);
}
