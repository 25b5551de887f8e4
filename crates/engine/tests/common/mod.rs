//! Shared test fixtures: an in-memory target writer and config builders.

use async_trait::async_trait;
use engine_config::{
    ConnectionConfig, MysqlConnection, RetryPolicy, SourceConfig, SyncConfig, TableMapping,
    TargetConfig, TargetKind,
};
use model::{Row, RowKey};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use targets::{TargetWriter, WriteError};

/// Target writer backed by an in-memory map, with the same idempotency
/// guarantees the real writers provide: upsert overwrites by key, deleting an
/// absent key is a no-op.
pub struct MemoryWriter {
    name: String,
    key_columns: HashMap<String, String>,
    tables: Mutex<HashMap<String, BTreeMap<String, Row>>>,
    connected: AtomicBool,
    fail_writes: AtomicBool,
}

impl MemoryWriter {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(MemoryWriter {
            name: name.to_string(),
            key_columns: HashMap::new(),
            tables: Mutex::new(HashMap::new()),
            connected: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
        })
    }

    /// Make every subsequent write fail with a non-retryable error.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn row_count(&self, table: &str) -> usize {
        self.tables
            .lock()
            .unwrap()
            .get(table)
            .map(|t| t.len())
            .unwrap_or(0)
    }

    pub fn get_row(&self, table: &str, key: &str) -> Option<Row> {
        self.tables
            .lock()
            .unwrap()
            .get(table)
            .and_then(|t| t.get(key))
            .cloned()
    }

    fn key_of(&self, table: &str, row: &Row) -> String {
        let column = self
            .key_columns
            .get(table)
            .map(String::as_str)
            .unwrap_or("id");
        match row.get(column) {
            Some(serde_json::Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => String::new(),
        }
    }

    fn check_failure(&self, table: &str) -> Result<(), WriteError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            Err(WriteError::Configuration(format!(
                "simulated write failure on {table}"
            )))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl TargetWriter for MemoryWriter {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> TargetKind {
        TargetKind::Mysql
    }

    async fn connect(&self) -> Result<(), WriteError> {
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), WriteError> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn upsert(&self, table: &str, row: &Row) -> Result<(), WriteError> {
        self.check_failure(table)?;
        let key = self.key_of(table, row);
        self.tables
            .lock()
            .unwrap()
            .entry(table.to_string())
            .or_default()
            .insert(key, row.clone());
        Ok(())
    }

    async fn batch_upsert(&self, table: &str, rows: &[Row]) -> Result<(), WriteError> {
        for row in rows {
            self.upsert(table, row).await?;
        }
        Ok(())
    }

    async fn delete(&self, table: &str, key: &RowKey) -> Result<(), WriteError> {
        self.check_failure(table)?;
        if let Some(rows) = self.tables.lock().unwrap().get_mut(table) {
            rows.remove(&key.to_string());
        }
        Ok(())
    }

    async fn ping(&self) -> Result<(), WriteError> {
        Ok(())
    }
}

/// Config pointing at `db_path` with one passthrough mapping per table and
/// one dummy mysql-typed target per name (the engine gets injected writers,
/// so the connection block is never dialed).
pub fn test_config(db_path: &str, tables: &[&str], target_names: &[&str]) -> SyncConfig {
    SyncConfig {
        source: SourceConfig {
            db_path: db_path.to_string(),
            journal_mode: "WAL".into(),
            tables: tables.iter().map(|t| t.to_string()).collect(),
        },
        targets: target_names
            .iter()
            .map(|name| TargetConfig {
                name: name.to_string(),
                kind: TargetKind::Mysql,
                connection: ConnectionConfig::Mysql(MysqlConnection {
                    host: "localhost".into(),
                    port: 3306,
                    database: "unused".into(),
                    username: "unused".into(),
                    password: "unused".into(),
                    charset: "utf8mb4".into(),
                    pool_size: 1,
                }),
                batch_size: None,
                retry_policy: RetryPolicy::default(),
            })
            .collect(),
        mappings: tables
            .iter()
            .map(|t| TableMapping::passthrough(t))
            .collect(),
        batch_size: 100,
        checkpoint_interval: 10,
        log_level: "INFO".into(),
    }
}

/// Poll `condition` until it holds or ~5 seconds pass.
pub async fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(std::time::Duration::from_millis(25)).await;
    }
    false
}
