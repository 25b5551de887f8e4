use crate::error::WriteError;
use crate::mysql::MySqlWriter;
use crate::oracle::OracleWriter;
use async_trait::async_trait;
use engine_config::{ConnectionConfig, TableMapping, TargetConfig, TargetKind};
use model::{ChangeEvent, Row, RowKey};
use std::collections::HashMap;
use std::sync::Arc;

/// Uniform write contract every replication target implements.
///
/// `upsert`/`batch_upsert` are idempotent insert-or-update keyed by the
/// target's primary key; applying the same event twice leaves the same row.
/// `delete` of an absent row is a no-op. Both guarantees make at-least-once
/// delivery safe.
#[async_trait]
pub trait TargetWriter: Send + Sync {
    fn name(&self) -> &str;

    fn kind(&self) -> TargetKind;

    /// Establish the connection pool. Idempotent.
    async fn connect(&self) -> Result<(), WriteError>;

    /// Tear down the connection pool. Idempotent.
    async fn disconnect(&self) -> Result<(), WriteError>;

    fn is_connected(&self) -> bool;

    async fn upsert(&self, table: &str, row: &Row) -> Result<(), WriteError>;

    async fn batch_upsert(&self, table: &str, rows: &[Row]) -> Result<(), WriteError>;

    /// Delete by primary key. The key column is the writer's configured one
    /// for the table (`id` when unmapped); a second delete of the same key is
    /// a no-op.
    async fn delete(&self, table: &str, key: &RowKey) -> Result<(), WriteError>;

    async fn ping(&self) -> Result<(), WriteError>;

    async fn health_check(&self) -> bool {
        self.is_connected() && self.ping().await.is_ok()
    }

    /// Apply one change event: DELETE dispatches to `delete`, everything else
    /// upserts the after image.
    async fn write_event(
        &self,
        event: &ChangeEvent,
        mapping: &TableMapping,
    ) -> Result<(), WriteError> {
        if event.is_delete() {
            self.delete(mapping.target_table(), &event.row_id).await
        } else {
            let empty = Row::new();
            let after = event.after.as_ref().unwrap_or(&empty);
            self.upsert(mapping.target_table(), after).await
        }
    }
}

/// Primary-key column per target table, derived from the mappings. Tables
/// without a mapping fall back to `id`.
pub(crate) fn key_columns(mappings: &[TableMapping]) -> HashMap<String, String> {
    mappings
        .iter()
        .map(|m| (m.target_table().to_string(), m.primary_key.clone()))
        .collect()
}

pub(crate) const DEFAULT_KEY_COLUMN: &str = "id";

/// Build the concrete writer for a target, dispatching on its kind.
pub fn create_writer(
    config: &TargetConfig,
    default_batch_size: usize,
    mappings: &[TableMapping],
) -> Result<Arc<dyn TargetWriter>, WriteError> {
    let batch_size = config.batch_size.unwrap_or(default_batch_size).max(1);
    let keys = key_columns(mappings);

    match (&config.kind, &config.connection) {
        (TargetKind::Mysql, ConnectionConfig::Mysql(conn)) => Ok(Arc::new(MySqlWriter::new(
            &config.name,
            conn.clone(),
            batch_size,
            config.retry_policy,
            keys,
        ))),
        (TargetKind::Oracle, ConnectionConfig::Oracle(conn)) => Ok(Arc::new(OracleWriter::new(
            &config.name,
            conn.clone(),
            batch_size,
            config.retry_policy,
            keys,
        ))),
        (kind, _) => Err(WriteError::Configuration(format!(
            "target {} is declared as {kind} but its connection block does not match",
            config.name
        ))),
    }
}
