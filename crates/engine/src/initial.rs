//! Bulk copy of pre-existing source rows, run before streaming starts.
//!
//! Pagination is keyset-based (`WHERE pk > ?1 ORDER BY pk LIMIT n`); OFFSET
//! is never used because it degrades with table size. Progress is
//! checkpointed so an interrupted copy resumes where it stopped.

use crate::error::EngineError;
use crate::transform::Transformer;
use capture::schema::AUDIT_TABLE;
use checkpoint::CheckpointStore;
use futures::future::join_all;
use model::{InitialSyncCheckpoint, Row, RowKey};
use rusqlite::{Connection, OptionalExtension};
use engine_config::{SyncConfig, TableMapping};
use std::sync::Arc;
use targets::TargetWriter;
use tracing::{debug, info};

/// Synthetic cursor column used when a table has no usable primary key.
const ROWID_COLUMN: &str = "rowid";

pub struct InitialSync<'a> {
    // Owned: the copier's futures must stay Send, and a shared borrow of a
    // rusqlite connection is not.
    source: Connection,
    source_db_path: &'a str,
    targets: &'a [Arc<dyn TargetWriter>],
    config: &'a SyncConfig,
    store: &'a CheckpointStore,
}

impl<'a> InitialSync<'a> {
    pub fn new(
        source: Connection,
        source_db_path: &'a str,
        targets: &'a [Arc<dyn TargetWriter>],
        config: &'a SyncConfig,
        store: &'a CheckpointStore,
    ) -> Self {
        InitialSync {
            source,
            source_db_path,
            targets,
            config,
            store,
        }
    }

    /// Copy every table and return the hand-over audit id read before the
    /// first row moved. Streaming resumes at that id, so changes made while
    /// the snapshot runs are replayed rather than lost; the overlap is
    /// absorbed by upsert idempotency.
    pub async fn run_with_handover(&mut self, tables: &[String]) -> Result<i64, EngineError> {
        let handover_id = self.max_audit_id();
        info!(handover_id, ?tables, "initial sync starting");

        for table in tables {
            let synced = self.sync_table(table, true).await?;
            info!(table = %table, rows = synced, "initial sync table complete");
        }

        info!(handover_id, "initial sync hand-over complete");
        Ok(handover_id)
    }

    /// Copy one table. With `resume`, a prior checkpoint shortens the work:
    /// a completed table is skipped outright, a partial one continues from
    /// its last primary key.
    pub async fn sync_table(&mut self, table: &str, resume: bool) -> Result<u64, EngineError> {
        let mapping = self
            .config
            .table_mapping(table)
            .ok_or_else(|| EngineError::MissingMapping(table.to_string()))?;

        let checkpoint = if resume {
            self.store.load_initial_checkpoint(self.source_db_path, table)?
        } else {
            None
        };

        if let Some(ckpt) = &checkpoint {
            if ckpt.is_completed() {
                info!(table, total_synced = ckpt.total_synced, "initial sync already completed, skipping");
                return Ok(ckpt.total_synced);
            }
        }

        let pk_column = self.effective_primary_key(table, mapping)?;
        let start_pk = checkpoint.as_ref().and_then(|c| c.last_pk.clone());
        let already_synced = checkpoint.as_ref().map(|c| c.total_synced).unwrap_or(0);

        info!(
            table,
            pk_column = %pk_column,
            resume_from = ?start_pk,
            "initial sync table starting"
        );

        let synced = self
            .paginate(table, mapping, &pk_column, start_pk, already_synced)
            .await?;

        let mut final_checkpoint = InitialSyncCheckpoint::begin(table);
        final_checkpoint.total_synced = synced;
        final_checkpoint.complete();
        self.store
            .save_initial_checkpoint(self.source_db_path, &final_checkpoint)?;

        Ok(synced)
    }

    async fn paginate(
        &mut self,
        table: &str,
        mapping: &TableMapping,
        pk_column: &str,
        start_pk: Option<RowKey>,
        already_synced: u64,
    ) -> Result<u64, EngineError> {
        let transformer = Transformer::new(mapping);
        let target_table = transformer.target_table().to_string();
        let synthetic_rowid = pk_column == ROWID_COLUMN;

        let mut synced = already_synced;
        let mut last_pk = start_pk;
        let mut batch_num: usize = 0;
        let checkpoint_every = self.config.checkpoint_interval.max(1);

        loop {
            let mut rows = self.fetch_page(
                table,
                pk_column,
                last_pk.as_ref(),
                mapping.filter_condition.as_deref(),
                self.config.batch_size,
            )?;

            if rows.is_empty() {
                break;
            }

            let page_len = rows.len();
            last_pk = rows
                .last()
                .and_then(|row| row.get(pk_column))
                .map(json_to_row_key);

            if synthetic_rowid {
                for row in &mut rows {
                    row.remove(ROWID_COLUMN);
                }
            }

            let transformed = transformer.transform_batch(&rows);
            write_batch_to_all_targets(self.targets, table, &target_table, &transformed)
                .await?;

            synced += page_len as u64;
            batch_num += 1;

            if batch_num % checkpoint_every == 0 {
                let mut ckpt = InitialSyncCheckpoint::begin(table);
                ckpt.last_pk = last_pk.clone();
                ckpt.total_synced = synced;
                self.store.save_initial_checkpoint(self.source_db_path, &ckpt)?;
                debug!(table, synced, last_pk = ?ckpt.last_pk, "initial sync checkpoint saved");
            }

            if page_len < self.config.batch_size {
                break;
            }

            // Brief yield between full pages so the copy does not monopolize
            // the targets.
            tokio::task::yield_now().await;
        }

        Ok(synced)
    }

    fn fetch_page(
        &self,
        table: &str,
        pk_column: &str,
        last_pk: Option<&RowKey>,
        filter: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Row>, EngineError> {
        let select_list = if pk_column == ROWID_COLUMN {
            format!("{ROWID_COLUMN} AS {ROWID_COLUMN}, *")
        } else {
            "*".to_string()
        };

        let mut predicates = Vec::new();
        if let Some(filter) = filter {
            predicates.push(format!("({filter})"));
        }
        if last_pk.is_some() {
            predicates.push(format!("{} > ?1", quote_ident(pk_column)));
        }
        let where_clause = if predicates.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", predicates.join(" AND "))
        };

        let sql = format!(
            "SELECT {select_list} FROM {}{where_clause} ORDER BY {} LIMIT {limit}",
            quote_ident(table),
            quote_ident(pk_column),
        );

        let mut stmt = self.source.prepare(&sql)?;
        let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();

        let params: Vec<rusqlite::types::Value> = match last_pk {
            Some(RowKey::Int(n)) => vec![rusqlite::types::Value::Integer(*n)],
            Some(RowKey::Text(s)) => vec![rusqlite::types::Value::Text(s.clone())],
            None => Vec::new(),
        };

        let mut rows = stmt.query(rusqlite::params_from_iter(params.iter()))?;
        let mut page = Vec::new();
        while let Some(row) = rows.next()? {
            let mut out = Row::new();
            for (idx, name) in columns.iter().enumerate() {
                let value = match row.get_ref(idx)? {
                    rusqlite::types::ValueRef::Null => serde_json::Value::Null,
                    rusqlite::types::ValueRef::Integer(i) => serde_json::Value::from(i),
                    rusqlite::types::ValueRef::Real(f) => serde_json::Number::from_f64(f)
                        .map(serde_json::Value::Number)
                        .unwrap_or(serde_json::Value::Null),
                    rusqlite::types::ValueRef::Text(t) => {
                        serde_json::Value::String(String::from_utf8_lossy(t).into_owned())
                    }
                    rusqlite::types::ValueRef::Blob(b) => {
                        serde_json::Value::String(String::from_utf8_lossy(b).into_owned())
                    }
                };
                out.insert(name.clone(), value);
            }
            page.push(out);
        }

        Ok(page)
    }

    /// Resolve the pagination key: the configured key if the table has that
    /// column, else the declared primary key, else the physical rowid.
    fn effective_primary_key(
        &self,
        table: &str,
        mapping: &TableMapping,
    ) -> Result<String, EngineError> {
        let mut stmt = self
            .source
            .prepare(&format!("PRAGMA table_info({})", quote_ident(table)))?;
        let mut rows = stmt.query([])?;

        let mut declared_pk: Option<String> = None;
        let mut has_configured = false;
        while let Some(row) = rows.next()? {
            let name: String = row.get(1)?;
            let pk_rank: i64 = row.get(5)?;
            if name.eq_ignore_ascii_case(&mapping.primary_key) {
                has_configured = true;
            }
            if pk_rank == 1 && declared_pk.is_none() {
                declared_pk = Some(name);
            }
        }

        if has_configured {
            return Ok(mapping.primary_key.clone());
        }
        if let Some(pk) = declared_pk {
            return Ok(pk);
        }
        Ok(ROWID_COLUMN.to_string())
    }

    /// Current high-water audit id, or zero when the audit table does not
    /// exist yet (a source no capture connection has touched).
    fn max_audit_id(&self) -> i64 {
        self.source
            .query_row(
                &format!("SELECT COALESCE(MAX(id), 0) FROM {AUDIT_TABLE}"),
                [],
                |row| row.get(0),
            )
            .optional()
            .ok()
            .flatten()
            .unwrap_or(0)
    }
}

/// Fan a page out to every target in parallel. Any target failing fails
/// the table: the operator resolves the fault and restarts, resuming at
/// the last checkpoint.
async fn write_batch_to_all_targets(
    targets: &[Arc<dyn TargetWriter>],
    table: &str,
    target_table: &str,
    rows: &[Row],
) -> Result<(), EngineError> {
    if rows.is_empty() {
        return Ok(());
    }

    let writes = targets
        .iter()
        .map(|target| async move { (target.name(), target.batch_upsert(target_table, rows).await) });

    for (name, result) in join_all(writes).await {
        if let Err(source) = result {
            return Err(EngineError::InitialSyncTarget {
                target: name.to_string(),
                table: table.to_string(),
                source,
            });
        }
    }
    Ok(())
}

fn json_to_row_key(value: &serde_json::Value) -> RowKey {
    match value {
        serde_json::Value::Number(n) if n.as_i64().is_some() => {
            RowKey::Int(n.as_i64().unwrap_or_default())
        }
        serde_json::Value::String(s) => RowKey::Text(s.clone()),
        other => RowKey::Text(other.to_string()),
    }
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}
