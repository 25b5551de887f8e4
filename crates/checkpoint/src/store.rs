use crate::error::CheckpointError;
use crate::time::parse_utc;
use chrono::{DateTime, Utc};
use model::{InitialSyncCheckpoint, RowKey, SyncPosition, SyncState};
use rusqlite::{Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS sync_positions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    source_db_path TEXT NOT NULL,
    target_name TEXT NOT NULL,
    last_audit_id INTEGER NOT NULL DEFAULT 0,
    total_events INTEGER NOT NULL DEFAULT 0,
    last_processed_at TIMESTAMP,
    created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
    updated_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
    UNIQUE(source_db_path, target_name)
);

CREATE TABLE IF NOT EXISTS initial_sync_checkpoints (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    source_db_path TEXT NOT NULL,
    table_name TEXT NOT NULL,
    last_pk TEXT,
    total_synced INTEGER DEFAULT 0,
    status TEXT DEFAULT 'running',
    started_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
    updated_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
    UNIQUE(source_db_path, table_name)
);

CREATE TABLE IF NOT EXISTS sync_errors (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    source_db_path TEXT NOT NULL,
    target_name TEXT NOT NULL,
    event_id TEXT,
    error_type TEXT NOT NULL,
    error_message TEXT NOT NULL,
    retry_count INTEGER DEFAULT 0,
    resolved BOOLEAN DEFAULT FALSE,
    created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
    resolved_at TIMESTAMP
);

CREATE TABLE IF NOT EXISTS sync_stats (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    source_db_path TEXT NOT NULL,
    target_name TEXT NOT NULL,
    table_name TEXT NOT NULL,
    operation TEXT NOT NULL,
    count INTEGER DEFAULT 0,
    last_sync_at TIMESTAMP,
    UNIQUE(source_db_path, target_name, table_name, operation)
);

CREATE INDEX IF NOT EXISTS idx_positions_source
    ON sync_positions(source_db_path, target_name);
CREATE INDEX IF NOT EXISTS idx_initial_source
    ON initial_sync_checkpoints(source_db_path, table_name);
CREATE INDEX IF NOT EXISTS idx_errors_unresolved
    ON sync_errors(resolved, created_at) WHERE resolved = FALSE;
"#;

/// One unresolved (or historical) per-event failure.
#[derive(Debug, Clone)]
pub struct SyncErrorRecord {
    pub id: i64,
    pub target_name: String,
    pub event_id: Option<String>,
    pub error_type: String,
    pub error_message: String,
    pub retry_count: u32,
    pub created_at: Option<DateTime<Utc>>,
}

/// Aggregated counter for one (table, operation) pair.
#[derive(Debug, Clone)]
pub struct TableOpStats {
    pub count: u64,
    pub last_sync_at: Option<DateTime<Utc>>,
}

/// Store for per-(source, target) cursors, per-(source, table) initial-sync
/// progress, error records, and sync statistics.
pub struct CheckpointStore {
    db_path: PathBuf,
}

impl CheckpointStore {
    pub const DEFAULT_PATH: &'static str = "checkpoints.db";

    pub fn open(db_path: impl AsRef<Path>) -> Result<Self, CheckpointError> {
        let store = CheckpointStore {
            db_path: db_path.as_ref().to_path_buf(),
        };
        let conn = store.connect()?;
        conn.execute_batch(SCHEMA).map_err(CheckpointError::Schema)?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    fn connect(&self) -> Result<Connection, CheckpointError> {
        Ok(Connection::open(&self.db_path)?)
    }

    // ------------------------------------------------------------------
    // Incremental cursors
    // ------------------------------------------------------------------

    /// Upsert the cursor for a (source, target) pair.
    pub fn save_position(&self, position: &SyncPosition) -> Result<(), CheckpointError> {
        let conn = self.connect()?;
        conn.execute(
            "INSERT INTO sync_positions \
                 (source_db_path, target_name, last_audit_id, total_events, \
                  last_processed_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
             ON CONFLICT(source_db_path, target_name) DO UPDATE SET \
                 last_audit_id = excluded.last_audit_id, \
                 total_events = excluded.total_events, \
                 last_processed_at = excluded.last_processed_at, \
                 updated_at = excluded.updated_at",
            rusqlite::params![
                position.source_db_path,
                position.target_name,
                position.last_audit_id,
                position.total_events,
                position.last_processed_at.to_rfc3339(),
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Load a cursor; a pair never seen before yields the zero-valued cursor.
    pub fn load_position(
        &self,
        source_db_path: &str,
        target_name: &str,
    ) -> Result<SyncPosition, CheckpointError> {
        let conn = self.connect()?;
        let found = conn
            .query_row(
                "SELECT last_audit_id, total_events, last_processed_at \
                 FROM sync_positions \
                 WHERE source_db_path = ?1 AND target_name = ?2",
                [source_db_path, target_name],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, u64>(1)?,
                        row.get::<_, Option<String>>(2)?,
                    ))
                },
            )
            .optional()?;

        Ok(match found {
            Some((last_audit_id, total_events, processed_at)) => SyncPosition {
                source_db_path: source_db_path.to_string(),
                target_name: target_name.to_string(),
                last_audit_id,
                total_events,
                last_processed_at: processed_at
                    .as_deref()
                    .and_then(parse_utc)
                    .unwrap_or_else(Utc::now),
            },
            None => SyncPosition::initial(source_db_path, target_name),
        })
    }

    // ------------------------------------------------------------------
    // Initial-sync checkpoints
    // ------------------------------------------------------------------

    /// Upsert a table's bulk-copy progress. `started_at` of an existing row
    /// is preserved.
    pub fn save_initial_checkpoint(
        &self,
        source_db_path: &str,
        checkpoint: &InitialSyncCheckpoint,
    ) -> Result<(), CheckpointError> {
        let conn = self.connect()?;
        conn.execute(
            "INSERT INTO initial_sync_checkpoints \
                 (source_db_path, table_name, last_pk, total_synced, status, \
                  started_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7) \
             ON CONFLICT(source_db_path, table_name) DO UPDATE SET \
                 last_pk = excluded.last_pk, \
                 total_synced = excluded.total_synced, \
                 status = excluded.status, \
                 updated_at = excluded.updated_at",
            rusqlite::params![
                source_db_path,
                checkpoint.table_name,
                checkpoint.last_pk.as_ref().map(|pk| pk.to_string()),
                checkpoint.total_synced,
                checkpoint.status.as_str(),
                checkpoint.started_at.to_rfc3339(),
                checkpoint.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn load_initial_checkpoint(
        &self,
        source_db_path: &str,
        table_name: &str,
    ) -> Result<Option<InitialSyncCheckpoint>, CheckpointError> {
        let conn = self.connect()?;
        conn.query_row(
            "SELECT table_name, last_pk, total_synced, status, started_at, updated_at \
             FROM initial_sync_checkpoints \
             WHERE source_db_path = ?1 AND table_name = ?2",
            [source_db_path, table_name],
            row_to_initial_checkpoint,
        )
        .optional()?
        .map(finish_initial_checkpoint)
        .transpose()
    }

    /// Every checkpoint recorded for a source, keyed by table.
    pub fn list_initial_checkpoints(
        &self,
        source_db_path: &str,
    ) -> Result<HashMap<String, InitialSyncCheckpoint>, CheckpointError> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT table_name, last_pk, total_synced, status, started_at, updated_at \
             FROM initial_sync_checkpoints \
             WHERE source_db_path = ?1",
        )?;
        let rows = stmt.query_map([source_db_path], row_to_initial_checkpoint)?;

        let mut result = HashMap::new();
        for row in rows {
            let checkpoint = finish_initial_checkpoint(row?)?;
            result.insert(checkpoint.table_name.clone(), checkpoint);
        }
        Ok(result)
    }

    pub fn mark_initial_complete(
        &self,
        source_db_path: &str,
        table_name: &str,
    ) -> Result<(), CheckpointError> {
        let conn = self.connect()?;
        conn.execute(
            "UPDATE initial_sync_checkpoints \
             SET status = ?1, updated_at = ?2 \
             WHERE source_db_path = ?3 AND table_name = ?4",
            rusqlite::params![
                SyncState::Completed.as_str(),
                Utc::now().to_rfc3339(),
                source_db_path,
                table_name,
            ],
        )?;
        Ok(())
    }

    /// Operator reset: forces the next run to re-copy the table.
    pub fn delete_initial_checkpoint(
        &self,
        source_db_path: &str,
        table_name: &str,
    ) -> Result<(), CheckpointError> {
        let conn = self.connect()?;
        conn.execute(
            "DELETE FROM initial_sync_checkpoints \
             WHERE source_db_path = ?1 AND table_name = ?2",
            [source_db_path, table_name],
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Error log
    // ------------------------------------------------------------------

    pub fn log_error(
        &self,
        source_db_path: &str,
        target_name: &str,
        event_id: Option<&str>,
        error_type: &str,
        error_message: &str,
    ) -> Result<i64, CheckpointError> {
        let conn = self.connect()?;
        conn.execute(
            "INSERT INTO sync_errors \
                 (source_db_path, target_name, event_id, error_type, error_message) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![source_db_path, target_name, event_id, error_type, error_message],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn list_unresolved_errors(
        &self,
        source_db_path: &str,
        target_name: Option<&str>,
    ) -> Result<Vec<SyncErrorRecord>, CheckpointError> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT id, target_name, event_id, error_type, error_message, retry_count, created_at \
             FROM sync_errors \
             WHERE source_db_path = ?1 \
               AND (?2 IS NULL OR target_name = ?2) \
               AND resolved = FALSE \
             ORDER BY created_at",
        )?;
        let rows = stmt.query_map(rusqlite::params![source_db_path, target_name], |row| {
            Ok(SyncErrorRecord {
                id: row.get(0)?,
                target_name: row.get(1)?,
                event_id: row.get(2)?,
                error_type: row.get(3)?,
                error_message: row.get(4)?,
                retry_count: row.get(5)?,
                created_at: row
                    .get::<_, Option<String>>(6)?
                    .as_deref()
                    .and_then(parse_utc),
            })
        })?;

        let mut errors = Vec::new();
        for row in rows {
            errors.push(row?);
        }
        Ok(errors)
    }

    pub fn resolve_error(&self, error_id: i64) -> Result<(), CheckpointError> {
        let conn = self.connect()?;
        conn.execute(
            "UPDATE sync_errors SET resolved = TRUE, resolved_at = ?1 WHERE id = ?2",
            rusqlite::params![Utc::now().to_rfc3339(), error_id],
        )?;
        Ok(())
    }

    pub fn increment_retry_count(&self, error_id: i64) -> Result<u32, CheckpointError> {
        let conn = self.connect()?;
        conn.execute(
            "UPDATE sync_errors SET retry_count = retry_count + 1 WHERE id = ?1",
            [error_id],
        )?;
        let count = conn
            .query_row(
                "SELECT retry_count FROM sync_errors WHERE id = ?1",
                [error_id],
                |row| row.get::<_, u32>(0),
            )
            .optional()?;
        Ok(count.unwrap_or(0))
    }

    // ------------------------------------------------------------------
    // Statistics
    // ------------------------------------------------------------------

    pub fn update_stats(
        &self,
        source_db_path: &str,
        target_name: &str,
        table_name: &str,
        operation: &str,
        count: u64,
    ) -> Result<(), CheckpointError> {
        let conn = self.connect()?;
        conn.execute(
            "INSERT INTO sync_stats \
                 (source_db_path, target_name, table_name, operation, count, last_sync_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
             ON CONFLICT(source_db_path, target_name, table_name, operation) DO UPDATE SET \
                 count = count + excluded.count, \
                 last_sync_at = excluded.last_sync_at",
            rusqlite::params![
                source_db_path,
                target_name,
                table_name,
                operation,
                count,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Counters keyed `"{table}.{operation}"`, as shown by the status surface.
    pub fn get_stats(
        &self,
        source_db_path: &str,
        target_name: &str,
    ) -> Result<HashMap<String, TableOpStats>, CheckpointError> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT table_name, operation, count, last_sync_at \
             FROM sync_stats \
             WHERE source_db_path = ?1 AND target_name = ?2",
        )?;
        let rows = stmt.query_map([source_db_path, target_name], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, u64>(2)?,
                row.get::<_, Option<String>>(3)?,
            ))
        })?;

        let mut stats = HashMap::new();
        for row in rows {
            let (table, operation, count, last_sync_at) = row?;
            stats.insert(
                format!("{table}.{operation}"),
                TableOpStats {
                    count,
                    last_sync_at: last_sync_at.as_deref().and_then(parse_utc),
                },
            );
        }
        Ok(stats)
    }

    pub fn reset_stats(
        &self,
        source_db_path: &str,
        target_name: &str,
    ) -> Result<(), CheckpointError> {
        let conn = self.connect()?;
        conn.execute(
            "DELETE FROM sync_stats WHERE source_db_path = ?1 AND target_name = ?2",
            [source_db_path, target_name],
        )?;
        Ok(())
    }
}

type InitialCheckpointRow = (String, Option<String>, u64, String, Option<String>, Option<String>);

fn row_to_initial_checkpoint(row: &rusqlite::Row<'_>) -> rusqlite::Result<InitialCheckpointRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
    ))
}

fn finish_initial_checkpoint(
    raw: InitialCheckpointRow,
) -> Result<InitialSyncCheckpoint, CheckpointError> {
    let (table_name, last_pk, total_synced, status, started_at, updated_at) = raw;
    let status: SyncState = status
        .parse()
        .map_err(|_| CheckpointError::InvalidState {
            table: table_name.clone(),
            state: status.clone(),
        })?;

    Ok(InitialSyncCheckpoint {
        table_name,
        last_pk: last_pk.as_deref().map(RowKey::parse),
        total_synced,
        status,
        started_at: started_at
            .as_deref()
            .and_then(parse_utc)
            .unwrap_or_else(Utc::now),
        updated_at: updated_at
            .as_deref()
            .and_then(parse_utc)
            .unwrap_or_else(Utc::now),
    })
}
