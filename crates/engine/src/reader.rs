use crate::error::ReadError;
use capture::schema::{audit_schema_sql, AUDIT_TABLE};
use chrono::Utc;
use model::{AuditRecord, ChangeEvent, Operation, Row};
use rusqlite::{params_from_iter, Connection, OpenFlags};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, warn};

/// Point-in-time counters over the audit table, feeding the status surface's
/// lag estimate.
#[derive(Debug, Clone, Copy, Default)]
pub struct AuditStats {
    pub total: u64,
    pub unconsumed: u64,
    pub max_id: i64,
    pub last_read_id: i64,
    pub pending: u64,
}

/// Ordered, restartable poller over unconsumed audit rows.
///
/// One reader per source database: it is the single reader of unconsumed
/// rows and the single writer of consumed marks. Reads go through a
/// read-only connection; `mark_consumed` uses a separate write connection
/// with its own short transaction.
pub struct AuditReader {
    read_conn: Connection,
    mark_conn: Connection,
    batch_size: usize,
    poll_interval: Duration,
    last_audit_id: i64,
}

impl AuditReader {
    pub const DEFAULT_BATCH_SIZE: usize = 100;
    pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

    pub fn open(
        source_path: impl AsRef<Path>,
        batch_size: usize,
        poll_interval: Duration,
        from_id: i64,
    ) -> Result<Self, ReadError> {
        let path = source_path.as_ref();

        // The mark connection doubles as the schema guard: a source that has
        // never seen a capture connection still gets a readable audit table.
        let mark_conn = Connection::open(path).map_err(|source| ReadError::Open {
            path: path.display().to_string(),
            source,
        })?;
        mark_conn.busy_timeout(Duration::from_secs(5))?;
        mark_conn.execute_batch(&audit_schema_sql(AUDIT_TABLE))?;

        let read_conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|source| ReadError::Open {
            path: path.display().to_string(),
            source,
        })?;
        read_conn.busy_timeout(Duration::from_secs(5))?;

        Ok(AuditReader {
            read_conn,
            mark_conn,
            batch_size: batch_size.max(1),
            poll_interval,
            last_audit_id: from_id,
        })
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    pub fn last_audit_id(&self) -> i64 {
        self.last_audit_id
    }

    /// Fetch the next batch of unconsumed events in strictly ascending id
    /// order. Empty when the reader has caught up; the caller decides how
    /// long to wait before polling again.
    pub fn fetch_batch(&mut self) -> Result<Vec<ChangeEvent>, ReadError> {
        let mut stmt = self.read_conn.prepare_cached(&format!(
            "SELECT id, table_name, operation, row_id, before_data, after_data, \
                    created_at, retry_count \
             FROM {AUDIT_TABLE} \
             WHERE id > ?1 AND consumed_at IS NULL \
             ORDER BY id \
             LIMIT ?2"
        ))?;

        let mut rows = stmt.query(rusqlite::params![self.last_audit_id, self.batch_size as i64])?;
        let mut events = Vec::new();

        while let Some(row) = rows.next()? {
            let id: i64 = row.get(0)?;
            let table_name: String = row.get(1)?;
            let operation: String = row.get(2)?;

            let Ok(operation) = operation.parse::<Operation>() else {
                // Unreachable under the CHECK constraint; skip rather than
                // wedge the stream on a hand-edited row.
                warn!(id, operation = %operation, "audit row carries unknown operation, skipping");
                self.last_audit_id = self.last_audit_id.max(id);
                continue;
            };

            let record = AuditRecord {
                id,
                table_name,
                operation,
                row_id: row.get(3)?,
                before_data: parse_payload(id, "before_data", row.get::<_, Option<String>>(4)?),
                after_data: parse_payload(id, "after_data", row.get::<_, Option<String>>(5)?),
                created_at: row
                    .get::<_, Option<String>>(6)?
                    .as_deref()
                    .and_then(checkpoint::time::parse_utc)
                    .unwrap_or_else(Utc::now),
                consumed_at: None,
                retry_count: row.get(7)?,
            };

            self.last_audit_id = self.last_audit_id.max(record.id);
            events.push(record.into_event());
        }

        if !events.is_empty() {
            debug!(count = events.len(), last_id = self.last_audit_id, "audit batch fetched");
        }
        Ok(events)
    }

    /// Mark rows consumed in one transaction. Best-effort cleanup: the
    /// per-target cursors already prevent re-application, so the caller may
    /// treat a failure here as non-fatal.
    pub fn mark_consumed(&mut self, audit_ids: &[i64]) -> Result<(), ReadError> {
        if audit_ids.is_empty() {
            return Ok(());
        }

        let placeholders = vec!["?"; audit_ids.len()].join(", ");
        let sql = format!(
            "UPDATE {AUDIT_TABLE} SET consumed_at = ? WHERE id IN ({placeholders})"
        );

        let mut params: Vec<rusqlite::types::Value> =
            vec![rusqlite::types::Value::Text(Utc::now().to_rfc3339())];
        params.extend(audit_ids.iter().map(|id| rusqlite::types::Value::Integer(*id)));

        let tx = self.mark_conn.unchecked_transaction()?;
        tx.execute(&sql, params_from_iter(params.iter()))?;
        tx.commit()?;

        debug!(count = audit_ids.len(), "audit rows marked consumed");
        Ok(())
    }

    /// Best-effort table statistics; failures log and report zeros so the
    /// status surface stays available.
    pub fn stats(&self) -> AuditStats {
        match self.try_stats() {
            Ok(stats) => stats,
            Err(err) => {
                warn!(error = %err, "failed to collect audit stats");
                AuditStats {
                    last_read_id: self.last_audit_id,
                    ..AuditStats::default()
                }
            }
        }
    }

    fn try_stats(&self) -> Result<AuditStats, ReadError> {
        let (total, unconsumed, max_id): (u64, u64, i64) = self.read_conn.query_row(
            &format!(
                "SELECT COUNT(*), \
                        COUNT(*) FILTER (WHERE consumed_at IS NULL), \
                        COALESCE(MAX(id), 0) \
                 FROM {AUDIT_TABLE}"
            ),
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;

        Ok(AuditStats {
            total,
            unconsumed,
            max_id,
            last_read_id: self.last_audit_id,
            pending: (max_id - self.last_audit_id).max(0) as u64,
        })
    }
}

fn parse_payload(id: i64, column: &str, raw: Option<String>) -> Option<Row> {
    let raw = raw?;
    match serde_json::from_str::<serde_json::Value>(&raw) {
        Ok(serde_json::Value::Object(map)) => Some(map),
        Ok(_) | Err(_) => {
            // Malformed payload degrades this row to a NULL image instead of
            // failing the whole batch.
            warn!(id, column, "audit payload is not valid JSON, treating as NULL");
            None
        }
    }
}
