use crate::classifier;
use crate::error::CaptureError;
use crate::schema::{audit_schema_sql, AUDIT_TABLE};
use chrono::Utc;
use model::{Operation, Row};
use rusqlite::types::{Value, ValueRef};
use rusqlite::{params_from_iter, Connection};
use std::collections::HashSet;
use std::path::Path;
use tracing::warn;

/// Write-path wrapper around a SQLite connection.
///
/// Intercepts INSERT/UPDATE/DELETE statements and records an audit row in the
/// same transaction as the business write, so `commit()` and `rollback()`
/// atomically cover both. Statements against tables outside the allow-list
/// (empty allow-list = every table) pass through untouched.
pub struct CaptureConnection {
    conn: Connection,
    audit_table: String,
    enabled_tables: HashSet<String>,
    in_txn: bool,
}

impl CaptureConnection {
    /// Open a source database, switch it to WAL journaling, and make sure the
    /// audit schema exists.
    pub fn open(path: impl AsRef<Path>, enabled_tables: &[String]) -> Result<Self, CaptureError> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        let _mode: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
        Self::attach(conn, enabled_tables)
    }

    /// Wrap an existing connection (used by tests with in-memory databases).
    pub fn attach(conn: Connection, enabled_tables: &[String]) -> Result<Self, CaptureError> {
        conn.execute_batch(&audit_schema_sql(AUDIT_TABLE))
            .map_err(CaptureError::Schema)?;

        Ok(CaptureConnection {
            conn,
            audit_table: AUDIT_TABLE.to_string(),
            enabled_tables: enabled_tables.iter().cloned().collect(),
            in_txn: false,
        })
    }

    /// Execute one statement. Audited writes additionally record their audit
    /// row; everything runs inside the connection's current transaction.
    pub fn execute(&mut self, sql: &str, params: &[Value]) -> Result<usize, CaptureError> {
        match classifier::classify(sql) {
            Some((operation, table)) if self.should_audit(&table) => {
                self.execute_with_audit(sql, params, operation, &table)
            }
            Some(_) => {
                // Non-audited write: still transactional so commit/rollback
                // semantics match the audited path.
                self.begin_if_needed()?;
                Ok(self.conn.execute(sql, params_from_iter(params.iter()))?)
            }
            None => Ok(self.conn.execute(sql, params_from_iter(params.iter()))?),
        }
    }

    /// Execute the same statement once per parameter set, auditing each row.
    pub fn execute_many(
        &mut self,
        sql: &str,
        param_sets: &[Vec<Value>],
    ) -> Result<usize, CaptureError> {
        let mut affected = 0;
        for params in param_sets {
            affected += self.execute(sql, params)?;
        }
        Ok(affected)
    }

    pub fn commit(&mut self) -> Result<(), CaptureError> {
        if self.in_txn {
            self.conn.execute_batch("COMMIT")?;
            self.in_txn = false;
        }
        Ok(())
    }

    pub fn rollback(&mut self) -> Result<(), CaptureError> {
        if self.in_txn {
            self.conn.execute_batch("ROLLBACK")?;
            self.in_txn = false;
        }
        Ok(())
    }

    /// Run `f` inside a transaction scope: commit on success, roll back on
    /// error.
    pub fn with_transaction<T>(
        &mut self,
        f: impl FnOnce(&mut Self) -> Result<T, CaptureError>,
    ) -> Result<T, CaptureError> {
        match f(self) {
            Ok(value) => {
                self.commit()?;
                Ok(value)
            }
            Err(err) => {
                self.rollback()?;
                Err(err)
            }
        }
    }

    pub fn close(mut self) -> Result<(), CaptureError> {
        self.rollback()?;
        self.conn.close().map_err(|(_, err)| CaptureError::Close(err))
    }

    /// Read-only access to the wrapped connection.
    pub fn raw(&self) -> &Connection {
        &self.conn
    }

    fn should_audit(&self, table: &str) -> bool {
        self.enabled_tables.is_empty() || self.enabled_tables.contains(table)
    }

    fn begin_if_needed(&mut self) -> Result<(), CaptureError> {
        if !self.in_txn {
            self.conn.execute_batch("BEGIN")?;
            self.in_txn = true;
        }
        Ok(())
    }

    fn execute_with_audit(
        &mut self,
        sql: &str,
        params: &[Value],
        operation: Operation,
        table: &str,
    ) -> Result<usize, CaptureError> {
        self.begin_if_needed()?;

        let (before, before_rowid) = match operation {
            Operation::Update | Operation::Delete => self.fetch_before_image(sql, params, table),
            Operation::Insert => (None, None),
        };

        let affected = self.conn.execute(sql, params_from_iter(params.iter()))?;

        let (row_id, after) = match operation {
            Operation::Insert => {
                let rowid = self.conn.last_insert_rowid();
                if rowid == 0 {
                    (None, None)
                } else {
                    let after = self.fetch_row_by_rowid(table, rowid);
                    (Some(rowid.to_string()), after)
                }
            }
            Operation::Update => {
                let after = before_rowid.and_then(|rowid| self.fetch_row_by_rowid(table, rowid));
                (before_rowid.map(|r| r.to_string()), after)
            }
            Operation::Delete => (before_rowid.map(|r| r.to_string()), None),
        };

        self.insert_audit_row(table, operation, row_id.as_deref(), &before, &after)?;

        Ok(affected)
    }

    /// Fetch the pre-change image of the first row the statement's WHERE
    /// clause matches, along with its physical rowid. Any failure here is a
    /// warning: a malformed WHERE must not block the business write.
    fn fetch_before_image(
        &self,
        sql: &str,
        params: &[Value],
        table: &str,
    ) -> (Option<Row>, Option<i64>) {
        let Some(where_clause) = classifier::extract_where_clause(sql) else {
            return (None, None);
        };

        let placeholders = classifier::count_placeholders(&where_clause);
        if placeholders > params.len() {
            warn!(table, "before-image skipped: WHERE clause binds more parameters than supplied");
            return (None, None);
        }
        // The WHERE placeholders are the trailing ones: for UPDATE the SET
        // list binds first.
        let bound = &params[params.len() - placeholders..];

        let select = format!(
            "SELECT rowid, * FROM {} WHERE {} LIMIT 1",
            quote_ident(table),
            where_clause
        );

        match self.query_single_row(&select, bound) {
            Ok(found) => match found {
                Some((rowid, row)) => (Some(row), Some(rowid)),
                None => (None, None),
            },
            Err(err) => {
                warn!(table, error = %err, "failed to fetch before image");
                (None, None)
            }
        }
    }

    fn fetch_row_by_rowid(&self, table: &str, rowid: i64) -> Option<Row> {
        let select = format!(
            "SELECT rowid, * FROM {} WHERE rowid = ? LIMIT 1",
            quote_ident(table)
        );
        match self.query_single_row(&select, &[Value::Integer(rowid)]) {
            Ok(found) => found.map(|(_, row)| row),
            Err(err) => {
                warn!(table, rowid, error = %err, "failed to fetch after image");
                None
            }
        }
    }

    /// Run a `SELECT rowid, *` query and convert the first row, if any, into
    /// `(rowid, image)`. The leading rowid column is not part of the image.
    fn query_single_row(
        &self,
        select: &str,
        params: &[Value],
    ) -> Result<Option<(i64, Row)>, rusqlite::Error> {
        let mut stmt = self.conn.prepare(select)?;
        let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();

        let mut rows = stmt.query(params_from_iter(params.iter()))?;
        let Some(row) = rows.next()? else {
            return Ok(None);
        };

        let rowid: i64 = row.get(0)?;
        let mut image = Row::new();
        for (idx, name) in columns.iter().enumerate().skip(1) {
            image.insert(name.clone(), value_ref_to_json(row.get_ref(idx)?));
        }
        Ok(Some((rowid, image)))
    }

    fn insert_audit_row(
        &mut self,
        table: &str,
        operation: Operation,
        row_id: Option<&str>,
        before: &Option<Row>,
        after: &Option<Row>,
    ) -> Result<(), CaptureError> {
        let insert = format!(
            "INSERT INTO {} (table_name, operation, row_id, before_data, after_data, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            self.audit_table
        );

        self.conn
            .execute(
                &insert,
                rusqlite::params![
                    table,
                    operation.as_str(),
                    row_id,
                    before.as_ref().map(row_to_json_text),
                    after.as_ref().map(row_to_json_text),
                    Utc::now().to_rfc3339(),
                ],
            )
            .map_err(|source| CaptureError::AuditInsert {
                table: table.to_string(),
                operation: operation.to_string(),
                source,
            })?;

        Ok(())
    }
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn row_to_json_text(row: &Row) -> String {
    serde_json::Value::Object(row.clone()).to_string()
}

fn value_ref_to_json(value: ValueRef<'_>) -> serde_json::Value {
    match value {
        ValueRef::Null => serde_json::Value::Null,
        ValueRef::Integer(i) => serde_json::Value::from(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        ValueRef::Text(t) => serde_json::Value::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => serde_json::Value::String(String::from_utf8_lossy(b).into_owned()),
    }
}
