use crate::error::WriteError;
use crate::retry::RetryRunner;
use crate::writer::{TargetWriter, DEFAULT_KEY_COLUMN};
use async_trait::async_trait;
use engine_config::{OracleConnection, RetryPolicy, TargetKind};
use model::{Row, RowKey};
use oracle::pool::{Pool, PoolBuilder};
use oracle::sql_type::ToSql;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task;
use tracing::{debug, info};

/// Oracle replication target.
///
/// Upserts use `MERGE INTO ... USING (SELECT ... FROM dual)`. The driver is
/// blocking, so every call runs on the blocking thread pool. Values are bound
/// as strings; Oracle coerces them in DML binds.
pub struct OracleWriter {
    name: String,
    config: OracleConnection,
    batch_size: usize,
    retry: RetryRunner,
    key_columns: HashMap<String, String>,
    pool: Mutex<Option<Arc<Pool>>>,
    connected: AtomicBool,
}

impl OracleWriter {
    pub fn new(
        name: &str,
        config: OracleConnection,
        batch_size: usize,
        retry_policy: RetryPolicy,
        key_columns: HashMap<String, String>,
    ) -> Self {
        OracleWriter {
            name: name.to_string(),
            config,
            batch_size,
            retry: RetryRunner::new(retry_policy),
            key_columns,
            pool: Mutex::new(None),
            connected: AtomicBool::new(false),
        }
    }

    fn key_column(&self, table: &str) -> &str {
        self.key_columns
            .get(table)
            .map(String::as_str)
            .unwrap_or(DEFAULT_KEY_COLUMN)
    }

    async fn pool(&self) -> Result<Arc<Pool>, WriteError> {
        self.pool
            .lock()
            .await
            .clone()
            .ok_or_else(|| WriteError::NotConnected(self.name.clone()))
    }

    /// MERGE a chunk of rows on the blocking pool, committing every
    /// `batch_size` statements.
    async fn apply_chunk(
        &self,
        pool: Arc<Pool>,
        sql: String,
        binds: Vec<Vec<(String, Option<String>)>>,
    ) -> Result<(), WriteError> {
        let commit_every = self.batch_size;

        task::spawn_blocking(move || -> Result<(), WriteError> {
            let conn = pool.get().map_err(WriteError::Oracle)?;

            for (index, row_binds) in binds.iter().enumerate() {
                let params: Vec<(&str, &dyn ToSql)> = row_binds
                    .iter()
                    .map(|(name, value)| (name.as_str(), value as &dyn ToSql))
                    .collect();
                conn.execute_named(&sql, &params)
                    .map_err(WriteError::Oracle)?;

                if (index + 1) % commit_every == 0 {
                    conn.commit().map_err(WriteError::Oracle)?;
                }
            }

            conn.commit().map_err(WriteError::Oracle)?;
            Ok(())
        })
        .await?
    }
}

#[async_trait]
impl TargetWriter for OracleWriter {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> TargetKind {
        TargetKind::Oracle
    }

    async fn connect(&self) -> Result<(), WriteError> {
        let mut guard = self.pool.lock().await;
        if guard.is_some() {
            return Ok(());
        }

        let config = self.config.clone();
        let pool = task::spawn_blocking(move || -> Result<Pool, oracle::Error> {
            let connect_string =
                format!("//{}:{}/{}", config.host, config.port, config.service_name);
            let pool = PoolBuilder::new(config.username, config.password, connect_string)
                .min_connections(1)
                .max_connections(config.pool_size.max(1) as u32)
                .build()?;

            // Probe once so an unreachable target fails at startup.
            let conn = pool.get()?;
            conn.query_row_as::<i64>("SELECT 1 FROM dual", &[])?;
            Ok(pool)
        })
        .await??;

        *guard = Some(Arc::new(pool));
        self.connected.store(true, Ordering::SeqCst);
        info!(
            target = %self.name,
            host = %self.config.host,
            service = %self.config.service_name,
            "oracle target connected"
        );
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), WriteError> {
        // Dropping the pool closes its sessions.
        self.pool.lock().await.take();
        self.connected.store(false, Ordering::SeqCst);
        info!(target = %self.name, "oracle target disconnected");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn upsert(&self, table: &str, row: &Row) -> Result<(), WriteError> {
        self.batch_upsert(table, std::slice::from_ref(row)).await
    }

    async fn batch_upsert(&self, table: &str, rows: &[Row]) -> Result<(), WriteError> {
        if rows.is_empty() {
            return Ok(());
        }

        let pool = self.pool().await?;
        let columns: Vec<String> = rows[0].keys().cloned().collect();
        let sql = build_merge_sql(table, &columns, self.key_column(table));

        for chunk in rows.chunks(self.batch_size) {
            let binds: Vec<Vec<(String, Option<String>)>> = chunk
                .iter()
                .map(|row| row_binds(&columns, row))
                .collect();

            self.retry
                .run(|| self.apply_chunk(pool.clone(), sql.clone(), binds.clone()))
                .await?;
        }

        debug!(target = %self.name, table, rows = rows.len(), "oracle batch upsert applied");
        Ok(())
    }

    async fn delete(&self, table: &str, key: &RowKey) -> Result<(), WriteError> {
        let pool = self.pool().await?;
        let sql = format!("DELETE FROM {} WHERE {} = :1", table, self.key_column(table));
        let key = key.to_string();

        self.retry
            .run(|| {
                let pool = pool.clone();
                let sql = sql.clone();
                let key = key.clone();
                async move {
                    task::spawn_blocking(move || -> Result<(), WriteError> {
                        let conn = pool.get().map_err(WriteError::Oracle)?;
                        conn.execute(&sql, &[&key]).map_err(WriteError::Oracle)?;
                        conn.commit().map_err(WriteError::Oracle)?;
                        Ok(())
                    })
                    .await?
                }
            })
            .await
    }

    async fn ping(&self) -> Result<(), WriteError> {
        let pool = self.pool().await?;
        task::spawn_blocking(move || -> Result<(), WriteError> {
            let conn = pool.get().map_err(WriteError::Oracle)?;
            conn.query_row_as::<i64>("SELECT 1 FROM dual", &[])
                .map_err(WriteError::Oracle)?;
            Ok(())
        })
        .await?
    }
}

/// `MERGE INTO t ... USING (SELECT :c1 c1, ... FROM dual)` keyed on the
/// primary-key column. The update clause never touches the key; when no
/// non-key columns exist a `t.pk = t.pk` self-update satisfies the syntax.
fn build_merge_sql(table: &str, columns: &[String], key_column: &str) -> String {
    let using = columns
        .iter()
        .map(|c| format!(":{c} {c}"))
        .collect::<Vec<_>>()
        .join(", ");

    let update_columns: Vec<&String> = columns.iter().filter(|c| *c != key_column).collect();
    let update_clause = if update_columns.is_empty() {
        format!("t.{key_column} = t.{key_column}")
    } else {
        update_columns
            .iter()
            .map(|c| format!("t.{c} = s.{c}"))
            .collect::<Vec<_>>()
            .join(", ")
    };

    let insert_columns = columns.join(", ");
    let insert_values = columns
        .iter()
        .map(|c| format!("s.{c}"))
        .collect::<Vec<_>>()
        .join(", ");

    format!(
        "MERGE INTO {table} t \
         USING (SELECT {using} FROM dual) s \
         ON (t.{key_column} = s.{key_column}) \
         WHEN MATCHED THEN UPDATE SET {update_clause} \
         WHEN NOT MATCHED THEN INSERT ({insert_columns}) VALUES ({insert_values})"
    )
}

/// Named binds for one row, stringified. NULL stays NULL.
fn row_binds(columns: &[String], row: &Row) -> Vec<(String, Option<String>)> {
    columns
        .iter()
        .map(|column| {
            let value = row.get(column).and_then(json_to_bind);
            (column.clone(), value)
        })
        .collect()
}

fn json_to_bind(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::Null => None,
        serde_json::Value::Bool(b) => Some(if *b { "1".into() } else { "0".into() }),
        serde_json::Value::Number(n) => Some(n.to_string()),
        serde_json::Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn merge_sql_excludes_key_from_update_clause() {
        let sql = build_merge_sql("users", &["id".into(), "name".into()], "id");
        assert_eq!(
            sql,
            "MERGE INTO users t \
             USING (SELECT :id id, :name name FROM dual) s \
             ON (t.id = s.id) \
             WHEN MATCHED THEN UPDATE SET t.name = s.name \
             WHEN NOT MATCHED THEN INSERT (id, name) VALUES (s.id, s.name)"
        );
    }

    #[test]
    fn merge_sql_with_only_key_columns_emits_self_update() {
        let sql = build_merge_sql("links", &["id".into()], "id");
        assert!(sql.contains("WHEN MATCHED THEN UPDATE SET t.id = t.id"));
    }

    #[test]
    fn binds_stringify_values_and_keep_nulls() {
        let columns = vec!["id".to_string(), "name".to_string(), "active".to_string()];
        let mut row = Row::new();
        row.insert("id".into(), json!(7));
        row.insert("name".into(), json!(null));
        row.insert("active".into(), json!(true));

        let binds = row_binds(&columns, &row);
        assert_eq!(binds[0], ("id".into(), Some("7".into())));
        assert_eq!(binds[1], ("name".into(), None));
        assert_eq!(binds[2], ("active".into(), Some("1".into())));
    }
}
