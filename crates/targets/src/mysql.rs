use crate::error::WriteError;
use crate::retry::RetryRunner;
use crate::writer::{TargetWriter, DEFAULT_KEY_COLUMN};
use async_trait::async_trait;
use engine_config::{MysqlConnection, RetryPolicy, TargetKind};
use model::{Row, RowKey};
use mysql_async::prelude::Queryable;
use mysql_async::{OptsBuilder, Params, Pool, PoolConstraints, PoolOpts, TxOpts, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// MySQL replication target.
///
/// Upserts use `INSERT ... ON DUPLICATE KEY UPDATE`; batches run through
/// driver batching inside one transaction, falling back to per-row execution
/// when the batched form fails.
pub struct MySqlWriter {
    name: String,
    config: MysqlConnection,
    batch_size: usize,
    retry: RetryRunner,
    key_columns: HashMap<String, String>,
    pool: Mutex<Option<Pool>>,
    connected: AtomicBool,
}

impl MySqlWriter {
    pub fn new(
        name: &str,
        config: MysqlConnection,
        batch_size: usize,
        retry_policy: RetryPolicy,
        key_columns: HashMap<String, String>,
    ) -> Self {
        MySqlWriter {
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

    async fn pool(&self) -> Result<Pool, WriteError> {
        self.pool
            .lock()
            .await
            .clone()
            .ok_or_else(|| WriteError::NotConnected(self.name.clone()))
    }

    /// One transactional chunk: batched execution first, per-row fallback on
    /// failure of the batched form.
    async fn apply_chunk(
        &self,
        pool: &Pool,
        sql: &str,
        columns: &[String],
        chunk: &[Row],
    ) -> Result<(), WriteError> {
        let params: Vec<Params> = chunk.iter().map(|row| row_params(columns, row)).collect();

        let mut conn = pool.get_conn().await?;
        let mut tx = conn.start_transaction(TxOpts::default()).await?;

        match tx.exec_batch(sql, params.clone()).await {
            Ok(()) => {
                tx.commit().await?;
            }
            Err(err) => {
                warn!(
                    target = %self.name,
                    error = %err,
                    "batched upsert failed, retrying row by row"
                );
                tx.rollback().await?;

                let mut tx = conn.start_transaction(TxOpts::default()).await?;
                for row_params in params {
                    tx.exec_drop(sql, row_params).await?;
                }
                tx.commit().await?;
            }
        }

        Ok(())
    }
}

#[async_trait]
impl TargetWriter for MySqlWriter {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> TargetKind {
        TargetKind::Mysql
    }

    async fn connect(&self) -> Result<(), WriteError> {
        let mut guard = self.pool.lock().await;
        if guard.is_some() {
            return Ok(());
        }

        let constraints =
            PoolConstraints::new(1, self.config.pool_size.max(1)).unwrap_or_default();
        let opts = OptsBuilder::default()
            .ip_or_hostname(self.config.host.clone())
            .tcp_port(self.config.port)
            .user(Some(self.config.username.clone()))
            .pass(Some(self.config.password.clone()))
            .db_name(Some(self.config.database.clone()))
            .pool_opts(PoolOpts::default().with_constraints(constraints));

        let pool = Pool::new(opts);

        // Probe once so an unreachable target fails at startup, not mid-batch.
        let mut conn = pool.get_conn().await?;
        conn.query_drop("SELECT 1").await?;
        drop(conn);

        *guard = Some(pool);
        self.connected.store(true, Ordering::SeqCst);
        info!(
            target = %self.name,
            host = %self.config.host,
            database = %self.config.database,
            "mysql target connected"
        );
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), WriteError> {
        if let Some(pool) = self.pool.lock().await.take() {
            pool.disconnect().await?;
        }
        self.connected.store(false, Ordering::SeqCst);
        info!(target = %self.name, "mysql target disconnected");
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
        let sql = build_upsert_sql(table, &columns);

        for chunk in rows.chunks(self.batch_size) {
            self.retry
                .run(|| self.apply_chunk(&pool, &sql, &columns, chunk))
                .await?;
        }

        debug!(target = %self.name, table, rows = rows.len(), "mysql batch upsert applied");
        Ok(())
    }

    async fn delete(&self, table: &str, key: &RowKey) -> Result<(), WriteError> {
        let pool = self.pool().await?;
        let sql = format!(
            "DELETE FROM {} WHERE {} = ?",
            quote_ident(table),
            quote_ident(self.key_column(table))
        );
        let params = Params::Positional(vec![row_key_value(key)]);

        self.retry
            .run(|| {
                let sql = sql.clone();
                let params = params.clone();
                let pool = pool.clone();
                async move {
                    let mut conn = pool.get_conn().await?;
                    conn.exec_drop(sql.as_str(), params).await?;
                    Ok(())
                }
            })
            .await
    }

    async fn ping(&self) -> Result<(), WriteError> {
        let pool = self.pool().await?;
        let mut conn = pool.get_conn().await?;
        conn.query_drop("SELECT 1").await?;
        Ok(())
    }
}

fn quote_ident(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

/// `INSERT ... ON DUPLICATE KEY UPDATE col = VALUES(col)` over the row's
/// columns; a duplicate key therefore never errors.
fn build_upsert_sql(table: &str, columns: &[String]) -> String {
    let column_list = columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ");
    let placeholders = vec!["?"; columns.len()].join(", ");
    let updates = columns
        .iter()
        .map(|c| format!("{0} = VALUES({0})", quote_ident(c)))
        .collect::<Vec<_>>()
        .join(", ");

    format!(
        "INSERT INTO {} ({column_list}) VALUES ({placeholders}) ON DUPLICATE KEY UPDATE {updates}",
        quote_ident(table)
    )
}

fn row_params(columns: &[String], row: &Row) -> Params {
    Params::Positional(
        columns
            .iter()
            .map(|column| row.get(column).map(json_value).unwrap_or(Value::NULL))
            .collect(),
    )
}

fn json_value(value: &serde_json::Value) -> Value {
    match value {
        serde_json::Value::Null => Value::NULL,
        serde_json::Value::Bool(b) => Value::Int(i64::from(*b)),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::Int(i)
            } else if let Some(u) = n.as_u64() {
                Value::UInt(u)
            } else {
                Value::Double(n.as_f64().unwrap_or(0.0))
            }
        }
        serde_json::Value::String(s) => Value::Bytes(s.clone().into_bytes()),
        other => Value::Bytes(other.to_string().into_bytes()),
    }
}

fn row_key_value(key: &RowKey) -> Value {
    match key {
        RowKey::Int(n) => Value::Int(*n),
        RowKey::Text(s) => Value::Bytes(s.clone().into_bytes()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn upsert_sql_updates_every_column() {
        let sql = build_upsert_sql("users", &["id".into(), "name".into()]);
        assert_eq!(
            sql,
            "INSERT INTO `users` (`id`, `name`) VALUES (?, ?) \
             ON DUPLICATE KEY UPDATE `id` = VALUES(`id`), `name` = VALUES(`name`)"
        );
    }

    #[test]
    fn identifiers_with_backticks_are_escaped() {
        assert_eq!(quote_ident("odd`name"), "`odd``name`");
    }

    #[test]
    fn json_values_map_to_driver_values() {
        assert_eq!(json_value(&json!(null)), Value::NULL);
        assert_eq!(json_value(&json!(true)), Value::Int(1));
        assert_eq!(json_value(&json!(42)), Value::Int(42));
        assert_eq!(json_value(&json!(1.5)), Value::Double(1.5));
        assert_eq!(
            json_value(&json!("hi")),
            Value::Bytes("hi".as_bytes().to_vec())
        );
    }

    #[test]
    fn missing_columns_bind_null() {
        let columns = vec!["id".to_string(), "name".to_string()];
        let mut row = Row::new();
        row.insert("id".into(), json!(1));

        match row_params(&columns, &row) {
            Params::Positional(values) => {
                assert_eq!(values, vec![Value::Int(1), Value::NULL]);
            }
            other => panic!("unexpected params: {other:?}"),
        }
    }
}
