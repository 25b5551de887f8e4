/// Name of the on-source audit table.
pub const AUDIT_TABLE: &str = "_cdc_audit_log";

/// DDL for the audit table and its two indices. Idempotent; executed by the
/// capture connection on attach. The table lives inside the source database
/// so audit rows share a transaction with the business writes they record.
pub fn audit_schema_sql(audit_table: &str) -> String {
    format!(
        r#"
CREATE TABLE IF NOT EXISTS {audit_table} (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    table_name TEXT NOT NULL,
    operation TEXT NOT NULL CHECK(operation IN ('INSERT', 'UPDATE', 'DELETE')),
    row_id TEXT,
    before_data TEXT,
    after_data TEXT,
    created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
    consumed_at TIMESTAMP,
    retry_count INTEGER DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_{audit_table}_unconsumed
    ON {audit_table}(id) WHERE consumed_at IS NULL;
CREATE INDEX IF NOT EXISTS idx_{audit_table}_table
    ON {audit_table}(table_name, created_at);
"#
    )
}
