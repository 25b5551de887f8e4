use crate::event::{ChangeEvent, Operation, Row, RowKey};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One row of the on-source audit table (`_cdc_audit_log`).
///
/// Append-only except for `consumed_at` and `retry_count`, which the reader
/// mutates when marking rows consumed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: i64,
    pub table_name: String,
    pub operation: Operation,
    pub row_id: Option<String>,
    pub before_data: Option<Row>,
    pub after_data: Option<Row>,
    pub created_at: DateTime<Utc>,
    pub consumed_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
}

impl AuditRecord {
    pub fn is_consumed(&self) -> bool {
        self.consumed_at.is_some()
    }

    /// Convert a persisted audit row into the in-flight event form.
    pub fn into_event(self) -> ChangeEvent {
        let row_id = match self.row_id.as_deref() {
            Some(raw) => RowKey::parse(raw),
            None => RowKey::Text(String::new()),
        };

        ChangeEvent {
            audit_id: self.id,
            timestamp: self.created_at,
            operation: self.operation,
            table_name: self.table_name,
            row_id,
            before: self.before_data,
            after: self.after_data,
        }
    }

    pub fn from_event(event: &ChangeEvent) -> Self {
        AuditRecord {
            id: event.audit_id,
            table_name: event.table_name.clone(),
            operation: event.operation,
            row_id: Some(event.row_id.to_string()),
            before_data: event.before.clone(),
            after_data: event.after.clone(),
            created_at: event.timestamp,
            consumed_at: None,
            retry_count: 0,
        }
    }
}
