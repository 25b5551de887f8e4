use crate::ModelError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A captured row image: column name to JSON value.
pub type Row = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Operation {
    Insert,
    Update,
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Insert => "INSERT",
            Operation::Update => "UPDATE",
            Operation::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "INSERT" => Ok(Operation::Insert),
            "UPDATE" => Ok(Operation::Update),
            "DELETE" => Ok(Operation::Delete),
            other => Err(ModelError::UnknownOperation(other.to_string())),
        }
    }
}

/// Primary-key value of the changed row. Audit rows persist it as text;
/// numeric keys are recovered on read.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RowKey {
    Int(i64),
    Text(String),
}

impl RowKey {
    /// Parse a stored key, preferring the integer form.
    pub fn parse(raw: &str) -> Self {
        match raw.parse::<i64>() {
            Ok(n) => RowKey::Int(n),
            Err(_) => RowKey::Text(raw.to_string()),
        }
    }
}

impl fmt::Display for RowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RowKey::Int(n) => write!(f, "{n}"),
            RowKey::Text(s) => f.write_str(s),
        }
    }
}

impl From<i64> for RowKey {
    fn from(n: i64) -> Self {
        RowKey::Int(n)
    }
}

impl From<&str> for RowKey {
    fn from(s: &str) -> Self {
        RowKey::Text(s.to_string())
    }
}

/// A single captured row change, the unit flowing from the audit log to the
/// target writers.
///
/// Invariants: INSERT carries only `after`, DELETE only `before`, UPDATE both.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub audit_id: i64,
    pub timestamp: DateTime<Utc>,
    pub operation: Operation,
    pub table_name: String,
    pub row_id: RowKey,
    pub before: Option<Row>,
    pub after: Option<Row>,
}

impl ChangeEvent {
    /// Stable external identifier: `"{audit_id}:{table}:{row_key}"`.
    pub fn event_id(&self) -> String {
        format!("{}:{}:{}", self.audit_id, self.table_name, self.row_id)
    }

    /// Check the operation/image invariants.
    pub fn validate(&self) -> Result<(), ModelError> {
        match self.operation {
            Operation::Insert if self.after.is_none() => {
                Err(ModelError::InsertWithoutAfter(self.event_id()))
            }
            Operation::Delete if self.before.is_none() => {
                Err(ModelError::DeleteWithoutBefore(self.event_id()))
            }
            Operation::Update if self.before.is_none() || self.after.is_none() => {
                Err(ModelError::UpdateWithoutImages(self.event_id()))
            }
            _ => Ok(()),
        }
    }

    pub fn is_delete(&self) -> bool {
        self.operation == Operation::Delete
    }
}
