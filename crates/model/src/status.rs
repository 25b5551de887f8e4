use crate::event::Operation;
use crate::position::SyncState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Per-table event counters reported by the status surface.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableStats {
    pub events: u64,
    pub inserts: u64,
    pub updates: u64,
    pub deletes: u64,
}

impl TableStats {
    pub fn record(&mut self, operation: Operation) {
        self.events += 1;
        match operation {
            Operation::Insert => self.inserts += 1,
            Operation::Update => self.updates += 1,
            Operation::Delete => self.deletes += 1,
        }
    }
}

/// Runtime snapshot returned by the engine's `get_status()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncStatus {
    pub state: SyncState,
    pub source_db: String,
    pub targets: Vec<String>,
    pub total_events: u64,
    pub events_per_second: f64,
    pub lag_seconds: f64,
    pub table_stats: HashMap<String, TableStats>,
    pub last_error: Option<String>,
    pub last_error_at: Option<DateTime<Utc>>,
}

impl SyncStatus {
    pub fn new(source_db: &str, targets: Vec<String>) -> Self {
        SyncStatus {
            state: SyncState::Idle,
            source_db: source_db.to_string(),
            targets,
            total_events: 0,
            events_per_second: 0.0,
            lag_seconds: 0.0,
            table_stats: HashMap::new(),
            last_error: None,
            last_error_at: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.state == SyncState::Running
    }

    pub fn record_event(&mut self, table: &str, operation: Operation) {
        self.total_events += 1;
        self.table_stats
            .entry(table.to_string())
            .or_default()
            .record(operation);
    }

    pub fn record_error(&mut self, error: impl Into<String>) {
        self.last_error = Some(error.into());
        self.last_error_at = Some(Utc::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_event_updates_table_stats() {
        let mut status = SyncStatus::new("/data/app.db", vec!["mysql_prod".into()]);
        status.record_event("users", Operation::Insert);
        status.record_event("users", Operation::Update);
        status.record_event("orders", Operation::Delete);

        assert_eq!(status.total_events, 3);
        let users = &status.table_stats["users"];
        assert_eq!((users.events, users.inserts, users.updates), (2, 1, 1));
        assert_eq!(status.table_stats["orders"].deletes, 1);
    }

    #[test]
    fn record_error_keeps_message_and_time() {
        let mut status = SyncStatus::new("/data/app.db", vec![]);
        status.record_error("target unreachable");
        assert_eq!(status.last_error.as_deref(), Some("target unreachable"));
        assert!(status.last_error_at.is_some());
    }
}
