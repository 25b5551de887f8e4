use crate::event::RowKey;
use crate::ModelError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
    Idle,
    Running,
    Paused,
    Error,
    Completed,
}

impl SyncState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncState::Idle => "idle",
            SyncState::Running => "running",
            SyncState::Paused => "paused",
            SyncState::Error => "error",
            SyncState::Completed => "completed",
        }
    }
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncState {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(SyncState::Idle),
            "running" => Ok(SyncState::Running),
            "paused" => Ok(SyncState::Paused),
            "error" => Ok(SyncState::Error),
            "completed" => Ok(SyncState::Completed),
            other => Err(ModelError::UnknownState(other.to_string())),
        }
    }
}

/// Incremental cursor for one (source, target) pair: the inclusive
/// high-water-mark of audit ids successfully applied to that target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncPosition {
    pub source_db_path: String,
    pub target_name: String,
    pub last_audit_id: i64,
    pub total_events: u64,
    pub last_processed_at: DateTime<Utc>,
}

impl SyncPosition {
    /// Zero-valued cursor for a pair never seen before.
    pub fn initial(source_db_path: &str, target_name: &str) -> Self {
        SyncPosition {
            source_db_path: source_db_path.to_string(),
            target_name: target_name.to_string(),
            last_audit_id: 0,
            total_events: 0,
            last_processed_at: Utc::now(),
        }
    }

    pub fn advance(&mut self, audit_id: i64, events: u64) {
        self.last_audit_id = audit_id;
        self.total_events += events;
        self.last_processed_at = Utc::now();
    }
}

/// Bulk-copy progress for one (source, table) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitialSyncCheckpoint {
    pub table_name: String,
    pub last_pk: Option<RowKey>,
    pub total_synced: u64,
    pub status: SyncState,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl InitialSyncCheckpoint {
    pub fn begin(table_name: &str) -> Self {
        let now = Utc::now();
        InitialSyncCheckpoint {
            table_name: table_name.to_string(),
            last_pk: None,
            total_synced: 0,
            status: SyncState::Running,
            started_at: now,
            updated_at: now,
        }
    }

    pub fn update_progress(&mut self, last_pk: RowKey, total_synced: u64) {
        self.last_pk = Some(last_pk);
        self.total_synced = total_synced;
        self.updated_at = Utc::now();
    }

    pub fn complete(&mut self) {
        self.status = SyncState::Completed;
        self.updated_at = Utc::now();
    }

    pub fn fail(&mut self) {
        self.status = SyncState::Error;
        self.updated_at = Utc::now();
    }

    pub fn is_completed(&self) -> bool {
        self.status == SyncState::Completed
    }
}
