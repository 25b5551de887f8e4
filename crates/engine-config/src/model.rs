use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;

/// Source (SQLite) side of a sync run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub db_path: String,
    #[serde(default = "default_journal_mode")]
    pub journal_mode: String,
    /// Tables to audit and replicate; empty means every table.
    #[serde(default)]
    pub tables: Vec<String>,
}

fn default_journal_mode() -> String {
    "WAL".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetKind {
    Mysql,
    Oracle,
}

impl fmt::Display for TargetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetKind::Mysql => f.write_str("mysql"),
            TargetKind::Oracle => f.write_str("oracle"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MysqlConnection {
    pub host: String,
    #[serde(default = "default_mysql_port")]
    pub port: u16,
    pub database: String,
    pub username: String,
    pub password: String,
    #[serde(default = "default_charset")]
    pub charset: String,
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
}

fn default_mysql_port() -> u16 {
    3306
}

fn default_charset() -> String {
    "utf8mb4".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OracleConnection {
    pub host: String,
    #[serde(default = "default_oracle_port")]
    pub port: u16,
    pub service_name: String,
    pub username: String,
    pub password: String,
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
}

fn default_oracle_port() -> u16 {
    1521
}

fn default_pool_size() -> usize {
    5
}

/// Connection parameters, discriminated by the `type` key.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ConnectionConfig {
    Mysql(MysqlConnection),
    Oracle(OracleConnection),
}

/// Backoff parameters for a target's write retries.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
    /// Upper bound on a single backoff delay, in seconds.
    #[serde(default = "default_max_delay")]
    pub max_delay: f64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_backoff_factor() -> f64 {
    1.0
}

fn default_max_delay() -> f64 {
    60.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_retries: default_max_retries(),
            backoff_factor: default_backoff_factor(),
            max_delay: default_max_delay(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: TargetKind,
    pub connection: ConnectionConfig,
    /// Overrides the global batch size for this target.
    #[serde(default)]
    pub batch_size: Option<usize>,
    #[serde(default)]
    pub retry_policy: RetryPolicy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConverterKind {
    Lowercase,
    Uppercase,
    Trim,
    Default,
    Typecast,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldMapping {
    pub source_field: String,
    #[serde(default)]
    pub target_field: Option<String>,
    #[serde(default)]
    pub converter: Option<ConverterKind>,
    #[serde(default)]
    pub converter_params: HashMap<String, serde_json::Value>,
}

impl FieldMapping {
    pub fn target_field(&self) -> &str {
        self.target_field.as_deref().unwrap_or(&self.source_field)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableMapping {
    pub source_table: String,
    #[serde(default)]
    pub target_table: Option<String>,
    #[serde(default)]
    pub field_mappings: Vec<FieldMapping>,
    /// SQL predicate restricting initial-sync rows. Streaming ignores it.
    #[serde(default)]
    pub filter_condition: Option<String>,
    #[serde(default = "default_primary_key")]
    pub primary_key: String,
}

fn default_primary_key() -> String {
    "id".to_string()
}

impl TableMapping {
    /// Bare mapping with every default, used when a table has no entry.
    pub fn passthrough(source_table: &str) -> Self {
        TableMapping {
            source_table: source_table.to_string(),
            target_table: None,
            field_mappings: Vec::new(),
            filter_condition: None,
            primary_key: default_primary_key(),
        }
    }

    pub fn target_table(&self) -> &str {
        self.target_table.as_deref().unwrap_or(&self.source_table)
    }
}

/// Root configuration object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    pub source: SourceConfig,
    pub targets: Vec<TargetConfig>,
    pub mappings: Vec<TableMapping>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_checkpoint_interval")]
    pub checkpoint_interval: usize,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_batch_size() -> usize {
    100
}

fn default_checkpoint_interval() -> usize {
    10
}

fn default_log_level() -> String {
    "INFO".to_string()
}

const LOG_LEVELS: [&str; 4] = ["DEBUG", "INFO", "WARNING", "ERROR"];

impl SyncConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.source.db_path.ends_with(".db") {
            return Err(ConfigError::Invalid(
                "source.db_path must end with .db".into(),
            ));
        }
        if !self.source.journal_mode.eq_ignore_ascii_case("WAL") {
            return Err(ConfigError::Invalid(
                "change capture requires journal_mode WAL".into(),
            ));
        }
        if self.targets.is_empty() {
            return Err(ConfigError::Invalid("at least one target is required".into()));
        }

        let mut names = HashSet::new();
        for target in &self.targets {
            if !names.insert(target.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate target name: {}",
                    target.name
                )));
            }
        }

        if self.mappings.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one table mapping is required".into(),
            ));
        }

        if !self.source.tables.is_empty() {
            let known: HashSet<&str> = self.source.tables.iter().map(String::as_str).collect();
            for mapping in &self.mappings {
                if !known.contains(mapping.source_table.as_str()) {
                    return Err(ConfigError::Invalid(format!(
                        "mapped table {} is not listed in source.tables",
                        mapping.source_table
                    )));
                }
            }
        }

        for mapping in &self.mappings {
            for field in &mapping.field_mappings {
                if field.converter == Some(ConverterKind::Default)
                    && !field.converter_params.contains_key("value")
                {
                    return Err(ConfigError::Invalid(format!(
                        "default converter on {}.{} requires a 'value' parameter",
                        mapping.source_table, field.source_field
                    )));
                }
            }
        }

        if !LOG_LEVELS.contains(&self.log_level.to_ascii_uppercase().as_str()) {
            return Err(ConfigError::Invalid(format!(
                "log_level must be one of {LOG_LEVELS:?}"
            )));
        }

        Ok(())
    }

    pub fn table_mapping(&self, source_table: &str) -> Option<&TableMapping> {
        self.mappings
            .iter()
            .find(|m| m.source_table == source_table)
    }

    pub fn target(&self, name: &str) -> Option<&TargetConfig> {
        self.targets.iter().find(|t| t.name == name)
    }

    /// Source tables in mapping order.
    pub fn mapped_tables(&self) -> Vec<String> {
        self.mappings.iter().map(|m| m.source_table.clone()).collect()
    }
}
