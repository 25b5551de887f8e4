use crate::error::ConfigError;
use crate::model::SyncConfig;
use std::path::Path;

/// Load and validate a YAML configuration file, expanding `${VAR}` and
/// `${VAR:-default}` references in every string value.
pub fn load_config(path: impl AsRef<Path>) -> Result<SyncConfig, ConfigError> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(ConfigError::NotFound(path.display().to_string()));
    }
    let content = std::fs::read_to_string(path)?;
    load_config_from_str(&content)
}

pub fn load_config_from_str(content: &str) -> Result<SyncConfig, ConfigError> {
    let raw: serde_yaml::Value = serde_yaml::from_str(content)?;
    let expanded = expand_env(raw)?;
    let config: SyncConfig = serde_yaml::from_value(expanded)?;
    config.validate()?;
    Ok(config)
}

/// Recursively expand environment-variable references in string values.
fn expand_env(value: serde_yaml::Value) -> Result<serde_yaml::Value, ConfigError> {
    use serde_yaml::Value;

    Ok(match value {
        Value::String(s) => Value::String(expand_env_str(&s)?),
        Value::Sequence(seq) => Value::Sequence(
            seq.into_iter()
                .map(expand_env)
                .collect::<Result<Vec<_>, _>>()?,
        ),
        Value::Mapping(map) => {
            let mut out = serde_yaml::Mapping::new();
            for (key, val) in map {
                out.insert(key, expand_env(val)?);
            }
            Value::Mapping(out)
        }
        other => other,
    })
}

/// Expand `${VAR}` / `${VAR:-default}` occurrences in one string.
fn expand_env_str(input: &str) -> Result<String, ConfigError> {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            // Unterminated reference: keep it verbatim.
            out.push_str(&rest[start..]);
            return Ok(out);
        };

        let inner = &after[..end];
        let (name, default) = match inner.split_once(":-") {
            Some((name, default)) => (name, Some(default)),
            None => (inner, None),
        };

        match std::env::var(name) {
            Ok(value) => out.push_str(&value),
            Err(_) => match default {
                Some(default) => out.push_str(default),
                None => return Err(ConfigError::MissingEnvVar(name.to_string())),
            },
        }

        rest = &after[end + 1..];
    }

    out.push_str(rest);
    Ok(out)
}

/// Commented YAML template written by the `init` subcommand.
pub fn config_template() -> &'static str {
    r#"# CDC sync engine configuration

# Source database
source:
  db_path: "./source.db"
  journal_mode: "WAL"
  tables: ["users", "orders"]   # empty list means every table

# Replication targets
targets:
  - name: "mysql_prod"
    type: "mysql"
    connection:
      type: "mysql"
      host: "localhost"
      port: 3306
      database: "cdc_backup"
      username: "${MYSQL_USER}"
      password: "${MYSQL_PASSWORD}"
    batch_size: 100
    retry_policy:
      max_retries: 3
      backoff_factor: 1.0
      max_delay: 60.0

  - name: "oracle_dr"
    type: "oracle"
    connection:
      type: "oracle"
      host: "oracle.example.com"
      port: 1521
      service_name: "ORCL"
      username: "${ORACLE_USER}"
      password: "${ORACLE_PASSWORD}"

# Table mappings
mappings:
  - source_table: "users"
    target_table: "users_backup"
    primary_key: "id"
    field_mappings:
      - source_field: "email"
        converter: "lowercase"
    filter_condition: "deleted_at IS NULL"   # initial sync only

  - source_table: "orders"
    target_table: "orders_backup"
    primary_key: "order_id"

# Global settings
batch_size: 100             # rows per write batch
checkpoint_interval: 10     # batches between checkpoint flushes
log_level: "INFO"           # DEBUG, INFO, WARNING, ERROR
"#
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ConnectionConfig, ConverterKind, TargetKind};

    fn minimal_yaml() -> &'static str {
        r#"
source:
  db_path: "./source.db"
  tables: ["users"]
targets:
  - name: "mysql_prod"
    type: "mysql"
    connection:
      type: "mysql"
      host: "localhost"
      database: "backup"
      username: "root"
      password: "secret"
mappings:
  - source_table: "users"
"#
    }

    #[test]
    fn parses_minimal_config_with_defaults() {
        let config = load_config_from_str(minimal_yaml()).unwrap();
        assert_eq!(config.batch_size, 100);
        assert_eq!(config.checkpoint_interval, 10);
        assert_eq!(config.log_level, "INFO");
        assert_eq!(config.source.journal_mode, "WAL");

        let target = &config.targets[0];
        assert_eq!(target.kind, TargetKind::Mysql);
        assert_eq!(target.retry_policy.max_retries, 3);
        match &target.connection {
            ConnectionConfig::Mysql(conn) => {
                assert_eq!(conn.port, 3306);
                assert_eq!(conn.pool_size, 5);
                assert_eq!(conn.charset, "utf8mb4");
            }
            other => panic!("unexpected connection: {other:?}"),
        }

        let mapping = &config.mappings[0];
        assert_eq!(mapping.target_table(), "users");
        assert_eq!(mapping.primary_key, "id");
    }

    #[test]
    fn parses_field_mappings_and_converters() {
        let yaml = r#"
source:
  db_path: "./source.db"
targets:
  - name: "t"
    type: "oracle"
    connection:
      type: "oracle"
      host: "h"
      service_name: "ORCL"
      username: "u"
      password: "p"
mappings:
  - source_table: "users"
    target_table: "users_backup"
    field_mappings:
      - source_field: "email"
        converter: "lowercase"
      - source_field: "status"
        target_field: "state"
        converter: "default"
        converter_params:
          value: "active"
"#;
        let config = load_config_from_str(yaml).unwrap();
        let fields = &config.mappings[0].field_mappings;
        assert_eq!(fields[0].converter, Some(ConverterKind::Lowercase));
        assert_eq!(fields[1].target_field(), "state");
        assert_eq!(
            fields[1].converter_params["value"],
            serde_json::json!("active")
        );
    }

    #[test]
    fn expands_env_vars_with_defaults() {
        std::env::set_var("CDC_TEST_USER", "alice");
        std::env::remove_var("CDC_TEST_MISSING");

        assert_eq!(expand_env_str("${CDC_TEST_USER}").unwrap(), "alice");
        assert_eq!(
            expand_env_str("user=${CDC_TEST_USER}, db=${CDC_TEST_MISSING:-fallback}").unwrap(),
            "user=alice, db=fallback"
        );
        assert!(matches!(
            expand_env_str("${CDC_TEST_MISSING}"),
            Err(ConfigError::MissingEnvVar(_))
        ));
    }

    #[test]
    fn rejects_duplicate_target_names() {
        let yaml = minimal_yaml().replace(
            "mappings:",
            r#"  - name: "mysql_prod"
    type: "mysql"
    connection:
      type: "mysql"
      host: "other"
      database: "backup"
      username: "root"
      password: "secret"
mappings:"#,
        );
        assert!(matches!(
            load_config_from_str(&yaml),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn rejects_mapping_outside_source_tables() {
        let yaml = minimal_yaml().replace("source_table: \"users\"", "source_table: \"orders\"");
        assert!(matches!(
            load_config_from_str(&yaml),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn rejects_default_converter_without_value() {
        let yaml = r#"
source:
  db_path: "./source.db"
targets:
  - name: "t"
    type: "mysql"
    connection:
      type: "mysql"
      host: "h"
      database: "d"
      username: "u"
      password: "p"
mappings:
  - source_table: "users"
    field_mappings:
      - source_field: "status"
        converter: "default"
"#;
        assert!(matches!(
            load_config_from_str(yaml),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn rejects_non_wal_journal_mode() {
        let yaml = minimal_yaml().replace("tables: [\"users\"]", "journal_mode: \"DELETE\"");
        assert!(load_config_from_str(&yaml).is_err());
    }

    #[test]
    fn template_is_valid_given_env() {
        std::env::set_var("MYSQL_USER", "root");
        std::env::set_var("MYSQL_PASSWORD", "secret");
        std::env::set_var("ORACLE_USER", "system");
        std::env::set_var("ORACLE_PASSWORD", "secret");

        let config = load_config_from_str(config_template()).unwrap();
        assert_eq!(config.targets.len(), 2);
        assert_eq!(config.mappings.len(), 2);
    }
}
