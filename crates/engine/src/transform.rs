//! Field renames and value conversion, applied between the audit reader and
//! the target writers. Pure: the only state is the compiled mapping.

use engine_config::{ConverterKind, FieldMapping, TableMapping};
use model::Row;
use serde_json::Value;
use std::collections::HashMap;

pub struct Transformer {
    mapping: TableMapping,
    by_source: HashMap<String, FieldMapping>,
}

impl Transformer {
    pub fn new(mapping: &TableMapping) -> Self {
        let by_source = mapping
            .field_mappings
            .iter()
            .map(|fm| (fm.source_field.clone(), fm.clone()))
            .collect();
        Transformer {
            mapping: mapping.clone(),
            by_source,
        }
    }

    pub fn target_table(&self) -> &str {
        self.mapping.target_table()
    }

    pub fn primary_key(&self) -> &str {
        &self.mapping.primary_key
    }

    /// Transform one row: mapped fields are converted and renamed, unmapped
    /// fields pass through under their source name.
    pub fn transform(&self, row: &Row) -> Row {
        let mut result = Row::new();
        for (source_field, value) in row {
            match self.by_source.get(source_field) {
                Some(field) => {
                    let value = match field.converter {
                        Some(kind) => convert(value, kind, &field.converter_params),
                        None => value.clone(),
                    };
                    result.insert(field.target_field().to_string(), value);
                }
                None => {
                    result.insert(source_field.clone(), value.clone());
                }
            }
        }
        result
    }

    pub fn transform_batch(&self, rows: &[Row]) -> Vec<Row> {
        rows.iter().map(|row| self.transform(row)).collect()
    }
}

/// Apply one converter to one value. Conversion never fails: a value a
/// converter cannot handle passes through unchanged.
pub fn convert(value: &Value, kind: ConverterKind, params: &HashMap<String, Value>) -> Value {
    match kind {
        ConverterKind::Lowercase => map_string(value, |s| s.to_lowercase()),
        ConverterKind::Uppercase => map_string(value, |s| s.to_uppercase()),
        ConverterKind::Trim => map_string(value, |s| s.trim().to_string()),
        ConverterKind::Default => {
            let is_empty = matches!(value, Value::Null)
                || matches!(value, Value::String(s) if s.is_empty());
            if is_empty {
                params.get("value").cloned().unwrap_or(Value::Null)
            } else {
                value.clone()
            }
        }
        ConverterKind::Typecast => {
            let target = params.get("target_type").and_then(Value::as_str).unwrap_or("str");
            typecast(value, target)
        }
    }
}

/// Stringify then apply `f`; NULL passes through.
fn map_string(value: &Value, f: impl Fn(&str) -> String) -> Value {
    match value {
        Value::Null => Value::Null,
        Value::String(s) => Value::String(f(s)),
        other => Value::String(f(&stringify(other))),
    }
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn typecast(value: &Value, target: &str) -> Value {
    if value.is_null() {
        return Value::Null;
    }

    match target {
        "str" => Value::String(stringify(value)),
        "int" => match value {
            Value::Number(n) => n
                .as_i64()
                .or_else(|| n.as_f64().map(|f| f as i64))
                .map(Value::from)
                .unwrap_or_else(|| value.clone()),
            Value::String(s) => s
                .parse::<i64>()
                .map(Value::from)
                .unwrap_or_else(|_| value.clone()),
            Value::Bool(b) => Value::from(i64::from(*b)),
            _ => value.clone(),
        },
        "float" => match value {
            Value::Number(n) => n
                .as_f64()
                .and_then(serde_json::Number::from_f64)
                .map(Value::Number)
                .unwrap_or_else(|| value.clone()),
            Value::String(s) => s
                .parse::<f64>()
                .ok()
                .and_then(serde_json::Number::from_f64)
                .map(Value::Number)
                .unwrap_or_else(|| value.clone()),
            Value::Bool(b) => Value::from(if *b { 1.0 } else { 0.0 }),
            _ => value.clone(),
        },
        "bool" => match value {
            Value::Bool(_) => value.clone(),
            Value::Number(n) => Value::Bool(n.as_f64().map(|f| f != 0.0).unwrap_or(false)),
            Value::String(s) => match s.to_ascii_lowercase().as_str() {
                "true" | "1" => Value::Bool(true),
                "false" | "0" | "" => Value::Bool(false),
                _ => value.clone(),
            },
            _ => value.clone(),
        },
        _ => value.clone(),
    }
}
