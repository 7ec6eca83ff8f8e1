//! Normalizes raw backend rows into the declared report fields.
//!
//! Output rows carry exactly the mapped targets: unmapped raw keys are
//! dropped and missing ones are filled with `null`.

use crate::{
    catalog::{FieldMetadata, FieldType},
    query::{OrderDirection, PostProcess},
    time::{from_filetime, parse_datetime},
};
use chrono::SecondsFormat;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use std::cmp::Ordering;

pub type Row = Map<String, Value>;

pub const COUNT_FIELD: &str = "count";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldMapping {
    /// Raw key; `/` separates nested Graph property paths.
    pub source: String,
    pub target: String,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub field_type: Option<FieldType>,
}

impl FieldMapping {
    pub fn new(source: &str, target: &str) -> Self {
        Self {
            source: source.to_string(),
            target: target.to_string(),
            field_type: None,
        }
    }

    pub fn from_field(field: &FieldMetadata) -> Self {
        Self {
            source: field.backend_name.clone(),
            target: field.name.clone(),
            field_type: Some(field.field_type),
        }
    }

    pub fn count() -> Self {
        Self {
            source: COUNT_FIELD.to_string(),
            target: COUNT_FIELD.to_string(),
            field_type: Some(FieldType::Integer),
        }
    }
}

pub fn map_rows(raw: Vec<Value>, mapping: &[FieldMapping]) -> Vec<Row> {
    raw.iter().map(|row| map_row(row, mapping)).collect()
}

pub fn map_row(raw: &Value, mapping: &[FieldMapping]) -> Row {
    let mut out = Map::with_capacity(mapping.len());
    for field in mapping {
        let value = lookup(raw, &field.source)
            .cloned()
            .map(|value| coerce(value, field.field_type))
            .unwrap_or(Value::Null);
        out.insert(field.target.clone(), value);
    }
    out
}

fn lookup<'a>(raw: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('/')
        .try_fold(raw, |current, segment| get_key(current.as_object()?, segment))
}

/// Exact match first; directory attribute names are case-insensitive.
fn get_key<'a>(object: &'a Map<String, Value>, key: &str) -> Option<&'a Value> {
    object.get(key).or_else(|| {
        object
            .iter()
            .find(|(candidate, _)| candidate.eq_ignore_ascii_case(key))
            .map(|(_, value)| value)
    })
}

/// Best-effort conversion; values that do not convert are returned unchanged.
pub fn coerce(value: Value, field_type: Option<FieldType>) -> Value {
    let Some(field_type) = field_type else {
        return value;
    };

    if field_type == FieldType::Array {
        return match value {
            Value::Null | Value::Array(_) => value,
            other => Value::Array(vec![other]),
        };
    }

    let value = match value {
        Value::Array(mut items) if items.len() == 1 => items.remove(0),
        Value::Array(items) if items.is_empty() => Value::Null,
        other => other,
    };

    match field_type {
        FieldType::Integer => coerce_number(value),
        FieldType::Boolean => coerce_bool(value),
        FieldType::Datetime => coerce_datetime(value),
        FieldType::String => match value {
            Value::Number(n) => Value::String(n.to_string()),
            Value::Bool(b) => Value::String(b.to_string()),
            other => other,
        },
        FieldType::Array => value,
    }
}

fn coerce_number(value: Value) -> Value {
    match value {
        Value::String(raw) => {
            let trimmed = raw.trim();
            if let Ok(int) = trimmed.parse::<i64>() {
                Value::Number(int.into())
            } else if let Some(number) = trimmed.parse::<f64>().ok().and_then(Number::from_f64) {
                Value::Number(number)
            } else {
                Value::String(raw)
            }
        }
        Value::Bool(b) => Value::Number(i64::from(b).into()),
        other => other,
    }
}

fn coerce_bool(value: Value) -> Value {
    match value {
        Value::String(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Value::Bool(true),
            "false" | "0" | "no" => Value::Bool(false),
            _ => Value::String(raw),
        },
        Value::Number(n) => match n.as_i64() {
            Some(0) => Value::Bool(false),
            Some(1) => Value::Bool(true),
            _ => Value::Number(n),
        },
        other => other,
    }
}

fn coerce_datetime(value: Value) -> Value {
    let parsed = match &value {
        Value::String(raw) => {
            let trimmed = raw.trim();
            if is_never(trimmed.parse::<i64>().ok()) {
                return Value::Null;
            }
            parse_datetime(trimmed)
        }
        Value::Number(n) => {
            if is_never(n.as_i64()) {
                return Value::Null;
            }
            n.as_i64().and_then(from_filetime)
        }
        _ => None,
    };

    match parsed {
        Some(ts) => Value::String(ts.to_rfc3339_opts(SecondsFormat::Secs, true)),
        None => value,
    }
}

/// FILETIME sentinels for "never".
fn is_never(ticks: Option<i64>) -> bool {
    matches!(ticks, Some(0) | Some(i64::MAX))
}

/// Grouping, ordering and truncation for backends that cannot do them.
pub fn post_process(rows: Vec<Row>, post: &PostProcess) -> Vec<Row> {
    let mut rows = if post.group_by.is_empty() {
        rows
    } else {
        group_rows(rows, &post.group_by)
    };

    if !post.sort.is_empty() {
        rows.sort_by(|a, b| {
            post.sort
                .iter()
                .map(|(field, direction)| {
                    let ordering = compare_values(
                        a.get(field).unwrap_or(&Value::Null),
                        b.get(field).unwrap_or(&Value::Null),
                    );
                    match direction {
                        OrderDirection::Asc => ordering,
                        OrderDirection::Desc => ordering.reverse(),
                    }
                })
                .find(|ordering| *ordering != Ordering::Equal)
                .unwrap_or(Ordering::Equal)
        });
    }

    if let Some(limit) = post.limit {
        rows.truncate(limit);
    }

    if !post.project.is_empty() {
        for row in &mut rows {
            row.retain(|key, _| post.project.iter().any(|keep| keep == key));
        }
    }
    rows
}

fn group_rows(rows: Vec<Row>, keys: &[String]) -> Vec<Row> {
    let mut groups: Vec<(Vec<Value>, i64)> = Vec::new();
    for row in rows {
        let key: Vec<Value> = keys
            .iter()
            .map(|k| row.get(k).cloned().unwrap_or(Value::Null))
            .collect();
        match groups.iter_mut().find(|(existing, _)| *existing == key) {
            Some((_, count)) => *count += 1,
            None => groups.push((key, 1)),
        }
    }

    groups
        .into_iter()
        .map(|(values, count)| {
            let mut row: Row = keys.iter().cloned().zip(values).collect();
            row.insert(COUNT_FIELD.to_string(), Value::Number(count.into()));
            row
        })
        .collect()
}

/// Nulls sort last; strings compare case-insensitively.
fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Null, _) => Ordering::Greater,
        (_, Value::Null) => Ordering::Less,
        (Value::Number(x), Value::Number(y)) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::String(x), Value::String(y)) => x.to_lowercase().cmp(&y.to_lowercase()),
        _ => a.to_string().cmp(&b.to_string()),
    }
}
