use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::position::Position;
use crate::table::TableRef;

/// A column value as it arrives from Postgres.
///
/// Live rows come from wal2json's `columnvalues` and snapshot rows from
/// `to_jsonb(r.*)`, so both paths share JSON's shape: numbers are bare,
/// `numeric` that fits neither `i64` nor `f64` exactly stays as text,
/// timestamps, `uuid`, `bytea` and other scalar types are strings, and
/// `json`/`jsonb` columns are nested arrays and objects. Arrays of Postgres
/// arrays keep their nesting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Array(Vec<Value>),
    Object(HashMap<String, Value>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Text form Postgres accepts as input for the column's own type, for
    /// binding as `$n::text::<type>`. Nested values render as JSON.
    /// `None` for SQL `NULL`.
    pub fn to_text(&self) -> Option<String> {
        match self {
            Value::Null => None,
            Value::Bool(b) => Some(b.to_string()),
            Value::Int(i) => Some(i.to_string()),
            Value::Float(f) => Some(f.to_string()),
            Value::String(s) => Some(s.clone()),
            Value::Array(_) | Value::Object(_) => {
                Some(serde_json::Value::from(self.clone()).to_string())
            }
        }
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        match v {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => number_value(n),
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => {
                Value::Array(items.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(fields) => Value::Object(
                fields
                    .into_iter()
                    .map(|(k, v)| (k, Value::from(v)))
                    .collect(),
            ),
        }
    }
}

/// `numeric(20)` and friends can exceed `i64`; routing them through `f64`
/// would silently round, so they are kept as their decimal text.
fn number_value(n: serde_json::Number) -> Value {
    if let Some(i) = n.as_i64() {
        return Value::Int(i);
    }
    if n.is_u64() {
        return Value::String(n.to_string());
    }
    n.as_f64().map_or(Value::Null, Value::Float)
}

impl From<Value> for serde_json::Value {
    fn from(v: Value) -> Self {
        match v {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(b),
            Value::Int(i) => serde_json::Value::Number(i.into()),
            // NaN and infinities have no JSON number form
            Value::Float(f) => serde_json::Number::from_f64(f)
                .map_or(serde_json::Value::Null, serde_json::Value::Number),
            Value::String(s) => serde_json::Value::String(s),
            Value::Array(items) => {
                serde_json::Value::Array(items.into_iter().map(Into::into).collect())
            }
            Value::Object(fields) => serde_json::Value::Object(
                fields.into_iter().map(|(k, v)| (k, v.into())).collect(),
            ),
        }
    }
}

/// The kind of row mutation a change describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl ChangeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ChangeKind::Insert => "insert",
            ChangeKind::Update => "update",
            ChangeKind::Delete => "delete",
        }
    }
}

/// A row map containing column name to value mappings.
pub type RowMap = HashMap<String, Value>;

/// One decoded row mutation.
///
/// Live changes carry the WAL position of the frame they were decoded from.
/// Snapshot and table-reader rows have no WAL coordinate and carry `None`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Change {
    pub kind: ChangeKind,
    pub table: TableRef,
    /// Column values. For deletes these are the old key columns.
    pub data: RowMap,
    /// Old key columns reported for updates and deletes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<RowMap>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,
    /// Commit timestamp as reported by the server.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

impl Change {
    /// A synthetic insert for a row read outside the WAL (snapshot, table scan).
    pub fn snapshot_insert(table: TableRef, data: RowMap) -> Self {
        Self {
            kind: ChangeKind::Insert,
            table,
            data,
            identity: None,
            position: None,
            timestamp: None,
        }
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.data.get(column)
    }

    pub fn is_snapshot(&self) -> bool {
        self.position.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wal2json_column_values() {
        let raw: serde_json::Value = serde_json::from_str(
            r#"[42, 18446744073709551615, 2.5, "2024-01-01 12:00:00+00", null, {"tags": ["a", true]}]"#,
        )
        .unwrap();
        let serde_json::Value::Array(items) = raw else {
            panic!("expected an array");
        };
        let values: Vec<Value> = items.into_iter().map(Value::from).collect();

        assert_eq!(values[0].as_i64(), Some(42));
        // Out of i64 range: kept exact as text
        assert_eq!(values[1], Value::String("18446744073709551615".into()));
        assert_eq!(values[2], Value::Float(2.5));
        assert_eq!(values[3], Value::String("2024-01-01 12:00:00+00".into()));
        assert!(values[4].is_null());
        assert!(matches!(&values[5], Value::Object(fields) if fields.contains_key("tags")));
    }

    #[test]
    fn test_to_text_for_cursor_binding() {
        assert_eq!(Value::Int(42).to_text(), Some("42".to_string()));
        assert_eq!(
            Value::String("2024-01-01".into()).to_text(),
            Some("2024-01-01".into())
        );
        assert_eq!(Value::Bool(true).to_text(), Some("true".to_string()));
        assert_eq!(
            Value::Array(vec![Value::Int(1), Value::Null]).to_text(),
            Some("[1,null]".to_string())
        );
        assert_eq!(Value::Null.to_text(), None);
    }

    #[test]
    fn test_non_finite_float_becomes_json_null() {
        let json: serde_json::Value = Value::Float(f64::NAN).into();
        assert!(json.is_null());
    }

    #[test]
    fn test_snapshot_insert_has_no_position() {
        let change = Change::snapshot_insert(
            TableRef::new("public", "orders"),
            [("id".to_string(), Value::Int(1))].into_iter().collect(),
        );
        assert_eq!(change.kind, ChangeKind::Insert);
        assert!(change.is_snapshot());
        assert_eq!(change.get("id"), Some(&Value::Int(1)));
    }

    #[test]
    fn test_change_serialization_shape() {
        let mut change = Change::snapshot_insert(
            TableRef::new("public", "orders"),
            [("id".to_string(), Value::Int(7))].into_iter().collect(),
        );
        change.position = Some(Position::new(0x10));

        let json = serde_json::to_value(&change).unwrap();
        assert_eq!(json["kind"], "insert");
        assert_eq!(json["table"], "public.orders");
        assert_eq!(json["data"]["id"], 7);
        assert_eq!(json["position"], "0/10");
        assert!(json.get("identity").is_none());
    }
}
