//! Persisted replication checkpoint.

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::Result;
use crate::position::Position;
use crate::table::{TableRef, TableSet};

/// The durable checkpoint of a replication run.
///
/// Serialized as `{ "lsn": "<position>", "streams": ["schema.table", ...] }`.
/// An empty `lsn` means no position has been acknowledged yet.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationState {
    /// Last acknowledged position.
    #[serde(
        default,
        serialize_with = "serialize_lsn",
        deserialize_with = "deserialize_lsn"
    )]
    pub lsn: Option<Position>,
    /// Tables whose initial snapshot has completed.
    #[serde(default)]
    pub streams: TableSet,
}

impl ReplicationState {
    pub fn is_empty(&self) -> bool {
        self.lsn.is_none() && self.streams.is_empty()
    }

    pub fn has_snapshot(&self, table: &TableRef) -> bool {
        self.streams.contains(table)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

fn serialize_lsn<S: Serializer>(
    lsn: &Option<Position>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    match lsn {
        Some(position) => serializer.collect_str(position),
        None => serializer.serialize_str(""),
    }
}

fn deserialize_lsn<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> std::result::Result<Option<Position>, D::Error> {
    let text = Option::<String>::deserialize(deserializer)?.unwrap_or_default();
    if text.trim().is_empty() {
        return Ok(None);
    }
    Position::parse(&text)
        .map(Some)
        .map_err(serde::de::Error::custom)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_state_layout() {
        let state = ReplicationState::default();
        let json: serde_json::Value = serde_json::to_value(&state).unwrap();
        assert_eq!(json, serde_json::json!({ "lsn": "", "streams": [] }));
        assert!(state.is_empty());
    }

    #[test]
    fn test_state_layout() {
        let mut state = ReplicationState {
            lsn: Some(Position::new(0x16B3748)),
            ..Default::default()
        };
        state.streams.insert(TableRef::new("public", "orders"));

        let json: serde_json::Value = serde_json::to_value(&state).unwrap();
        assert_eq!(
            json,
            serde_json::json!({ "lsn": "0/16B3748", "streams": ["public.orders"] })
        );

        let back = ReplicationState::from_json(&state.to_json().unwrap()).unwrap();
        assert_eq!(back, state);
        assert!(back.has_snapshot(&TableRef::new("public", "orders")));
    }

    #[test]
    fn test_missing_and_null_fields() {
        assert_eq!(ReplicationState::from_json("{}").unwrap(), ReplicationState::default());
        assert_eq!(
            ReplicationState::from_json(r#"{"lsn": null}"#).unwrap(),
            ReplicationState::default()
        );
    }

    #[test]
    fn test_bad_lsn_is_rejected() {
        assert!(ReplicationState::from_json(r#"{"lsn": "zz"}"#).is_err());
    }
}
