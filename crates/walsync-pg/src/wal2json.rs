//! Change filter for wal2json (format version 1) payloads.
//!
//! One XLogData payload holds one transaction:
//!
//! ```json
//! {"xid": 1234, "nextlsn": "0/16B3780", "timestamp": "2024-01-01 12:00:00.1+00",
//!  "change": [{"kind": "insert", "schema": "public", "table": "orders",
//!              "columnnames": ["id"], "columnvalues": [1]}]}
//! ```

use serde::Deserialize;
use tracing::{trace, warn};
use walsync_core::{Change, ChangeKind, RowMap, TableRef, TableSet, Value};

use crate::error::{PgError, PgResult};

#[derive(Debug, Deserialize)]
struct Transaction {
    #[serde(default)]
    xid: Option<u64>,
    #[serde(default)]
    timestamp: Option<String>,
    change: Vec<RawChange>,
}

#[derive(Debug, Deserialize)]
struct RawChange {
    kind: String,
    #[serde(default)]
    schema: Option<String>,
    #[serde(default)]
    table: Option<String>,
    #[serde(default)]
    columnnames: Vec<String>,
    #[serde(default)]
    columnvalues: Vec<serde_json::Value>,
    #[serde(default)]
    oldkeys: Option<OldKeys>,
}

#[derive(Debug, Deserialize)]
struct OldKeys {
    #[serde(default)]
    keynames: Vec<String>,
    #[serde(default)]
    keyvalues: Vec<serde_json::Value>,
}

/// Turns raw payloads into [`Change`]s for the replicated tables.
#[derive(Debug, Clone)]
pub struct ChangeFilter {
    tables: TableSet,
}

impl ChangeFilter {
    pub fn new(tables: TableSet) -> Self {
        Self { tables }
    }

    pub fn tables(&self) -> &TableSet {
        &self.tables
    }

    /// Decode `payload` and keep changes for replicated tables, in payload order.
    ///
    /// Changes come back without a position; the caller stamps the frame's.
    pub fn filter(&self, payload: &[u8]) -> PgResult<Vec<Change>> {
        let txn: Transaction = serde_json::from_slice(payload)
            .map_err(|e| PgError::Decode(format!("invalid payload: {}", e)))?;

        let mut changes = Vec::with_capacity(txn.change.len());
        for raw in txn.change {
            let kind = match raw.kind.as_str() {
                "insert" => ChangeKind::Insert,
                "update" => ChangeKind::Update,
                "delete" => ChangeKind::Delete,
                other => {
                    warn!(kind = %other, xid = ?txn.xid, "Skipping unsupported wal2json change kind");
                    continue;
                }
            };

            let (Some(schema), Some(table)) = (raw.schema, raw.table) else {
                return Err(PgError::Decode(format!(
                    "{} change without schema or table",
                    kind.as_str()
                )));
            };

            if !self.tables.contains_table(&schema, &table) {
                trace!(schema = %schema, table = %table, "Dropping change for unreplicated table");
                continue;
            }

            let table = TableRef::new(schema, table);
            let identity = raw
                .oldkeys
                .map(|keys| zip_columns(&table, keys.keynames, keys.keyvalues))
                .transpose()?;

            let data = match kind {
                ChangeKind::Delete => identity.clone().ok_or_else(|| {
                    PgError::Decode(format!("delete on {} without oldkeys", table))
                })?,
                _ => zip_columns(&table, raw.columnnames, raw.columnvalues)?,
            };

            changes.push(Change {
                kind,
                table,
                data,
                identity,
                position: None,
                timestamp: txn.timestamp.clone(),
            });
        }

        Ok(changes)
    }
}

fn zip_columns(
    table: &TableRef,
    names: Vec<String>,
    values: Vec<serde_json::Value>,
) -> PgResult<RowMap> {
    if names.len() != values.len() {
        return Err(PgError::Decode(format!(
            "{}: {} column names but {} values",
            table,
            names.len(),
            values.len()
        )));
    }
    Ok(names
        .into_iter()
        .zip(values.into_iter().map(Value::from))
        .collect())
}
