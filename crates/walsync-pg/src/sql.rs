//! Identifier quoting and row conversion shared by the snapshot and table readers.

use tokio_postgres::Row;
use walsync_core::{RowMap, TableRef, Value};

use crate::error::{PgError, PgResult};

/// Quote a SQL identifier, doubling embedded quotes.
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Quote a table as `"schema"."table"`.
pub fn quote_table(table: &TableRef) -> String {
    format!("{}.{}", quote_ident(&table.schema), quote_ident(&table.table))
}

/// Build a query returning each row of `table` as one `jsonb` document,
/// followed by `clause` (filters, ordering, paging). The table is aliased `r`.
///
/// Postgres performs the type conversion, which keeps snapshot rows shaped
/// like the column values wal2json emits for live changes.
pub fn select_json_rows(table: &TableRef, clause: &str) -> String {
    let query = format!("SELECT to_jsonb(r.*) FROM {} AS r", quote_table(table));
    if clause.is_empty() {
        query
    } else {
        format!("{} {}", query, clause)
    }
}

/// Decode a row produced by [`select_json_rows`] into a column map.
pub fn json_row_to_map(row: &Row) -> PgResult<RowMap> {
    let doc: serde_json::Value = row.try_get(0)?;
    match Value::from(doc) {
        Value::Object(map) => Ok(map),
        other => Err(PgError::Postgres(format!(
            "expected a row object, got {:?}",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("orders"), "\"orders\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn test_quote_table() {
        let table = TableRef::new("sales", "Order Items");
        assert_eq!(quote_table(&table), "\"sales\".\"Order Items\"");
    }

    #[test]
    fn test_select_json_rows() {
        let table = TableRef::new("public", "orders");
        assert_eq!(
            select_json_rows(&table, "ORDER BY \"id\" OFFSET 0 LIMIT 10"),
            "SELECT to_jsonb(r.*) FROM \"public\".\"orders\" AS r ORDER BY \"id\" OFFSET 0 LIMIT 10"
        );
        assert_eq!(
            select_json_rows(&table, ""),
            "SELECT to_jsonb(r.*) FROM \"public\".\"orders\" AS r"
        );
    }
}
