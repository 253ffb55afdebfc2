use std::io::Write;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tracing::info;
use walsync_config::SourceConfig;
use walsync_core::{TableRef, Value};
use walsync_pg::{connect_postgres, TableReader};

use crate::output::write_change;

pub async fn cmd_read(
    config: SourceConfig,
    table: &str,
    cursor: Option<String>,
    from: Option<String>,
    batch_size: u32,
) -> Result<()> {
    let table = TableRef::parse(table).with_context(|| format!("Invalid table: {}", table))?;
    let connection = config.connection_config().context("Invalid connection")?;
    let client = connect_postgres(&connection)
        .await
        .with_context(|| format!("Failed to connect to {}", connection))?;

    let mut reader = match cursor {
        Some(cursor) => {
            let state = from.as_deref().map(parse_cursor_value);
            TableReader::incremental(table, batch_size, cursor, state)
        }
        None => TableReader::full_refresh(table, batch_size),
    };

    let (tx, mut rx) = mpsc::channel(256);
    let reading = async {
        let result = reader.read(&client, &tx).await;
        drop(tx);
        result
    };
    let printing = async {
        let stdout = std::io::stdout();
        let mut out = stdout.lock();
        while let Some(change) = rx.recv().await {
            write_change(&mut out, &change)?;
        }
        out.flush()
    };

    let (read, printed) = tokio::join!(reading, printing);
    read.context("Table read failed")?;
    printed.context("Failed to write rows")?;

    let cursor_state = reader
        .cursor_state()
        .map(|v| serde_json::Value::from(v.clone()).to_string());
    info!(rows = reader.rows_read(), cursor_state = ?cursor_state, "Read complete");
    Ok(())
}

/// Cursor values are given as JSON; anything that does not parse is a string.
fn parse_cursor_value(text: &str) -> Value {
    serde_json::from_str::<serde_json::Value>(text)
        .map(Value::from)
        .unwrap_or_else(|_| Value::String(text.to_string()))
}
