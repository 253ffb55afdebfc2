//! Offset-paginated table reads outside of replication.
//!
//! `FullRefresh` re-reads the whole table; `Incremental` reads rows whose
//! cursor column is at or past the last saved cursor value and reports the
//! new maximum so the caller can save it for the next read.

use std::time::Instant;

use tokio::sync::mpsc;
use tokio_postgres::Client;
use tracing::{debug, info};
use walsync_core::{Change, RowMap, TableRef, Value};

use crate::error::{PgError, PgResult};
use crate::sql::{json_row_to_map, quote_ident, quote_table, select_json_rows};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadMode {
    FullRefresh,
    Incremental { cursor: String },
}

/// Reads one table page by page into a channel of `insert` changes.
#[derive(Debug, Clone)]
pub struct TableReader {
    table: TableRef,
    batch_size: u32,
    mode: ReadMode,
    /// Highest cursor value seen so far, seeded from the saved state.
    state: Option<Value>,
    rows_read: u64,
}

impl TableReader {
    pub fn full_refresh(table: TableRef, batch_size: u32) -> Self {
        Self {
            table,
            batch_size: batch_size.max(1),
            mode: ReadMode::FullRefresh,
            state: None,
            rows_read: 0,
        }
    }

    /// Read rows with `cursor >= state`, or every row when `state` is `None`.
    pub fn incremental(
        table: TableRef,
        batch_size: u32,
        cursor: impl Into<String>,
        state: Option<Value>,
    ) -> Self {
        Self {
            table,
            batch_size: batch_size.max(1),
            mode: ReadMode::Incremental {
                cursor: cursor.into(),
            },
            state: state.filter(|v| !v.is_null()),
            rows_read: 0,
        }
    }

    pub fn table(&self) -> &TableRef {
        &self.table
    }

    pub fn mode(&self) -> &ReadMode {
        &self.mode
    }

    /// The cursor value to save after a read. Always `None` for full refreshes.
    pub fn cursor_state(&self) -> Option<&Value> {
        self.state.as_ref()
    }

    pub fn rows_read(&self) -> u64 {
        self.rows_read
    }

    /// Read the table into `output`.
    ///
    /// A closed receiver ends the read early without an error.
    pub async fn read(&mut self, client: &Client, output: &mpsc::Sender<Change>) -> PgResult<()> {
        let started = Instant::now();
        info!(table = %self.table, mode = ?self.mode, "Reading table");

        let completed = match self.mode.clone() {
            ReadMode::FullRefresh => self.read_full(client, output).await?,
            ReadMode::Incremental { cursor } => {
                self.read_incremental(client, output, &cursor).await?
            }
        };

        info!(
            table = %self.table,
            rows = self.rows_read,
            completed,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Table read finished"
        );
        Ok(())
    }

    async fn read_full(&mut self, client: &Client, output: &mpsc::Sender<Change>) -> PgResult<bool> {
        let batch = u64::from(self.batch_size);
        let mut offset: u64 = 0;

        loop {
            let statement = select_json_rows(&self.table, &format!("OFFSET {} LIMIT {}", offset, batch));
            let rows = client
                .query(&statement, &[])
                .await
                .map_err(|e| self.read_error(&statement, offset, e.into()))?;
            let fetched = rows.len() as u64;

            for row in &rows {
                let data = json_row_to_map(row).map_err(|e| self.read_error(&statement, offset, e))?;
                if !self.emit(output, data).await {
                    return Ok(false);
                }
            }

            debug!(table = %self.table, offset, fetched, "Read page");
            if fetched < batch {
                return Ok(true);
            }
            offset += fetched;
        }
    }

    async fn read_incremental(
        &mut self,
        client: &Client,
        output: &mpsc::Sender<Change>,
        cursor: &str,
    ) -> PgResult<bool> {
        let batch = u64::from(self.batch_size);
        let mut offset: u64 = 0;

        // Bound once: the saved value, not the running maximum, so paging
        // stays stable across the whole read.
        let bound = self.state.as_ref().and_then(Value::to_text);
        let filter = match &bound {
            Some(_) => {
                let cursor_type = self.cursor_type(client, cursor).await?;
                format!("WHERE {} >= $1::text::{} ", quote_ident(cursor), cursor_type)
            }
            None => String::new(),
        };

        loop {
            let statement = select_json_rows(
                &self.table,
                &format!(
                    "{}ORDER BY {} ASC NULLS FIRST OFFSET {} LIMIT {}",
                    filter,
                    quote_ident(cursor),
                    offset,
                    batch
                ),
            );
            let result = match &bound {
                Some(value) => client.query(&statement, &[value]).await,
                None => client.query(&statement, &[]).await,
            };
            let rows = result.map_err(|e| self.read_error(&statement, offset, e.into()))?;
            let fetched = rows.len() as u64;

            for row in &rows {
                let data = json_row_to_map(row).map_err(|e| self.read_error(&statement, offset, e))?;
                // Rows arrive in ascending cursor order
                if let Some(value) = data.get(cursor).filter(|v| !v.is_null()) {
                    self.state = Some(value.clone());
                }
                if !self.emit(output, data).await {
                    return Ok(false);
                }
            }

            debug!(table = %self.table, offset, fetched, cursor_state = ?self.state, "Read page");
            if fetched < batch {
                return Ok(true);
            }
            offset += fetched;
        }
    }

    /// SQL type of the cursor column, used to cast the bound value back.
    async fn cursor_type(&self, client: &Client, cursor: &str) -> PgResult<String> {
        let statement = "SELECT format_type(a.atttypid, a.atttypmod) FROM pg_attribute a \
                         WHERE a.attrelid = $1::text::regclass AND a.attname = $2 AND NOT a.attisdropped";
        let row = client
            .query_opt(statement, &[&quote_table(&self.table), &cursor])
            .await
            .map_err(|e| self.read_error(statement, 0, e.into()))?;

        match row {
            Some(row) => Ok(row.get(0)),
            None => Err(PgError::ReadTable {
                schema: self.table.schema.clone(),
                table: self.table.table.clone(),
                statement: statement.to_string(),
                message: format!("cursor column {} does not exist", cursor),
            }),
        }
    }

    async fn emit(&mut self, output: &mpsc::Sender<Change>, data: RowMap) -> bool {
        if output
            .send(Change::snapshot_insert(self.table.clone(), data))
            .await
            .is_err()
        {
            debug!(table = %self.table, "Output closed, ending read");
            return false;
        }
        self.rows_read += 1;
        true
    }

    fn read_error(&self, statement: &str, offset: u64, e: PgError) -> PgError {
        PgError::ReadTable {
            schema: self.table.schema.clone(),
            table: self.table.table.clone(),
            statement: statement.to_string(),
            message: format!(
                "failed to read after offset[{}] limit[{}]: {}",
                offset, self.batch_size, e
            ),
        }
    }
}
