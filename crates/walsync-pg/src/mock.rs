//! Scripted stand-ins for the replication connection and the snapshot
//! coordinator, used to drive the engine without a database.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::time::Instant;
use walsync_core::{Change, Position, RowMap, TableRef};

use crate::error::{PgError, PgResult};
use crate::publish::Publisher;
use crate::replication::{Keepalive, ReplicationTransport, ServerMessage, StatusUpdate, XLogData};
use crate::snapshot::{SnapshotOutcome, SnapshotSource};

/// One scripted server event.
#[derive(Debug, Clone)]
enum Step {
    Message(ServerMessage),
    /// Nothing arrives before the caller's deadline.
    Idle,
    ServerError { code: String, message: String },
}

/// A mock replication connection. Clones share the same script and log.
#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

#[derive(Default)]
struct MockState {
    script: VecDeque<Step>,
    started: Option<(String, Position)>,
    status_updates: Vec<StatusUpdate>,
    closed: bool,
    fail_acknowledgments: bool,
    fail_start: Option<String>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an XLogData frame starting at `start` carrying `payload`.
    pub fn push_xlog(&self, start: Position, payload: &str) -> &Self {
        let data = Bytes::copy_from_slice(payload.as_bytes());
        let wal_end = start.advance(data.len() as u64);
        self.push(Step::Message(ServerMessage::XLogData(XLogData {
            wal_start: start,
            wal_end,
            send_time: 0,
            data,
        })))
    }

    /// Queue a primary keepalive.
    pub fn push_keepalive(&self, wal_end: Position, reply_requested: bool) -> &Self {
        self.push(Step::Message(ServerMessage::Keepalive(Keepalive {
            wal_end,
            send_time: 0,
            reply_requested,
        })))
    }

    /// Queue a read that times out.
    pub fn push_idle(&self) -> &Self {
        self.push(Step::Idle)
    }

    /// Queue the server ending the COPY stream.
    pub fn push_copy_done(&self) -> &Self {
        self.push(Step::Message(ServerMessage::CopyDone))
    }

    /// Queue an ErrorResponse.
    pub fn push_server_error(&self, code: &str, message: &str) -> &Self {
        self.push(Step::ServerError {
            code: code.to_string(),
            message: message.to_string(),
        })
    }

    fn push(&self, step: Step) -> &Self {
        self.state.lock().unwrap().script.push_back(step);
        self
    }

    /// Make every status update that confirms a flush position fail.
    pub fn fail_acknowledgments(&self) {
        self.state.lock().unwrap().fail_acknowledgments = true;
    }

    /// Make `START_REPLICATION` fail with a server error.
    pub fn fail_start(&self, message: impl Into<String>) {
        self.state.lock().unwrap().fail_start = Some(message.into());
    }

    /// Slot and position passed to `start_replication`, if it was called.
    pub fn started(&self) -> Option<(String, Position)> {
        self.state.lock().unwrap().started.clone()
    }

    pub fn status_updates(&self) -> Vec<StatusUpdate> {
        self.state.lock().unwrap().status_updates.clone()
    }

    /// Positions confirmed as flushed, in send order.
    pub fn acknowledged(&self) -> Vec<Position> {
        self.status_updates()
            .into_iter()
            .filter(StatusUpdate::is_acknowledgment)
            .map(|s| s.flush)
            .collect()
    }

    /// Scripted steps never consumed.
    pub fn remaining(&self) -> usize {
        self.state.lock().unwrap().script.len()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap().closed
    }
}

impl ReplicationTransport for MockTransport {
    async fn start_replication(&mut self, slot: &str, start: Position) -> PgResult<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(message) = state.fail_start.clone() {
            return Err(PgError::Server {
                severity: "ERROR".into(),
                code: "55000".into(),
                message,
            });
        }
        state.started = Some((slot.to_string(), start));
        Ok(())
    }

    async fn recv(&mut self, deadline: Instant) -> PgResult<Option<ServerMessage>> {
        let step = {
            let mut state = self.state.lock().unwrap();
            if state.closed {
                return Err(PgError::Connection("connection closed".into()));
            }
            state.script.pop_front()
        };

        match step {
            Some(Step::Message(message)) => Ok(Some(message)),
            Some(Step::ServerError { code, message }) => Err(PgError::Server {
                severity: "ERROR".into(),
                code,
                message,
            }),
            // An idle server: wait out the deadline
            Some(Step::Idle) | None => {
                tokio::time::sleep_until(deadline).await;
                Ok(None)
            }
        }
    }

    async fn send_status(&mut self, status: StatusUpdate) -> PgResult<()> {
        let mut state = self.state.lock().unwrap();
        if state.closed {
            return Err(PgError::Connection("connection closed".into()));
        }
        if state.fail_acknowledgments && status.is_acknowledgment() {
            return Err(PgError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "simulated send failure",
            )));
        }
        state.status_updates.push(status);
        Ok(())
    }

    async fn close(&mut self) -> PgResult<()> {
        self.state.lock().unwrap().closed = true;
        Ok(())
    }
}

/// A snapshot source serving fixed rows per table.
#[derive(Clone, Default)]
pub struct MockSnapshotSource {
    state: Arc<Mutex<MockSnapshotState>>,
}

#[derive(Default)]
struct MockSnapshotState {
    rows: HashMap<TableRef, Vec<RowMap>>,
    snapshotted: Vec<TableRef>,
    fail_table: Option<TableRef>,
}

impl MockSnapshotSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rows(&self, table: TableRef, rows: Vec<RowMap>) -> &Self {
        self.state.lock().unwrap().rows.insert(table, rows);
        self
    }

    /// Make the snapshot of `table` fail after emitting nothing.
    pub fn fail_on(&self, table: TableRef) {
        self.state.lock().unwrap().fail_table = Some(table);
    }

    /// Tables snapshotted so far, in order.
    pub fn snapshotted(&self) -> Vec<TableRef> {
        self.state.lock().unwrap().snapshotted.clone()
    }
}

impl SnapshotSource for MockSnapshotSource {
    async fn snapshot_table(
        &mut self,
        table: &TableRef,
        publisher: &Publisher,
    ) -> PgResult<SnapshotOutcome> {
        let rows = {
            let mut state = self.state.lock().unwrap();
            state.snapshotted.push(table.clone());
            if state.fail_table.as_ref() == Some(table) {
                return Err(PgError::Snapshot {
                    table: table.to_string(),
                    message: "simulated scan failure".into(),
                });
            }
            state.rows.get(table).cloned().unwrap_or_default()
        };

        let mut count = 0;
        for row in rows {
            if !publisher
                .publish(Change::snapshot_insert(table.clone(), row))
                .await
            {
                return Ok(SnapshotOutcome::Interrupted { rows: count });
            }
            count += 1;
        }
        Ok(SnapshotOutcome::Complete { rows: count })
    }
}
