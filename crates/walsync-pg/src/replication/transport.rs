use std::future::Future;

use tokio::time::Instant;
use walsync_core::Position;

use super::frame::{ServerMessage, StatusUpdate};
use crate::error::PgResult;

/// The replication-mode half of a source connection.
///
/// Implemented by [`ReplicationConnection`](super::wire::ReplicationConnection)
/// for a live server and by [`MockTransport`](crate::mock::MockTransport) in tests.
pub trait ReplicationTransport: Send {
    /// Issue `START_REPLICATION` for a wal2json slot and enter COPY BOTH mode.
    fn start_replication(
        &mut self,
        slot: &str,
        start: Position,
    ) -> impl Future<Output = PgResult<()>> + Send;

    /// Wait for the next server message until `deadline`.
    ///
    /// Returns `Ok(None)` when the deadline passes first. Must be cancel safe:
    /// dropping the future never loses part of a message.
    fn recv(&mut self, deadline: Instant)
        -> impl Future<Output = PgResult<Option<ServerMessage>>> + Send;

    /// Send a standby status update.
    fn send_status(&mut self, status: StatusUpdate) -> impl Future<Output = PgResult<()>> + Send;

    /// End the stream and close the connection. Safe to call more than once.
    fn close(&mut self) -> impl Future<Output = PgResult<()>> + Send;
}
