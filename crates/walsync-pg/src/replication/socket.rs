//! The streaming half of the replication protocol.
//!
//! One task reads one logical stream in order. Status updates are driven by
//! the standby deadline: when it passes, the newest fully published position
//! is acknowledged, or a keepalive is sent if nothing new arrived.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info};
use walsync_config::CdcConfig;
use walsync_core::Position;

use super::checkpoint::CheckpointManager;
use super::frame::{format_pg_timestamp, ServerMessage, XLogData};
use super::transport::ReplicationTransport;
use crate::error::PgResult;
use crate::publish::Publisher;
use crate::state::StateStore;
use crate::wal2json::ChangeFilter;

/// Why [`ReplicationSocket::stream`] returned without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEnd {
    /// The server ended the COPY stream.
    ServerDone,
    /// No live change arrived within the initial wait.
    InitialWaitElapsed,
    /// A stop was requested or the consumer went away.
    Stopped,
}

/// Replication connection in streaming mode, plus everything needed to turn
/// its frames into published changes and acknowledgments.
pub struct ReplicationSocket<T, S> {
    transport: T,
    checkpoint: CheckpointManager<S>,
    filter: ChangeFilter,
    slot: String,
    resume: Position,
    standby_interval: Duration,
    initial_wait: Option<Duration>,
}

impl<T: ReplicationTransport, S: StateStore> ReplicationSocket<T, S> {
    /// `resume` is the reconciled start position; frames ending at or before
    /// it were acknowledged by an earlier run and are skipped.
    pub fn new(
        config: &CdcConfig,
        transport: T,
        checkpoint: CheckpointManager<S>,
        resume: Position,
    ) -> Self {
        Self {
            transport,
            checkpoint,
            filter: ChangeFilter::new(config.tables().clone()),
            slot: config.slot_name().to_string(),
            resume,
            standby_interval: config.standby_interval(),
            initial_wait: config.initial_wait(),
        }
    }

    /// Start replication and publish changes until the stream ends, the
    /// initial wait elapses, or the publisher is stopped.
    ///
    /// Stopping sends no final acknowledgment; anything published since the
    /// last standby tick is replayed by the next run.
    pub async fn stream(&mut self, publisher: &Publisher) -> PgResult<StreamEnd> {
        self.transport
            .start_replication(&self.slot, self.resume)
            .await?;
        info!(slot = %self.slot, lsn = %self.resume, "Streaming started");

        // Records completed snapshots even if no frame ever arrives
        if self
            .checkpoint
            .record_streams(&mut self.transport, self.resume)
            .await?
        {
            info!(lsn = %self.resume, "Recorded replicated tables");
        }

        let initial_deadline = self.initial_wait.map(|wait| Instant::now() + wait);
        let mut standby_deadline = Some(Instant::now() + self.standby_interval);
        let mut last_seen = self.resume;
        let mut pending: Option<Position> = None;
        let mut published_live = false;

        loop {
            if publisher.is_stopped() {
                return Ok(StreamEnd::Stopped);
            }

            let now = Instant::now();
            if standby_deadline.map_or(true, |deadline| now >= deadline) {
                match pending.take() {
                    Some(position) => {
                        self.checkpoint
                            .acknowledge(&mut self.transport, position)
                            .await?;
                    }
                    None => {
                        self.checkpoint
                            .keepalive(&mut self.transport, last_seen)
                            .await?
                    }
                }
                standby_deadline = Some(Instant::now() + self.standby_interval);
            }

            let initial_deadline = initial_deadline.filter(|_| !published_live);
            if initial_deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                info!(slot = %self.slot, "No changes within the initial wait, closing");
                return Ok(StreamEnd::InitialWaitElapsed);
            }

            let mut wait_until = standby_deadline.unwrap_or_else(Instant::now);
            if let Some(deadline) = initial_deadline {
                wait_until = wait_until.min(deadline);
            }

            let message = tokio::select! {
                biased;
                _ = publisher.cancelled() => return Ok(StreamEnd::Stopped),
                message = self.transport.recv(wait_until) => message?,
            };

            match message {
                None => continue,
                Some(ServerMessage::Keepalive(keepalive)) => {
                    debug!(
                        wal_end = %keepalive.wal_end,
                        server_time = %format_pg_timestamp(keepalive.send_time),
                        reply_requested = keepalive.reply_requested,
                        "Primary keepalive"
                    );
                    if keepalive.reply_requested {
                        standby_deadline = None;
                    }
                }
                Some(ServerMessage::XLogData(frame)) => {
                    let end = frame.end_position();
                    if end <= self.resume {
                        debug!(lsn = %frame.wal_start, resume = %self.resume, "Skipping acknowledged frame");
                        continue;
                    }

                    match publish_frame(&self.filter, &frame, publisher).await? {
                        Some(count) => published_live |= count > 0,
                        None => return Ok(StreamEnd::Stopped),
                    }

                    last_seen = last_seen.max(end);
                    pending = Some(pending.map_or(end, |p| p.max(end)));
                }
                Some(ServerMessage::CopyDone) => {
                    info!(slot = %self.slot, "Server ended the replication stream");
                    return Ok(StreamEnd::ServerDone);
                }
            }
        }
    }

    /// Close the replication connection.
    pub async fn close(&mut self) -> PgResult<()> {
        self.transport.close().await
    }

}

/// Filter one frame and publish its changes in order, stamped with the
/// frame's start position. `None` means the publisher stopped midway.
async fn publish_frame(
    filter: &ChangeFilter,
    frame: &XLogData,
    publisher: &Publisher,
) -> PgResult<Option<usize>> {
    let changes = filter.filter(&frame.data)?;
    let count = changes.len();
    debug!(lsn = %frame.wal_start, bytes = frame.data.len(), changes = count, "XLogData");

    for mut change in changes {
        change.position = Some(frame.wal_start);
        if !publisher.publish(change).await {
            return Ok(None);
        }
    }
    Ok(Some(count))
}
