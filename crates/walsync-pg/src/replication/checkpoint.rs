use tracing::{debug, info};
use walsync_core::{Position, ReplicationState, TableSet};

use super::frame::StatusUpdate;
use super::transport::ReplicationTransport;
use crate::error::{PgError, PgResult};
use crate::state::StateStore;

/// Sole writer of [`ReplicationState`].
///
/// State only moves forward after the server has accepted a standby status
/// update confirming the new position.
pub struct CheckpointManager<S> {
    state: ReplicationState,
    streams: TableSet,
    store: S,
}

impl<S: StateStore> CheckpointManager<S> {
    /// `streams` are the tables this run replicates; they are recorded in the
    /// state with the first successful acknowledgment.
    pub fn new(state: ReplicationState, streams: TableSet, store: S) -> Self {
        Self {
            state,
            streams,
            store,
        }
    }

    pub fn state(&self) -> &ReplicationState {
        &self.state
    }

    pub fn last_acknowledged(&self) -> Option<Position> {
        self.state.lsn
    }

    /// Whether this run replicates tables the saved state has not recorded
    /// yet, i.e. tables whose snapshot is not on record.
    pub fn needs_streams(&self) -> bool {
        !self.streams.is_subset(&self.state.streams)
    }

    /// Confirm `position` to the server and persist it.
    ///
    /// Returns `false` when `position` is not past the last acknowledgment;
    /// a keepalive is sent instead so the server still hears from us.
    pub async fn acknowledge<T: ReplicationTransport>(
        &mut self,
        transport: &mut T,
        position: Position,
    ) -> PgResult<bool> {
        if self.state.lsn.is_some_and(|acked| position <= acked) {
            self.keepalive(transport, position).await?;
            return Ok(false);
        }

        self.confirm(transport, position).await?;
        Ok(true)
    }

    /// Record this run's streams at the already-confirmed `position`, even
    /// if no newer position has been seen yet.
    ///
    /// Does nothing when the streams are on record, `position` is zero, or
    /// `position` is behind the last acknowledgment.
    pub async fn record_streams<T: ReplicationTransport>(
        &mut self,
        transport: &mut T,
        position: Position,
    ) -> PgResult<bool> {
        if !self.needs_streams()
            || position.is_zero()
            || self.state.lsn.is_some_and(|acked| position < acked)
        {
            return Ok(false);
        }

        self.confirm(transport, position).await?;
        Ok(true)
    }

    async fn confirm<T: ReplicationTransport>(
        &mut self,
        transport: &mut T,
        position: Position,
    ) -> PgResult<()> {
        transport
            .send_status(StatusUpdate::acknowledge(position))
            .await
            .map_err(|e| PgError::Acknowledge(e.to_string()))?;

        let mut next = self.state.clone();
        next.lsn = Some(position);
        next.streams.extend(&self.streams);
        self.store.save(&next).await?;
        self.state = next;

        info!(lsn = %position, "Acknowledged position");
        Ok(())
    }

    /// Report `last_seen` as the write position without confirming a flush.
    pub async fn keepalive<T: ReplicationTransport>(
        &self,
        transport: &mut T,
        last_seen: Position,
    ) -> PgResult<()> {
        debug!(lsn = %last_seen, "Sending keepalive");
        transport
            .send_status(StatusUpdate::keepalive(last_seen))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockTransport;
    use crate::state::MemoryStateStore;
    use walsync_core::TableRef;

    fn streams() -> TableSet {
        [TableRef::new("public", "orders")].into_iter().collect()
    }

    #[tokio::test]
    async fn test_acknowledge_persists_after_send() {
        let store = MemoryStateStore::default();
        let mut transport = MockTransport::new();
        let mut checkpoint =
            CheckpointManager::new(ReplicationState::default(), streams(), store.clone());

        assert!(checkpoint
            .acknowledge(&mut transport, Position::new(0x100))
            .await
            .unwrap());

        assert_eq!(transport.acknowledged(), vec![Position::new(0x100)]);
        let saved = store.current();
        assert_eq!(saved.lsn, Some(Position::new(0x100)));
        assert!(saved.has_snapshot(&TableRef::new("public", "orders")));
        assert_eq!(checkpoint.last_acknowledged(), Some(Position::new(0x100)));
    }

    #[tokio::test]
    async fn test_failed_send_leaves_state_unchanged() {
        let prior = ReplicationState {
            lsn: Some(Position::new(0x50)),
            ..Default::default()
        };
        let store = MemoryStateStore::new(prior.clone());
        let mut transport = MockTransport::new();
        transport.fail_acknowledgments();
        let mut checkpoint = CheckpointManager::new(prior.clone(), streams(), store.clone());

        let err = checkpoint
            .acknowledge(&mut transport, Position::new(0x100))
            .await
            .unwrap_err();

        assert!(matches!(err, PgError::Acknowledge(_)));
        assert_eq!(checkpoint.state(), &prior);
        assert_eq!(store.current(), prior);
        assert_eq!(store.save_count(), 0);
    }

    #[tokio::test]
    async fn test_stale_position_sends_keepalive() {
        let prior = ReplicationState {
            lsn: Some(Position::new(0x100)),
            ..Default::default()
        };
        let store = MemoryStateStore::new(prior.clone());
        let mut transport = MockTransport::new();
        let mut checkpoint = CheckpointManager::new(prior, streams(), store.clone());

        assert!(!checkpoint
            .acknowledge(&mut transport, Position::new(0x100))
            .await
            .unwrap());

        let updates = transport.status_updates();
        assert_eq!(updates.len(), 1);
        assert!(!updates[0].is_acknowledgment());
        assert_eq!(store.save_count(), 0);
    }

    #[tokio::test]
    async fn test_record_streams_at_confirmed_position() {
        let prior = ReplicationState {
            lsn: Some(Position::new(0x100)),
            ..Default::default()
        };
        let store = MemoryStateStore::new(prior.clone());
        let mut transport = MockTransport::new();
        let mut checkpoint = CheckpointManager::new(prior, streams(), store.clone());
        assert!(checkpoint.needs_streams());

        assert!(checkpoint
            .record_streams(&mut transport, Position::new(0x100))
            .await
            .unwrap());
        assert_eq!(transport.acknowledged(), vec![Position::new(0x100)]);
        assert!(store.current().has_snapshot(&TableRef::new("public", "orders")));
        assert!(!checkpoint.needs_streams());

        // Already on record
        assert!(!checkpoint
            .record_streams(&mut transport, Position::new(0x200))
            .await
            .unwrap());
        assert_eq!(store.save_count(), 1);
    }

    #[tokio::test]
    async fn test_record_streams_skips_zero_and_older_positions() {
        let prior = ReplicationState {
            lsn: Some(Position::new(0x100)),
            ..Default::default()
        };
        let store = MemoryStateStore::new(prior.clone());
        let mut transport = MockTransport::new();
        let mut checkpoint = CheckpointManager::new(prior, streams(), store.clone());

        for position in [Position::ZERO, Position::new(0x80)] {
            assert!(!checkpoint
                .record_streams(&mut transport, position)
                .await
                .unwrap());
        }
        assert!(transport.status_updates().is_empty());
        assert_eq!(store.save_count(), 0);
    }
}
