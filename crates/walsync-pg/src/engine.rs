//! The CDC engine: initial snapshots followed by live streaming, handed to a
//! caller-supplied callback through a bounded queue.

use tokio::sync::mpsc;
use tokio_postgres::Client;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use walsync_config::CdcConfig;
use walsync_core::{Change, Position};

use crate::connect::connect_postgres;
use crate::error::{BoxError, PgError, PgResult};
use crate::publish::{Publisher, StopHandle};
use crate::replication::{
    reconcile_position, verify_slot, CheckpointManager, ReplicationConnection, ReplicationSocket,
    ReplicationTransport, StreamEnd,
};
use crate::snapshot::{PgSnapshotter, SnapshotOutcome, SnapshotSource};
use crate::state::{FileStateStore, StateStore};

/// What the callback wants after handling a change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop,
}

/// How a run ended without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// The callback or a [`StopHandle`] asked to stop.
    Stopped,
    /// The server ended the replication stream.
    StreamEnded,
    /// No live change arrived within the configured initial wait.
    InitialWaitElapsed,
}

/// One replication run against one slot.
pub struct CdcEngine<T = ReplicationConnection, N = PgSnapshotter, S = FileStateStore> {
    config: CdcConfig,
    transport: T,
    snapshotter: N,
    store: S,
    resume: Position,
    /// SQL session used for slot verification, held for the run.
    client: Option<Client>,
    stop: CancellationToken,
}

impl<S: StateStore + 'static> CdcEngine<ReplicationConnection, PgSnapshotter, S> {
    /// Verify the slot, reconcile the resume position, then open the
    /// replication connection.
    ///
    /// Nothing is streamed until [`run`](Self::run) is called.
    pub async fn connect(config: CdcConfig, store: S) -> PgResult<Self> {
        info!(
            connection = %config.connection(),
            slot = %config.slot_name(),
            tables = config.tables().len(),
            "Connecting"
        );

        let client = connect_postgres(config.connection()).await?;
        let slot = verify_slot(&client, config.slot_name()).await?;
        let resume = reconcile_position(config.state().lsn, slot.confirmed_flush)?;

        let transport = ReplicationConnection::connect(config.connection()).await?;
        let snapshotter =
            PgSnapshotter::new(config.connection().clone(), config.snapshot_batch_size());

        info!(slot = %config.slot_name(), resume = %resume, "Slot verified");

        Ok(Self {
            config,
            transport,
            snapshotter,
            store,
            resume,
            client: Some(client),
            stop: CancellationToken::new(),
        })
    }
}

impl<T, N, S> CdcEngine<T, N, S>
where
    T: ReplicationTransport + 'static,
    N: SnapshotSource + 'static,
    S: StateStore + 'static,
{
    /// Assemble an engine from already-open parts.
    pub fn from_parts(
        config: CdcConfig,
        transport: T,
        snapshotter: N,
        store: S,
        resume: Position,
    ) -> Self {
        Self {
            config,
            transport,
            snapshotter,
            store,
            resume,
            client: None,
            stop: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &CdcConfig {
        &self.config
    }

    /// Position streaming will start from.
    pub fn resume_position(&self) -> Position {
        self.resume
    }

    /// Handle for stopping the run from another task.
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle::new(self.stop.clone())
    }

    /// Snapshot pending tables, then stream, calling `callback` for every
    /// change in order.
    ///
    /// Returns when the callback stops, a [`StopHandle`] fires, the stream
    /// ends, or something fails. Connections are closed before returning.
    pub async fn run<F>(self, mut callback: F) -> PgResult<RunOutcome>
    where
        F: FnMut(Change) -> Result<Flow, BoxError>,
    {
        let Self {
            config,
            transport,
            snapshotter,
            store,
            resume,
            client,
            stop,
        } = self;

        let (tx, mut rx) = mpsc::channel(config.queue_capacity());
        let publisher = Publisher::new(tx, stop.clone());
        let producer = tokio::spawn(produce(
            config,
            transport,
            snapshotter,
            store,
            resume,
            publisher,
        ));

        let mut stopped = false;
        let mut failure = None;
        while let Some(change) = rx.recv().await {
            if stop.is_cancelled() {
                break;
            }
            match callback(change) {
                Ok(Flow::Continue) => {}
                Ok(Flow::Stop) => {
                    stopped = true;
                    break;
                }
                Err(e) => {
                    failure = Some(PgError::Callback(e));
                    break;
                }
            }
        }

        stop.cancel();
        drop(rx);
        let produced = match producer.await {
            Ok(result) => result,
            Err(e) => Err(PgError::Connection(format!("producer task failed: {}", e))),
        };
        drop(client);

        if let Some(e) = failure {
            return Err(e);
        }
        let end = produced?;
        if stopped {
            return Ok(RunOutcome::Stopped);
        }

        Ok(match end {
            StreamEnd::ServerDone => RunOutcome::StreamEnded,
            StreamEnd::InitialWaitElapsed => RunOutcome::InitialWaitElapsed,
            StreamEnd::Stopped => RunOutcome::Stopped,
        })
    }
}

/// Producer task: snapshots first, then the replication stream. Owns the
/// replication connection and closes it on every exit path.
async fn produce<T, N, S>(
    config: CdcConfig,
    mut transport: T,
    mut snapshotter: N,
    store: S,
    resume: Position,
    publisher: Publisher,
) -> PgResult<StreamEnd>
where
    T: ReplicationTransport,
    N: SnapshotSource,
    S: StateStore,
{
    for table in config.pending_snapshots().iter() {
        if publisher.is_stopped() {
            close_transport(&mut transport).await;
            return Ok(StreamEnd::Stopped);
        }

        match snapshotter.snapshot_table(table, &publisher).await {
            Ok(SnapshotOutcome::Complete { .. }) => {}
            Ok(SnapshotOutcome::Interrupted { rows }) => {
                info!(table = %table, rows, "Snapshot interrupted by stop");
                close_transport(&mut transport).await;
                return Ok(StreamEnd::Stopped);
            }
            Err(e) => {
                close_transport(&mut transport).await;
                return Err(e);
            }
        }
    }

    let checkpoint = CheckpointManager::new(config.state().clone(), config.tables().clone(), store);
    let mut socket = ReplicationSocket::new(&config, transport, checkpoint, resume);
    let result = socket.stream(&publisher).await;
    if let Err(e) = socket.close().await {
        warn!(error = %e, "Error closing replication connection");
    }

    match &result {
        Ok(end) => info!(outcome = ?end, "Replication stream finished"),
        Err(e) => warn!(error = %e, "Replication stream failed"),
    }
    result
}

async fn close_transport<T: ReplicationTransport>(transport: &mut T) {
    if let Err(e) = transport.close().await {
        warn!(error = %e, "Error closing replication connection");
    }
}
