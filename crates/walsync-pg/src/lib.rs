mod connect;
pub mod engine;
mod error;
pub mod mock;
mod publish;
pub mod replication;
mod snapshot;
pub mod sql;
pub mod state;
pub mod table_reader;
mod wal2json;

pub use connect::connect_postgres;
pub use engine::{CdcEngine, Flow, RunOutcome};
pub use error::{BoxError, PgError, PgResult};
pub use publish::{Publisher, StopHandle};
pub use snapshot::{PgSnapshotter, SnapshotOutcome, SnapshotSource};
pub use state::{FileStateStore, MemoryStateStore, PostgresStateStore, StateStore};
pub use table_reader::{ReadMode, TableReader};
pub use wal2json::ChangeFilter;
