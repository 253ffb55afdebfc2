//! Logical replication over a wal2json slot.
//!
//! The raw protocol client lives in `wire`, message framing in `frame`, and
//! the streaming loop that ties them to the change filter in `socket`.

mod checkpoint;
mod frame;
mod slot;
mod socket;
mod transport;
mod wire;

pub use checkpoint::CheckpointManager;
pub use frame::{format_pg_timestamp, Keepalive, ServerMessage, StatusUpdate, XLogData};
pub use slot::{get_slot, reconcile_position, verify_slot, SlotInfo};
pub use socket::{ReplicationSocket, StreamEnd};
pub use transport::ReplicationTransport;
pub use wire::{ReplicationConnection, SystemInfo};
