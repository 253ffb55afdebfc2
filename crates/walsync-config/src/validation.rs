use std::time::Duration;

use walsync_core::{ReplicationState, TableSet};

use crate::connection::ConnectionConfig;
use crate::error::{ConfigError, ConfigResult};

const MAX_SLOT_NAME_LEN: usize = 63;
const MAX_QUEUE_CAPACITY: usize = 100;

/// The validated configuration of one engine run. Immutable once built.
#[derive(Debug, Clone)]
pub struct CdcConfig {
    connection: ConnectionConfig,
    slot_name: String,
    tables: TableSet,
    full_sync: TableSet,
    initial_wait: Option<Duration>,
    standby_interval: Duration,
    snapshot_batch_size: u32,
    queue_capacity: usize,
    state: ReplicationState,
}

impl CdcConfig {
    pub fn builder(connection: ConnectionConfig, slot_name: impl Into<String>) -> CdcConfigBuilder {
        CdcConfigBuilder {
            connection,
            slot_name: slot_name.into(),
            tables: TableSet::new(),
            full_sync: None,
            initial_wait: None,
            standby_interval: Duration::from_secs(10),
            snapshot_batch_size: 10_000,
            queue_capacity: 16,
            state: ReplicationState::default(),
        }
    }

    pub fn connection(&self) -> &ConnectionConfig {
        &self.connection
    }

    pub fn slot_name(&self) -> &str {
        &self.slot_name
    }

    pub fn tables(&self) -> &TableSet {
        &self.tables
    }

    pub fn full_sync(&self) -> &TableSet {
        &self.full_sync
    }

    pub fn initial_wait(&self) -> Option<Duration> {
        self.initial_wait
    }

    pub fn standby_interval(&self) -> Duration {
        self.standby_interval
    }

    pub fn snapshot_batch_size(&self) -> u32 {
        self.snapshot_batch_size
    }

    pub fn queue_capacity(&self) -> usize {
        self.queue_capacity
    }

    /// The checkpoint this run resumes from.
    pub fn state(&self) -> &ReplicationState {
        &self.state
    }

    /// Full-sync tables that have not completed a snapshot in a prior run.
    pub fn pending_snapshots(&self) -> TableSet {
        self.full_sync
            .iter()
            .filter(|t| !self.state.has_snapshot(t))
            .cloned()
            .collect()
    }
}

/// Builder for [`CdcConfig`]; `build` enforces every invariant.
#[derive(Debug)]
pub struct CdcConfigBuilder {
    connection: ConnectionConfig,
    slot_name: String,
    tables: TableSet,
    full_sync: Option<TableSet>,
    initial_wait: Option<Duration>,
    standby_interval: Duration,
    snapshot_batch_size: u32,
    queue_capacity: usize,
    state: ReplicationState,
}

impl CdcConfigBuilder {
    pub fn tables(mut self, tables: TableSet) -> Self {
        self.tables = tables;
        self
    }

    /// Defaults to every replicated table when not set.
    pub fn full_sync(mut self, full_sync: TableSet) -> Self {
        self.full_sync = Some(full_sync);
        self
    }

    pub fn initial_wait(mut self, initial_wait: Option<Duration>) -> Self {
        self.initial_wait = initial_wait;
        self
    }

    pub fn standby_interval(mut self, interval: Duration) -> Self {
        self.standby_interval = interval;
        self
    }

    pub fn snapshot_batch_size(mut self, size: u32) -> Self {
        self.snapshot_batch_size = size;
        self
    }

    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn state(mut self, state: ReplicationState) -> Self {
        self.state = state;
        self
    }

    pub fn build(self) -> ConfigResult<CdcConfig> {
        validate_slot_name(&self.slot_name)?;

        if self.tables.is_empty() {
            return Err(ConfigError::EmptyTableSet);
        }

        let full_sync = self.full_sync.unwrap_or_else(|| self.tables.clone());
        if let Some(table) = full_sync.difference(&self.tables).next() {
            return Err(ConfigError::FullSyncNotSubset {
                table: table.to_string(),
            });
        }

        if self.queue_capacity == 0 || self.queue_capacity > MAX_QUEUE_CAPACITY {
            return Err(ConfigError::InvalidQueueCapacity(self.queue_capacity));
        }

        if self.snapshot_batch_size == 0 {
            return Err(ConfigError::InvalidBatchSize);
        }

        if self.standby_interval.is_zero() {
            return Err(ConfigError::InvalidStandbyInterval);
        }

        Ok(CdcConfig {
            connection: self.connection,
            slot_name: self.slot_name,
            tables: self.tables,
            full_sync,
            initial_wait: self.initial_wait.filter(|d| !d.is_zero()),
            standby_interval: self.standby_interval,
            snapshot_batch_size: self.snapshot_batch_size,
            queue_capacity: self.queue_capacity,
            state: self.state,
        })
    }
}

/// Slot names end up verbatim in replication commands, so only the
/// characters Postgres itself allows are accepted.
pub fn validate_slot_name(name: &str) -> ConfigResult<()> {
    let valid = !name.is_empty()
        && name.len() <= MAX_SLOT_NAME_LEN
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');

    if valid {
        Ok(())
    } else {
        Err(ConfigError::InvalidSlotName(name.to_string()))
    }
}
