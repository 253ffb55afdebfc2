use thiserror::Error;

/// Errors that can occur when parsing or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("missing required field: {field}")]
    MissingField { field: String },

    #[error("invalid connection settings: {0}")]
    InvalidConnection(String),

    #[error("invalid table reference: {0}")]
    InvalidTableRef(#[from] walsync_core::Error),

    #[error("full-sync table '{table}' is not in the replicated table set")]
    FullSyncNotSubset { table: String },

    #[error("at least one table must be replicated")]
    EmptyTableSet,

    #[error("invalid replication slot name '{0}': expected 1-63 lowercase letters, digits or underscores")]
    InvalidSlotName(String),

    #[error("queue capacity must be between 1 and 100, got {0}")]
    InvalidQueueCapacity(usize),

    #[error("snapshot batch size must be positive")]
    InvalidBatchSize,

    #[error("standby status interval must be positive")]
    InvalidStandbyInterval,
}

pub type ConfigResult<T> = Result<T, ConfigError>;
