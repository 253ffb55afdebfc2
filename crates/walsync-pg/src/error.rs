use thiserror::Error;
use walsync_config::ConfigError;
use walsync_core::Position;

/// Boxed error returned by a change callback.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Error)]
pub enum PgError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("postgres error: {0}")]
    Postgres(String),

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("replication slot '{0}' does not exist")]
    SlotNotFound(String),

    #[error("replication slot '{slot}' uses plugin '{plugin}', expected wal2json")]
    SlotPluginMismatch { slot: String, plugin: String },

    #[error("invalid LSN format: {0}")]
    InvalidPosition(String),

    #[error("persisted position {persisted} is ahead of slot position {server}")]
    PositionDrift { persisted: Position, server: Position },

    #[error("replication protocol error: {0}")]
    Protocol(String),

    #[error("server error: {severity}: {message} (code: {code})")]
    Server {
        severity: String,
        code: String,
        message: String,
    },

    #[error("wal2json decode error: {0}")]
    Decode(String),

    #[error("snapshot of {table} failed: {message}")]
    Snapshot { table: String, message: String },

    #[error("failed to acknowledge position: {0}")]
    Acknowledge(String),

    #[error("state store error: {0}")]
    StateStore(String),

    #[error("failed to read {schema}.{table}: {message} (statement: {statement})")]
    ReadTable {
        schema: String,
        table: String,
        statement: String,
        message: String,
    },

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("change callback failed: {0}")]
    Callback(#[source] BoxError),
}

impl From<tokio_postgres::Error> for PgError {
    fn from(e: tokio_postgres::Error) -> Self {
        // Extract database error details if available
        if let Some(db_err) = e.as_db_error() {
            let msg = format!(
                "{}: {} (code: {})",
                db_err.severity(),
                db_err.message(),
                db_err.code().code()
            );
            PgError::Postgres(msg)
        } else {
            PgError::Postgres(e.to_string())
        }
    }
}

impl From<walsync_core::Error> for PgError {
    fn from(e: walsync_core::Error) -> Self {
        match e {
            walsync_core::Error::InvalidPosition(text) => PgError::InvalidPosition(text),
            walsync_core::Error::Serialization(e) => PgError::Json(e),
            other => PgError::Config(ConfigError::InvalidTableRef(other)),
        }
    }
}

pub type PgResult<T> = Result<T, PgError>;
