use thiserror::Error;

/// Errors that can occur in walsync-core.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid position '{0}': expected X/Y hexadecimal form")]
    InvalidPosition(String),

    #[error("invalid table reference '{0}': expected schema.table")]
    InvalidTableRef(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
