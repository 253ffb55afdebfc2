mod connection;
mod env;
mod error;
mod source;
mod validation;

pub use connection::{ConnectionConfig, SslMode};
pub use env::resolve_env;
pub use error::{ConfigError, ConfigResult};
pub use source::{ConnectionSection, ReplicationSection, SourceConfig, StateSection};
pub use validation::{validate_slot_name, CdcConfig, CdcConfigBuilder};
