use std::time::Duration;

use serde::Deserialize;
use walsync_core::{ReplicationState, TableRef, TableSet};

use crate::connection::{ConnectionConfig, SslMode};
use crate::env::resolve_env;
use crate::error::{ConfigError, ConfigResult};
use crate::validation::CdcConfig;

/// Raw configuration as parsed from `walsync.toml`.
#[derive(Debug, Deserialize)]
pub struct SourceConfig {
    /// Source database connection.
    pub connection: ConnectionSection,
    /// Replication slot and streaming settings.
    pub replication: ReplicationSection,
    /// Tables to replicate, as `schema.table`.
    pub tables: Vec<String>,
    /// Tables that need an initial snapshot. Defaults to all of `tables`.
    #[serde(default)]
    pub full_sync: Option<Vec<String>>,
    /// Where the CLI keeps the replication checkpoint.
    #[serde(default)]
    pub state: StateSection,
}

/// Connection settings. Either `url` or the individual fields.
#[derive(Debug, Default, Deserialize)]
pub struct ConnectionSection {
    pub url: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub database: Option<String>,
    #[serde(default)]
    pub ssl_mode: SslMode,
}

#[derive(Debug, Deserialize)]
pub struct ReplicationSection {
    /// Name of a pre-provisioned wal2json logical replication slot.
    pub slot: String,
    /// Give up cleanly if no change arrives within this many seconds.
    #[serde(default)]
    pub initial_wait_secs: Option<u64>,
    #[serde(default = "default_standby_interval_secs")]
    pub standby_interval_secs: u64,
    #[serde(default = "default_snapshot_batch_size")]
    pub snapshot_batch_size: u32,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

#[derive(Debug, Deserialize)]
pub struct StateSection {
    #[serde(default = "default_state_path")]
    pub path: String,
}

impl Default for StateSection {
    fn default() -> Self {
        Self {
            path: default_state_path(),
        }
    }
}

fn default_standby_interval_secs() -> u64 {
    10
}

fn default_snapshot_batch_size() -> u32 {
    10_000
}

fn default_queue_capacity() -> usize {
    16
}

fn default_state_path() -> String {
    "walsync.state.json".to_string()
}

impl SourceConfig {
    /// Parse a configuration from a TOML string.
    pub fn parse(toml_str: &str) -> ConfigResult<Self> {
        let config: SourceConfig = toml::from_str(toml_str)?;
        Ok(config)
    }

    /// Resolve `${VAR}` references and build validated connection parameters.
    pub fn connection_config(&self) -> ConfigResult<ConnectionConfig> {
        let section = &self.connection;

        if let Some(url) = &section.url {
            return ConnectionConfig::from_url(&resolve_env(url));
        }

        let required = |value: &Option<String>, field: &str| {
            value
                .as_deref()
                .map(resolve_env)
                .ok_or_else(|| ConfigError::MissingField {
                    field: format!("connection.{}", field),
                })
        };

        ConnectionConfig::new(
            required(&section.host, "host")?,
            section.port.unwrap_or(5432),
            required(&section.user, "user")?,
            section.password.as_deref().map(resolve_env).unwrap_or_default(),
            required(&section.database, "database")?,
            section.ssl_mode,
        )
    }

    pub fn table_set(&self) -> ConfigResult<TableSet> {
        parse_tables(&self.tables)
    }

    pub fn full_sync_set(&self) -> ConfigResult<TableSet> {
        match &self.full_sync {
            Some(tables) => parse_tables(tables),
            None => self.table_set(),
        }
    }

    pub fn state_path(&self) -> String {
        resolve_env(&self.state.path)
    }

    /// Validate everything and combine with the prior checkpoint.
    pub fn into_cdc_config(self, state: ReplicationState) -> ConfigResult<CdcConfig> {
        let replication = &self.replication;

        CdcConfig::builder(self.connection_config()?, &replication.slot)
            .tables(self.table_set()?)
            .full_sync(self.full_sync_set()?)
            .initial_wait(
                replication
                    .initial_wait_secs
                    .filter(|secs| *secs > 0)
                    .map(Duration::from_secs),
            )
            .standby_interval(Duration::from_secs(replication.standby_interval_secs))
            .snapshot_batch_size(replication.snapshot_batch_size)
            .queue_capacity(replication.queue_capacity)
            .state(state)
            .build()
    }
}

fn parse_tables(tables: &[String]) -> ConfigResult<TableSet> {
    tables
        .iter()
        .map(|t| TableRef::parse(t).map_err(ConfigError::from))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
tables = ["public.orders"]

[connection]
host = "localhost"
user = "postgres"
database = "shop"

[replication]
slot = "walsync"
"#;

    #[test]
    fn test_parse_minimal() {
        let config = SourceConfig::parse(MINIMAL).unwrap();
        assert_eq!(config.replication.slot, "walsync");
        assert_eq!(config.replication.standby_interval_secs, 10);
        assert_eq!(config.replication.queue_capacity, 16);
        assert_eq!(config.state.path, "walsync.state.json");

        let cdc = config.into_cdc_config(ReplicationState::default()).unwrap();
        assert_eq!(cdc.tables().len(), 1);
        // full_sync defaults to every replicated table
        assert_eq!(cdc.full_sync(), cdc.tables());
        assert_eq!(cdc.initial_wait(), None);
        assert_eq!(cdc.connection().port, 5432);
    }

    #[test]
    fn test_parse_url_and_env() {
        std::env::set_var("WALSYNC_TEST_DB_URL", "postgres://app:pw@db:5433/shop");
        let toml = r#"
tables = ["public.orders", "public.users"]
full_sync = ["public.users"]

[connection]
url = "${WALSYNC_TEST_DB_URL}"

[replication]
slot = "walsync_slot"
initial_wait_secs = 30
queue_capacity = 4

[state]
path = "/var/lib/walsync/state.json"
"#;
        let config = SourceConfig::parse(toml).unwrap();
        assert_eq!(config.state_path(), "/var/lib/walsync/state.json");

        let cdc = config.into_cdc_config(ReplicationState::default()).unwrap();
        assert_eq!(cdc.connection().host, "db");
        assert_eq!(cdc.connection().port, 5433);
        assert_eq!(cdc.initial_wait(), Some(Duration::from_secs(30)));
        assert_eq!(cdc.queue_capacity(), 4);
        assert!(cdc.full_sync().contains(&TableRef::new("public", "users")));
        assert!(!cdc.full_sync().contains(&TableRef::new("public", "orders")));
    }

    #[test]
    fn test_full_sync_outside_tables_rejected() {
        let toml = MINIMAL.replace(
            "tables = [\"public.orders\"]",
            "tables = [\"public.orders\"]\nfull_sync = [\"public.users\"]",
        );
        let config = SourceConfig::parse(&toml).unwrap();
        let err = config
            .into_cdc_config(ReplicationState::default())
            .unwrap_err();
        assert!(matches!(err, ConfigError::FullSyncNotSubset { table } if table == "public.users"));
    }

    #[test]
    fn test_missing_connection_field() {
        let toml = MINIMAL.replace("host = \"localhost\"\n", "");
        let config = SourceConfig::parse(&toml).unwrap();
        assert!(matches!(
            config.connection_config(),
            Err(ConfigError::MissingField { field }) if field == "connection.host"
        ));
    }

    #[test]
    fn test_zero_initial_wait_disables_timer() {
        let toml = MINIMAL.replace("slot = \"walsync\"", "slot = \"walsync\"\ninitial_wait_secs = 0");
        let cdc = SourceConfig::parse(&toml)
            .unwrap()
            .into_cdc_config(ReplicationState::default())
            .unwrap();
        assert_eq!(cdc.initial_wait(), None);
    }

    #[test]
    fn test_zero_standby_interval_rejected() {
        let toml = MINIMAL.replace("slot = \"walsync\"", "slot = \"walsync\"\nstandby_interval_secs = 0");
        let err = SourceConfig::parse(&toml)
            .unwrap()
            .into_cdc_config(ReplicationState::default())
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidStandbyInterval));
    }

    #[test]
    fn test_invalid_toml() {
        assert!(matches!(
            SourceConfig::parse("tables = ["),
            Err(ConfigError::ParseError(_))
        ));
    }
}
