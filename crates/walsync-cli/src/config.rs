use std::path::Path;

use anyhow::{Context, Result};
use walsync_config::SourceConfig;

/// Read and parse the config file.
pub fn load_config(path: &Path) -> Result<SourceConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    SourceConfig::parse(&content)
        .with_context(|| format!("Failed to parse {}", path.display()))
}
