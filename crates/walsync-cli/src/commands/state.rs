use anyhow::{bail, Context, Result};
use walsync_config::SourceConfig;
use walsync_pg::{FileStateStore, StateStore};

pub async fn cmd_state_show(config: SourceConfig) -> Result<()> {
    let state_path = config.state_path();
    let state = FileStateStore::new(&state_path)
        .load()
        .await
        .with_context(|| format!("Failed to load replication state from {}", state_path))?;

    if state.is_empty() {
        println!("No replication state found. Run 'walsync run' to start streaming.");
        return Ok(());
    }

    println!("{}", serde_json::to_string_pretty(&state)?);
    Ok(())
}

pub async fn cmd_state_clear(config: SourceConfig, yes: bool) -> Result<()> {
    let state_path = config.state_path();
    if !yes {
        bail!(
            "Refusing to delete {} without --yes.\n\
             The next run will snapshot every full-sync table again.",
            state_path
        );
    }

    match tokio::fs::remove_file(&state_path).await {
        Ok(()) => println!("Deleted {}", state_path),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            println!("No state file at {}", state_path)
        }
        Err(e) => return Err(e).with_context(|| format!("Failed to delete {}", state_path)),
    }
    Ok(())
}
