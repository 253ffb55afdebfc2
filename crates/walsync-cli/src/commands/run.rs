use std::io::Write;

use anyhow::{Context, Result};
use tracing::info;
use walsync_config::SourceConfig;
use walsync_pg::{CdcEngine, FileStateStore, Flow, RunOutcome, StateStore};

use crate::output::write_change;

pub async fn cmd_run(config: SourceConfig, max_changes: Option<u64>) -> Result<()> {
    let state_path = config.state_path();
    let mut store = FileStateStore::new(&state_path);
    let state = store
        .load()
        .await
        .with_context(|| format!("Failed to load replication state from {}", state_path))?;

    let cdc = config
        .into_cdc_config(state)
        .context("Invalid configuration")?;
    let engine = CdcEngine::connect(cdc, store)
        .await
        .context("Failed to start replication")?;

    let stop = engine.stop_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, stopping");
            stop.stop();
        }
    });

    let stdout = std::io::stdout();
    let mut count: u64 = 0;
    let outcome = engine
        .run(|change| {
            let mut out = stdout.lock();
            write_change(&mut out, &change)?;
            out.flush()?;

            count += 1;
            if max_changes.is_some_and(|max| count >= max) {
                return Ok(Flow::Stop);
            }
            Ok(Flow::Continue)
        })
        .await
        .context("Replication failed")?;

    match outcome {
        RunOutcome::Stopped => info!(changes = count, "Stopped"),
        RunOutcome::StreamEnded => info!(changes = count, "Server ended the stream"),
        RunOutcome::InitialWaitElapsed => {
            info!(changes = count, "No changes within the initial wait")
        }
    }
    Ok(())
}
