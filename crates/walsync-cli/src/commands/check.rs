use anyhow::{Context, Result};
use walsync_config::SourceConfig;
use walsync_pg::replication::{
    reconcile_position, verify_slot, ReplicationConnection, ReplicationTransport,
};
use walsync_pg::{connect_postgres, FileStateStore, StateStore};

pub async fn cmd_check(config: SourceConfig) -> Result<()> {
    let state_path = config.state_path();
    let state = FileStateStore::new(&state_path)
        .load()
        .await
        .with_context(|| format!("Failed to load replication state from {}", state_path))?;

    let cdc = config
        .into_cdc_config(state)
        .context("Invalid configuration")?;

    let client = connect_postgres(cdc.connection())
        .await
        .with_context(|| format!("Failed to connect to {}", cdc.connection()))?;
    let slot = verify_slot(&client, cdc.slot_name()).await?;
    let resume = reconcile_position(cdc.state().lsn, slot.confirmed_flush)?;

    let mut replication = ReplicationConnection::connect(cdc.connection())
        .await
        .context("Failed to open replication connection")?;
    let system = replication.identify_system().await?;
    replication.close().await?;

    println!("\nSource:");
    println!("  {:<20} {}", "connection", cdc.connection());
    println!("  {:<20} {}", "system id", system.system_id);
    println!("  {:<20} {}", "timeline", system.timeline);
    println!("  {:<20} {}", "current position", system.xlog_pos);

    println!("\nSlot:");
    println!("  {:<20} {}", "name", slot.name);
    println!(
        "  {:<20} {}",
        "confirmed flush",
        slot.confirmed_flush
            .map(|p| p.to_string())
            .unwrap_or_else(|| "-".into())
    );
    println!("  {:<20} {}", "resume from", resume);

    println!("\nTables:");
    for table in cdc.tables() {
        let status = if cdc.state().has_snapshot(table) {
            "streaming"
        } else if cdc.full_sync().contains(table) {
            "snapshot pending"
        } else {
            "streaming (no snapshot)"
        };
        println!("  {:<40} {}", table.to_string(), status);
    }
    println!();

    Ok(())
}
