use anyhow::{Context, Result};
use clap::Parser;

mod cli;
mod commands;
mod config;
mod output;

use cli::{Cli, Commands, StateCommands};
use config::load_config;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Logs go to stderr; stdout carries only change records
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(
                "walsync=info"
                    .parse()
                    .context("Invalid default log directive")?,
            ),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Run { max_changes } => commands::cmd_run(config, max_changes).await,
        Commands::Check => commands::cmd_check(config).await,
        Commands::Read {
            table,
            cursor,
            from,
            batch_size,
        } => commands::cmd_read(config, &table, cursor, from, batch_size).await,
        Commands::State { command } => match command {
            StateCommands::Show => commands::cmd_state_show(config).await,
            StateCommands::Clear { yes } => commands::cmd_state_clear(config, yes).await,
        },
    }
}
