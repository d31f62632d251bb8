mod args;
mod cmd_manager;

use args::{Cli, Commands};
use clap::Parser;
use relkv::identity::WorkerIdentity;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Manager { command } => cmd_manager::cmd_manager(command).await?,
        Commands::Worker {
            database_id,
            relation_id,
            manager_socket,
        } => {
            let identity = WorkerIdentity::new(database_id, relation_id);
            relkv::worker::runtime::run(identity, manager_socket).await?;
        }
    }

    Ok(())
}
