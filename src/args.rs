use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "relkv")]
#[command(version)]
#[command(about = "Process manager and router for per-relation KV workers", long_about = None)]
pub(crate) struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Manage the worker-manager process
    Manager {
        #[command(subcommand)]
        command: ManagerCommands,
    },

    /// Run as a worker process (spawned by the manager, not by hand)
    #[command(hide = true)]
    Worker {
        /// Database the worker serves
        #[arg(long)]
        database_id: u32,

        /// Relation the worker serves
        #[arg(long)]
        relation_id: u32,

        /// Manager socket to report readiness to
        #[arg(long)]
        manager_socket: std::path::PathBuf,
    },
}

#[derive(Subcommand)]
pub(crate) enum ManagerCommands {
    /// Run the manager in the foreground
    Run,

    /// Start the manager in the background
    Start,

    /// Stop the manager (and every worker it owns)
    Stop {
        /// Kill without waiting for workers to stop gracefully
        #[arg(short, long)]
        force: bool,
    },

    /// Show manager status and live workers
    Status,
}
