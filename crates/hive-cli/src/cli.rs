use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(
    name = "hive",
    about = "Build-farm control plane: schedules package builds across a fleet of drones",
    version
)]
pub struct Cli {
    /// Orchestrator URL for the client subcommands.
    #[arg(long, env = "HIVE_URL", global = true, default_value = "http://127.0.0.1:8100")]
    pub remote: String,

    /// Admin key for the client subcommands that need it.
    #[arg(long, env = "HIVE_ADMIN_KEY", global = true)]
    pub admin_key: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the control plane (both listeners plus the background loops).
    Serve {
        /// Path to the YAML settings file.
        #[arg(long, env = "HIVE_CONFIG")]
        config: Option<PathBuf>,
    },

    /// Orchestrator summary.
    Status,

    /// List drones.
    Nodes {
        /// Include offline drones.
        #[arg(long)]
        all: bool,
    },

    /// Tail recent events.
    Events {
        #[arg(long, default_value_t = 50)]
        limit: u32,

        /// Filter by event kind, e.g. blocked or stale-completion.
        #[arg(long)]
        kind: Option<String>,
    },

    /// Submit packages to the build queue.
    Queue {
        /// Package atoms, e.g. dev-libs/openssl-3.2.0.
        packages: Vec<String>,

        /// Session name; generated when omitted.
        #[arg(long)]
        session: Option<String>,
    },

    /// Send an admin control verb (pause, resume, unblock, unground, reset,
    /// rebalance, clear_failures, retry_failures).
    Control { action: String },
}
