mod cli;
mod commands;
mod output;
mod serve;

use std::process::ExitCode;

use clap::Parser;
use cli::{Cli, Command};
use tracing_subscriber::EnvFilter;

/// A failure plus the process exit code it maps to:
/// 1 general, 2 invalid arguments, 3 dependency failure, 4 auth
/// misconfiguration. (Argument parse errors exit 2 via clap itself.)
pub struct CliFailure {
    pub code: u8,
    pub source: anyhow::Error,
}

impl CliFailure {
    pub fn new(code: u8, source: anyhow::Error) -> Self {
        Self { code, source }
    }
}

fn general(e: anyhow::Error) -> CliFailure {
    CliFailure::new(1, e)
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // `serve` installs its own subscriber once it knows the log paths.
    if !matches!(cli.command, Command::Serve { .. }) {
        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_target(false)
            .init();
    }

    let result = match cli.command {
        Command::Serve { config } => serve::serve(config.as_deref()).await,
        Command::Status => commands::status(&cli.remote).await.map_err(general),
        Command::Nodes { all } => commands::nodes(&cli.remote, all).await.map_err(general),
        Command::Events { limit, kind } => commands::events(&cli.remote, limit, kind.as_deref())
            .await
            .map_err(general),
        Command::Queue { packages, session } => {
            commands::queue(&cli.remote, cli.admin_key.as_deref(), packages, session)
                .await
                .map_err(general)
        }
        Command::Control { action } => {
            commands::control(&cli.remote, cli.admin_key.as_deref(), &action)
                .await
                .map_err(general)
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {:#}", e.source);
            ExitCode::from(e.code)
        }
    }
}
