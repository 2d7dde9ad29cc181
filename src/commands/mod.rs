//! CLI surface: argument parsing, logging setup, subcommand dispatch.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use incus_azure_pipelines::config;

mod logs;
mod provision;
mod run;
mod set_token;

/// Run Azure Pipelines agents powered by Incus.
#[derive(Parser, Debug)]
#[command(name = "incus-azure-pipelines", version)]
#[command(about = "Run Azure Pipelines agents powered by Incus")]
pub struct Cli {
    /// Path to the config file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log level.
    #[arg(
        long,
        short = 'l',
        global = true,
        default_value = "info",
        value_parser = ["debug", "info", "warn", "error"],
    )]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the daemon.
    Run(run::RunCmd),

    /// Provision an image to use for the agent containers.
    Provision(provision::ProvisionCmd),

    /// Output the worker log of one agent.
    Logs(logs::LogsCmd),

    /// Store a PAT in the system keyring for a pool.
    SetToken(set_token::SetTokenCmd),
}

impl Cli {
    pub async fn run(self) -> Result<()> {
        init_logging(&self.log_level);

        let config_path = match self.config {
            Some(path) => path,
            None => config::default_config_path()
                .context("cannot determine home directory, use --config")?,
        };

        match self.command {
            Commands::Run(cmd) => cmd.run(&config_path).await,
            Commands::Provision(cmd) => cmd.run().await,
            Commands::Logs(cmd) => cmd.run(&config_path).await,
            Commands::SetToken(cmd) => cmd.run().await,
        }
    }
}

/// Logs go to stderr so subcommand output (e.g. `logs`) owns stdout.
/// `RUST_LOG` overrides the CLI flag when set.
fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}
