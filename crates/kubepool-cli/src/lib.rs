//! kubepool CLI library

pub mod commands;
pub mod config;
pub mod error;

pub use error::{Error, Result};

use clap::{Parser, Subcommand};
use kubepool_common::telemetry::LogFormat;

/// kubepool - bootstrap VM scale-set pools into kubeadm clusters
#[derive(Parser, Debug)]
#[command(name = "kubepool")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Log output format (text or json)
    #[arg(long, env = "KUBEPOOL_LOG_FORMAT", default_value = "text", global = true)]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run one bootstrap pass over a pool
    Bootstrap(commands::bootstrap::BootstrapArgs),
    /// Show what a pass would observe about the cluster
    Status(commands::status::StatusArgs),
    /// Write the published admin kubeconfig to a file
    Kubeconfig(commands::kubeconfig::KubeconfigArgs),
}

impl Cli {
    /// Run the CLI command
    pub async fn run(self) -> Result<()> {
        match self.command {
            Commands::Bootstrap(args) => commands::bootstrap::run(args).await,
            Commands::Status(args) => commands::status::run(args).await,
            Commands::Kubeconfig(args) => commands::kubeconfig::run(args).await,
        }
    }
}
