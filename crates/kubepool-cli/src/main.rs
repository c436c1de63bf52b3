//! kubepool CLI
//!
//! Turns a scale-set pool into kubeadm control-plane or worker nodes.

use clap::Parser;

use kubepool_cli::{Cli, Result};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    kubepool_common::telemetry::init_logging(cli.log_format)?;
    cli.run().await
}
