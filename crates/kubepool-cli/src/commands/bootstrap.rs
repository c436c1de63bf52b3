//! `kubepool bootstrap` - run one pass over a pool
//!
//! Every instance of the pool ends up as a control-plane or worker node, or
//! the pass stops at the first instance that could not get there. Re-running
//! after a failure is safe: finished nodes are recognized and skipped.

use std::sync::Arc;

use clap::{Args, ValueEnum};
use tracing::info;

use kubepool_pool::{PassReport, PoolBootstrapper, SshShell, TcpProbe};

use super::{coordination_store, provisioner, AzureTokenArgs, ConfigArgs};
use crate::Result;

/// Run one bootstrap pass over a pool
#[derive(Args, Debug)]
pub struct BootstrapArgs {
    #[command(flatten)]
    pub config: ConfigArgs,

    #[command(flatten)]
    pub tokens: AzureTokenArgs,

    /// Report format
    #[arg(short, long, default_value = "table")]
    pub output: OutputFormat,
}

/// Output format
#[derive(Clone, Debug, Default, ValueEnum)]
pub enum OutputFormat {
    /// Columnar table (default)
    #[default]
    Table,
    /// JSON
    Json,
}

pub async fn run(args: BootstrapArgs) -> Result<()> {
    let config = args.config.load()?;

    let mut shell =
        SshShell::new(&config.ssh.user).with_connect_timeout(config.ssh.connect_timeout());
    if let Some(key) = config.ssh.resolved_identity_file()? {
        shell = shell.with_identity_file(key);
    }

    let bootstrapper = PoolBootstrapper::new(
        provisioner(&config, &args.tokens.azure_token)?,
        coordination_store(&config, &args.tokens.keyvault_token)?,
        Arc::new(shell),
        Arc::new(TcpProbe),
        config.timings.clone(),
        config.kubernetes.clone(),
    );

    info!(
        cluster = %config.pool.cluster,
        pool = %config.pool.pool,
        role = ?config.pool.role,
        "Starting bootstrap pass"
    );
    let report = bootstrapper.run(&config.pool).await?;

    match args.output {
        OutputFormat::Table => print!("{}", format_report(&report)),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
    }
    Ok(())
}

fn format_report(report: &PassReport) -> String {
    let mut out = format!(
        "Pool {} of cluster {}: {} instance(s), {} changed\n\n",
        report.pool,
        report.cluster,
        report.instances.len(),
        report.changed()
    );

    let name_width = report
        .instances
        .iter()
        .map(|r| r.instance.len())
        .max()
        .unwrap_or(0)
        .max("INSTANCE".len());

    out.push_str(&format!(
        "{:<name_width$}  {:<24}  OUTCOME\n",
        "INSTANCE", "ROLE"
    ));
    for r in &report.instances {
        let outcome = serde_json::to_value(r.outcome)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();
        out.push_str(&format!(
            "{:<name_width$}  {:<24}  {}\n",
            r.instance,
            r.role.to_string(),
            outcome
        ));
    }
    out
}
