//! `kubepool kubeconfig` - fetch the published admin kubeconfig

use std::path::{Path, PathBuf};

use clap::Args;
use tracing::info;

use kubepool_pool::kubeconfig::server_of;
use kubepool_pool::{secret_key, SecretPurpose};

use super::{coordination_store, ConfigArgs, VaultTokenArgs};
use crate::{Error, Result};

/// Write the published admin kubeconfig to a file
#[derive(Args, Debug)]
pub struct KubeconfigArgs {
    #[command(flatten)]
    pub config: ConfigArgs,

    #[command(flatten)]
    pub token: VaultTokenArgs,

    /// Where to write the kubeconfig
    #[arg(short, long)]
    pub output: PathBuf,
}

pub async fn run(args: KubeconfigArgs) -> Result<()> {
    let config = args.config.load()?;
    let store = coordination_store(&config, &args.token.keyvault_token)?;
    let key = secret_key(&config.pool.cluster, SecretPurpose::Kubeconfig);

    let kubeconfig = store.get(&key).await?.ok_or_else(|| {
        Error::command_failed(format!(
            "no kubeconfig published for cluster {} (key {})",
            config.pool.cluster, key
        ))
    })?;

    let server = server_of(&kubeconfig)?;
    write_private(&args.output, &kubeconfig)?;
    info!(path = %args.output.display(), server = %server, "Wrote admin kubeconfig");
    println!("{}", args.output.display());
    Ok(())
}

/// Write a file readable only by the owner
///
/// A new file is created with mode 0600, so the content is never readable by
/// others; an existing file is narrowed to 0600 before it is truncated.
#[cfg(unix)]
fn write_private(path: &Path, content: &str) -> Result<()> {
    use std::io::Write;
    use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};

    if path.exists() {
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(content.as_bytes())?;
    Ok(())
}

#[cfg(not(unix))]
fn write_private(path: &Path, content: &str) -> Result<()> {
    std::fs::write(path, content)?;
    Ok(())
}
