//! CLI commands

use std::fmt::Display;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Args;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};

use kubepool_azure::{ArmProvisioner, KeyVaultBackend, ResourceScope};
use kubepool_pool::CoordinationStore;

use crate::config::PoolConfig;
use crate::{Error, Result};

pub mod bootstrap;
pub mod kubeconfig;
pub mod status;

/// Extension trait to convert errors with Display to CLI Error::CommandFailed.
pub trait CommandErrorExt<T> {
    /// Convert an error to `Error::CommandFailed` using its Display implementation.
    fn cmd_err(self) -> Result<T>;
}

impl<T, E: Display> CommandErrorExt<T> for std::result::Result<T, E> {
    fn cmd_err(self) -> Result<T> {
        self.map_err(|e| Error::command_failed(e.to_string()))
    }
}

/// Pool config file location
#[derive(Args, Debug)]
pub struct ConfigArgs {
    /// Path to the pool YAML config file
    #[arg(short = 'f', long = "config", env = "KUBEPOOL_CONFIG")]
    pub config: PathBuf,
}

impl ConfigArgs {
    /// Read and validate the config file
    pub fn load(&self) -> Result<PoolConfig> {
        PoolConfig::load(&self.config)
    }
}

/// Key Vault bearer token
#[derive(Args, Debug)]
pub struct VaultTokenArgs {
    /// Bearer token for the Key Vault data plane
    #[arg(long, env = "KEYVAULT_ACCESS_TOKEN", hide_env_values = true)]
    pub keyvault_token: String,
}

/// Resource Manager and Key Vault bearer tokens
#[derive(Args, Debug)]
pub struct AzureTokenArgs {
    /// Bearer token for Azure Resource Manager
    #[arg(long, env = "AZURE_ACCESS_TOKEN", hide_env_values = true)]
    pub azure_token: String,

    /// Bearer token for the Key Vault data plane
    #[arg(long, env = "KEYVAULT_ACCESS_TOKEN", hide_env_values = true)]
    pub keyvault_token: String,
}

/// Coordination store on the configured vault
pub fn coordination_store(config: &PoolConfig, token: &str) -> Result<CoordinationStore> {
    let backend = KeyVaultBackend::new(
        &config.azure.vault_name,
        token,
        config.azure.request_timeout(),
    )?;
    Ok(CoordinationStore::new(
        Arc::new(backend),
        config.timings.purge_delay(),
    ))
}

/// Resource Manager provisioner for the configured resource group
pub fn provisioner(config: &PoolConfig, token: &str) -> Result<Arc<ArmProvisioner>> {
    let scope = ResourceScope {
        subscription_id: config.azure.subscription_id.clone(),
        resource_group: config.azure.resource_group.clone(),
    };
    Ok(Arc::new(ArmProvisioner::new(
        scope,
        token,
        config.azure.request_timeout(),
    )?))
}

/// Build a kube [`Client`] from kubeconfig YAML held in memory
pub async fn kube_client_from_yaml(yaml: &str) -> Result<Client> {
    let kubeconfig = Kubeconfig::from_yaml(yaml)
        .map_err(|e| Error::command_failed(format!("invalid kubeconfig: {}", e)))?;
    let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .cmd_err()?;
    Client::try_from(config).cmd_err()
}
