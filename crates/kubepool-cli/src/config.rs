//! Pool configuration file
//!
//! One YAML document describes one pool:
//!
//! ```yaml
//! cluster: prod
//! pool: prod-cp
//! role: control-plane
//! expectedInstances: 3
//! loadBalancer: prod-lb
//! ssh:
//!   user: azureuser
//!   identityFile: ~/.ssh/prod
//! azure:
//!   subscriptionId: 00000000-0000-0000-0000-000000000000
//!   resourceGroup: prod-rg
//!   vaultName: prod-kv
//! kubernetes:
//!   version: "1.30"
//! timings:
//!   waitAttempts: 60
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use kubepool_pool::{KubernetesSettings, PoolSpec, Timings};

use crate::{Error, Result};

/// Everything needed to run a pass over one pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolConfig {
    /// Cluster, pool, role and load balancer
    #[serde(flatten)]
    pub pool: PoolSpec,
    /// How to reach the nodes
    pub ssh: SshConfig,
    /// Where the infrastructure and coordination secrets live
    pub azure: AzureConfig,
    /// What gets installed
    #[serde(default)]
    pub kubernetes: KubernetesSettings,
    /// Waits, delays and budgets
    #[serde(default)]
    pub timings: Timings,
}

/// SSH login settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SshConfig {
    /// Login user on every node
    pub user: String,
    /// Private key; `~/` is expanded. Without one, ssh's own defaults apply.
    #[serde(default)]
    pub identity_file: Option<PathBuf>,
    /// TCP connect timeout
    #[serde(default = "default_ssh_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

fn default_ssh_connect_timeout_secs() -> u64 {
    30
}

impl SshConfig {
    /// Identity file with a leading `~/` resolved against the home directory
    pub fn resolved_identity_file(&self) -> Result<Option<PathBuf>> {
        let Some(path) = &self.identity_file else {
            return Ok(None);
        };
        match path.strip_prefix("~") {
            Ok(rest) => {
                let home = dirs::home_dir()
                    .ok_or_else(|| Error::command_failed("could not determine home directory"))?;
                Ok(Some(home.join(rest)))
            }
            Err(_) => Ok(Some(path.clone())),
        }
    }

    /// Connect timeout as a Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// Azure resource locations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AzureConfig {
    /// Subscription holding the pool
    pub subscription_id: String,
    /// Resource group holding the pool and its load balancer
    pub resource_group: String,
    /// Key Vault used as the coordination store
    pub vault_name: String,
    /// Per-request HTTP timeout
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_request_timeout_secs() -> u64 {
    30
}

impl AzureConfig {
    /// Request timeout as a Duration
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl PoolConfig {
    /// Read and validate a config file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::config(path, format!("failed to read: {}", e)))?;
        Self::parse(&content).map_err(|e| match e {
            Error::Yaml(e) => Error::config(path, e.to_string()),
            other => other,
        })
    }

    /// Parse and validate YAML content
    pub fn parse(content: &str) -> Result<Self> {
        let config: PoolConfig = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check everything a pass would otherwise trip over halfway through
    pub fn validate(&self) -> Result<()> {
        self.pool.validate()?;
        self.kubernetes.validate()?;
        self.timings.validate()?;

        if self.ssh.user.trim().is_empty() {
            return Err(Error::validation("ssh.user must not be empty"));
        }
        if self.ssh.connect_timeout_secs == 0 {
            return Err(Error::validation("ssh.connectTimeoutSecs must be at least 1"));
        }
        if self.azure.subscription_id.trim().is_empty() {
            return Err(Error::validation("azure.subscriptionId must not be empty"));
        }
        if self.azure.resource_group.trim().is_empty() {
            return Err(Error::validation("azure.resourceGroup must not be empty"));
        }
        // Vault names end up in the data-plane hostname
        let vault = &self.azure.vault_name;
        if vault.len() < 3
            || vault.len() > 24
            || !vault.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        {
            return Err(Error::validation(
                "azure.vaultName must be 3-24 letters, digits or '-'",
            ));
        }
        if self.azure.request_timeout_secs == 0 {
            return Err(Error::validation("azure.requestTimeoutSecs must be at least 1"));
        }
        Ok(())
    }
}
