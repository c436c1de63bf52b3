//! Azure Resource Manager provisioner
//!
//! Read-only queries against infrastructure that was created before the
//! bootstrap pass: scale-set NICs, load balancer NAT configuration, the
//! load balancer's public IP and the tagged scale sets of a cluster.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use kubepool_common::retry::{retry_with_backoff, RetryConfig};
use kubepool_common::{Error, Result};
use kubepool_pool::{InfrastructureProvisioner, LoadBalancerInfo, ScaleSetVm};

use crate::models::{
    ErrorEnvelope, LoadBalancer, NatRule, NetworkInterface, Page, PublicIpAddress, ScaleSet,
};

/// Public cloud Resource Manager endpoint
pub const ARM_ENDPOINT: &str = "https://management.azure.com";

const COMPUTE_API_VERSION: &str = "2024-03-01";
const NETWORK_API_VERSION: &str = "2023-09-01";
// Scale-set NIC listing is only served on this older version
const VMSS_NIC_API_VERSION: &str = "2018-10-01";

const PROVIDER: &str = "azure";

/// Subscription and resource group holding a cluster's resources
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceScope {
    /// Subscription ID
    pub subscription_id: String,
    /// Resource group name
    pub resource_group: String,
}

impl ResourceScope {
    fn path(&self) -> String {
        format!(
            "/subscriptions/{}/resourceGroups/{}",
            self.subscription_id, self.resource_group
        )
    }
}

/// [`InfrastructureProvisioner`] over the Resource Manager REST API
#[derive(Clone)]
pub struct ArmProvisioner {
    client: reqwest::Client,
    endpoint: String,
    scope: ResourceScope,
    token: String,
    retry: RetryConfig,
}

impl std::fmt::Debug for ArmProvisioner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArmProvisioner")
            .field("endpoint", &self.endpoint)
            .field("scope", &self.scope)
            .finish_non_exhaustive()
    }
}

impl ArmProvisioner {
    /// Provisioner against the public cloud endpoint
    pub fn new(scope: ResourceScope, token: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| {
                Error::provider_permanent(PROVIDER, format!("failed to create HTTP client: {}", e))
            })?;

        Ok(Self {
            client,
            endpoint: ARM_ENDPOINT.to_string(),
            scope,
            token: token.into(),
            retry: RetryConfig::with_max_attempts(5),
        })
    }

    /// Use another Resource Manager endpoint (sovereign clouds)
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into().trim_end_matches('/').to_string();
        self
    }

    /// Override the retry policy for transient failures
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    fn resource_url(&self, provider_path: &str, api_version: &str) -> String {
        format!(
            "{}{}/providers/{}?api-version={}",
            self.endpoint,
            self.scope.path(),
            provider_path,
            api_version
        )
    }

    fn id_url(&self, resource_id: &str, api_version: &str) -> String {
        format!("{}{}?api-version={}", self.endpoint, resource_id, api_version)
    }

    /// GET with retries on throttling and server errors
    async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T> {
        retry_with_backoff(&self.retry, url, Error::is_retryable, || async move {
            let response = self
                .client
                .get(url)
                .bearer_auth(&self.token)
                .send()
                .await
                .map_err(|e| Error::provider(PROVIDER, format!("request to {} failed: {}", url, e)))?;

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(status_error(status, &body));
            }

            response
                .json::<T>()
                .await
                .map_err(|e| Error::serialization_for_kind("arm response", e.to_string()))
        })
        .await
    }

    /// Follow `nextLink` until the last page
    async fn list_all<T: DeserializeOwned>(&self, url: String) -> Result<Vec<T>> {
        let mut items = Vec::new();
        let mut next = Some(url);
        while let Some(url) = next {
            let page: Page<T> = self.get_json(&url).await?;
            items.extend(page.value);
            next = page.next_link.filter(|l| !l.is_empty());
        }
        Ok(items)
    }
}

/// Map a failed Resource Manager response to a provider error
///
/// Throttling and server errors are retryable; everything else is permanent.
pub fn status_error(status: StatusCode, body: &str) -> Error {
    let message = serde_json::from_str::<ErrorEnvelope>(body)
        .ok()
        .map(|e| format!("{}: {}", e.error.code, e.error.message))
        .unwrap_or_else(|| body.trim().to_string());
    let message = format!("{} {}", status, message);

    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        Error::provider(PROVIDER, message)
    } else {
        Error::provider_permanent(PROVIDER, message)
    }
}

#[async_trait]
impl InfrastructureProvisioner for ArmProvisioner {
    async fn list_pool_vms(&self, pool: &str) -> Result<Vec<ScaleSetVm>> {
        let url = self.resource_url(
            &format!(
                "Microsoft.Compute/virtualMachineScaleSets/{}/networkInterfaces",
                pool
            ),
            VMSS_NIC_API_VERSION,
        );
        let nics: Vec<NetworkInterface> = self.list_all(url).await?;
        let vms: Vec<ScaleSetVm> = nics.iter().filter_map(|nic| nic.to_vm(pool)).collect();
        debug!(pool = %pool, nics = nics.len(), vms = vms.len(), "Listed scale-set NICs");
        Ok(vms)
    }

    async fn load_balancer(&self, name: &str) -> Result<LoadBalancerInfo> {
        let url = self.resource_url(
            &format!("Microsoft.Network/loadBalancers/{}", name),
            NETWORK_API_VERSION,
        );
        let lb: LoadBalancer = self.get_json(&url).await?;

        let public_ip_id = lb
            .properties
            .frontend_ip_configurations
            .iter()
            .find_map(|f| f.properties.public_ip_address.as_ref())
            .map(|r| r.id.clone());

        let public_address = match public_ip_id {
            Some(id) => {
                let ip: PublicIpAddress = self
                    .get_json(&self.id_url(&id, NETWORK_API_VERSION))
                    .await?;
                ip.address().unwrap_or_default()
            }
            None => String::new(),
        };

        info!(
            load_balancer = %name,
            public_address = %public_address,
            nat_rules = lb.properties.inbound_nat_rules.len(),
            nat_pools = lb.properties.inbound_nat_pools.len(),
            "Fetched load balancer"
        );

        Ok(LoadBalancerInfo {
            name: lb.name,
            public_address,
            nat_rules: lb
                .properties
                .inbound_nat_rules
                .iter()
                .filter_map(NatRule::to_rule)
                .collect(),
            nat_pools: lb.properties.inbound_nat_pools.iter().map(Into::into).collect(),
        })
    }

    async fn control_plane_pools(&self, cluster: &str) -> Result<Vec<String>> {
        let url = self.resource_url("Microsoft.Compute/virtualMachineScaleSets", COMPUTE_API_VERSION);
        let scale_sets: Vec<ScaleSet> = self.list_all(url).await?;
        let pools: Vec<String> = scale_sets
            .into_iter()
            .filter(|s| s.is_control_plane_of(cluster))
            .map(|s| s.name)
            .collect();
        debug!(cluster = %cluster, pools = ?pools, "Found control-plane pools");
        Ok(pools)
    }
}
