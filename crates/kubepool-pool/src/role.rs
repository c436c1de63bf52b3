//! Node role resolution
//!
//! Cluster state is observed once per pass into a [`ClusterState`] and
//! threaded through the instance loop, together with whether this pass has
//! already bootstrapped a first control plane. The role of each instance is a
//! pure function of those and the pool's declared role.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use kubepool_common::{Error, Result};

use crate::access::InfrastructureProvisioner;
use crate::checks::{is_existing_control_plane_healthy, EndpointProbe};
use crate::store::{secret_key, CoordinationStore, SecretPurpose};

/// Role a pool is created with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PoolRole {
    /// Runs control-plane components
    ControlPlane,
    /// Runs workloads only
    Worker,
}

impl fmt::Display for PoolRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolRole::ControlPlane => write!(f, "control-plane"),
            PoolRole::Worker => write!(f, "worker"),
        }
    }
}

/// Concrete bootstrap role of one instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeRole {
    /// Runs `kubeadm init` and publishes join credentials
    FirstControlPlane,
    /// Joins an existing control plane
    AdditionalControlPlane,
    /// Joins as a worker
    Worker,
}

impl NodeRole {
    /// Whether this role hosts control-plane components
    pub fn is_control_plane(&self) -> bool {
        !matches!(self, NodeRole::Worker)
    }
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeRole::FirstControlPlane => write!(f, "first-control-plane"),
            NodeRole::AdditionalControlPlane => write!(f, "additional-control-plane"),
            NodeRole::Worker => write!(f, "worker"),
        }
    }
}

/// What is known about the cluster at the start of a pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ClusterState {
    /// Some control plane has been set up before
    pub initialized: bool,
    /// That control plane published its credentials and answers on its endpoint
    pub healthy: bool,
}

impl ClusterState {
    /// State right after this pass bootstrapped a first control plane
    pub fn bootstrapped() -> Self {
        Self {
            initialized: true,
            healthy: true,
        }
    }

    /// Observe the cluster once
    ///
    /// `initialized` means another control-plane pool is tagged for the
    /// cluster or an API endpoint has been published. Provisioner failures and
    /// unreadable endpoint keys leave the role undecidable and are returned as
    /// role-resolution errors.
    pub async fn observe(
        provisioner: &dyn InfrastructureProvisioner,
        store: &CoordinationStore,
        probe: &dyn EndpointProbe,
        cluster: &str,
        current_pool: &str,
        health_timeout: Duration,
    ) -> Result<Self> {
        let pools = provisioner
            .control_plane_pools(cluster)
            .await
            .map_err(|e| Error::role_resolution(cluster, e.to_string()))?;
        let other_pools = pools
            .iter()
            .filter(|p| !p.eq_ignore_ascii_case(current_pool))
            .count();

        let endpoint_published = match store
            .get(&secret_key(cluster, SecretPurpose::ApiEndpoint))
            .await
        {
            Ok(value) => value.is_some(),
            Err(e) if e.is_fatal_global() => return Err(e),
            // An unreadable endpoint cannot be told apart from an unpublished one
            Err(e) => {
                warn!(cluster = %cluster, error = %e, "Could not read API endpoint");
                return Err(Error::role_resolution(
                    cluster,
                    format!("cannot read published API endpoint: {}", e),
                ));
            }
        };

        let initialized = other_pools > 0 || endpoint_published;
        let healthy = initialized
            && is_existing_control_plane_healthy(store, probe, cluster, health_timeout).await?;

        let state = Self {
            initialized,
            healthy,
        };
        info!(
            cluster = %cluster,
            other_control_plane_pools = other_pools,
            endpoint_published,
            initialized = state.initialized,
            healthy = state.healthy,
            "Observed cluster state"
        );
        Ok(state)
    }
}

/// Role for the next instance, and whether taking it means a rebuild
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoleDecision {
    /// Role to apply
    pub role: NodeRole,
    /// An unhealthy control plane is being replaced; stale credentials must go first
    pub rebuild: bool,
}

/// Decides the bootstrap role of the next instance
#[derive(Debug, Clone, Copy, Default)]
pub struct NodeRoleResolver;

impl NodeRoleResolver {
    /// Resolve the role for the next instance of a pool
    pub fn resolve(
        &self,
        declared: PoolRole,
        state: &ClusterState,
        first_control_plane_bootstrapped: bool,
    ) -> RoleDecision {
        let (role, rebuild) = match declared {
            PoolRole::Worker => (NodeRole::Worker, false),
            PoolRole::ControlPlane if first_control_plane_bootstrapped => {
                (NodeRole::AdditionalControlPlane, false)
            }
            PoolRole::ControlPlane if !state.initialized => (NodeRole::FirstControlPlane, false),
            PoolRole::ControlPlane if state.healthy => (NodeRole::AdditionalControlPlane, false),
            PoolRole::ControlPlane => (NodeRole::FirstControlPlane, true),
        };
        RoleDecision { role, rebuild }
    }
}

/// Delete the join commands and API endpoint of a cluster, best-effort
///
/// Runs before a rebuilt control plane publishes anything, so no joining
/// node can pick up a token for the torn-down one.
pub async fn invalidate_published_credentials(store: &CoordinationStore, cluster: &str) -> Result<()> {
    warn!(cluster = %cluster, "Control plane unhealthy, invalidating published credentials");
    for purpose in SecretPurpose::CREDENTIALS {
        store.delete(&secret_key(cluster, purpose)).await?;
    }
    Ok(())
}
