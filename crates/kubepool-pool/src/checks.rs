//! Idempotency probes
//!
//! Node probes decide by exit status only. A probe that exits non-zero means
//! "no"; a probe that could not run at all is an error.

use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use kubepool_common::{Error, Result};

use crate::executor::{ExecError, RemoteExecutor, Script};
use crate::scripts;
use crate::store::{secret_key, CoordinationStore, SecretPurpose};

/// Run a read-only probe, mapping exit status to a boolean
pub(crate) async fn probe_succeeds(exec: &dyn RemoteExecutor, script: &Script) -> Result<bool> {
    match exec.execute(script).await {
        Ok(_) => Ok(true),
        Err(ExecError::Failed { .. }) => Ok(false),
        Err(e @ ExecError::Transport { .. }) => Err(e.into_error(exec.instance())),
    }
}

/// Container runtime and kubeadm toolchain are installed and working
pub async fn is_bootstrapped(exec: &dyn RemoteExecutor) -> Result<bool> {
    let present = probe_succeeds(exec, &scripts::probe_bootstrapped()).await?;
    debug!(instance = %exec.instance(), present, "Checked bootstrap toolchain");
    Ok(present)
}

/// Kubelet is configured against a cluster or the API server port is bound
pub async fn is_cluster_member(exec: &dyn RemoteExecutor) -> Result<bool> {
    let member = probe_succeeds(exec, &scripts::probe_member()).await?;
    debug!(instance = %exec.instance(), member, "Checked cluster membership");
    Ok(member)
}

/// Reachability check for a `host:port` endpoint
#[cfg_attr(test, automock)]
#[async_trait]
pub trait EndpointProbe: Send + Sync {
    /// True if a TCP connection succeeds within `timeout`
    async fn reachable(&self, endpoint: &str, timeout: Duration) -> bool;
}

/// Plain TCP connect probe
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpProbe;

#[async_trait]
impl EndpointProbe for TcpProbe {
    async fn reachable(&self, endpoint: &str, timeout: Duration) -> bool {
        matches!(
            tokio::time::timeout(timeout, TcpStream::connect(endpoint)).await,
            Ok(Ok(_))
        )
    }
}

/// A published control plane exists and answers on its API endpoint
///
/// Missing secrets, backend hiccups and an unreachable endpoint all mean
/// "unhealthy". Only rejected store credentials are returned as an error.
pub async fn is_existing_control_plane_healthy(
    store: &CoordinationStore,
    probe: &dyn EndpointProbe,
    cluster: &str,
    timeout: Duration,
) -> Result<bool> {
    let join = published(store, &secret_key(cluster, SecretPurpose::MasterJoin)).await?;
    if join.is_none() {
        info!(cluster = %cluster, "No published control-plane join command");
        return Ok(false);
    }

    let Some(endpoint) = published(store, &secret_key(cluster, SecretPurpose::ApiEndpoint)).await?
    else {
        info!(cluster = %cluster, "No published API endpoint");
        return Ok(false);
    };

    let reachable = probe.reachable(&endpoint, timeout).await;
    info!(cluster = %cluster, endpoint = %endpoint, reachable, "Checked API endpoint");
    Ok(reachable)
}

/// Store read where only fatal-global failures escape
async fn published(store: &CoordinationStore, key: &str) -> Result<Option<String>> {
    match store.get(key).await {
        Ok(value) => Ok(value),
        Err(e) if e.is_fatal_global() => Err(e),
        Err(Error::Store { message, .. }) => {
            debug!(key = %key, error = %message, "Store read failed, treating as absent");
            Ok(None)
        }
        Err(e) => Err(e),
    }
}
