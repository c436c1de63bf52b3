//! Coordination store
//!
//! Nodes never talk to each other or to us directly about cluster state;
//! join credentials and the API endpoint are handed over through a secret
//! store under stable cluster-scoped keys.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info, warn};

#[cfg(test)]
use mockall::automock;

use kubepool_common::retry::poll_attempts;
use kubepool_common::{Error, Result};

/// What a coordination secret holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SecretPurpose {
    /// `kubeadm join` command for workers
    WorkerJoin,
    /// `kubeadm join` command with `--control-plane` and certificate key
    MasterJoin,
    /// Externally reachable `host:port` of the API server
    ApiEndpoint,
    /// Admin kubeconfig pointing at the external endpoint
    Kubeconfig,
}

impl SecretPurpose {
    /// Key suffix; part of the cross-version key protocol
    pub fn as_str(&self) -> &'static str {
        match self {
            SecretPurpose::WorkerJoin => "worker-join",
            SecretPurpose::MasterJoin => "master-join",
            SecretPurpose::ApiEndpoint => "api-endpoint",
            SecretPurpose::Kubeconfig => "kubeconfig",
        }
    }

    /// Purposes invalidated when the control plane is rebuilt
    pub const CREDENTIALS: [SecretPurpose; 3] = [
        SecretPurpose::WorkerJoin,
        SecretPurpose::MasterJoin,
        SecretPurpose::ApiEndpoint,
    ];
}

impl fmt::Display for SecretPurpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Build the coordination key for a cluster and purpose
pub fn secret_key(cluster: &str, purpose: SecretPurpose) -> String {
    format!("{}-{}", cluster, purpose.as_str())
}

/// Raw failure from a secret backend
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    /// No live secret under that name
    #[error("secret not found")]
    NotFound,
    /// The name is held by a deleted-but-recoverable secret
    #[error("secret is soft-deleted but recoverable")]
    SoftDeleted,
    /// Credentials rejected
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    /// Anything else (network, throttling, server errors)
    #[error("{0}")]
    Other(String),
}

impl BackendError {
    fn into_error(self, key: &str) -> Error {
        match self {
            BackendError::Unauthorized(msg) => Error::store_unauthorized(key, msg),
            other => Error::store(key, other.to_string()),
        }
    }
}

/// Storage behind the coordination store
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SecretBackend: Send + Sync {
    /// Read a secret value
    async fn get(&self, name: &str) -> std::result::Result<String, BackendError>;

    /// Create or overwrite a secret
    async fn set(&self, name: &str, value: &str) -> std::result::Result<(), BackendError>;

    /// Delete a secret (may leave it soft-deleted)
    async fn delete(&self, name: &str) -> std::result::Result<(), BackendError>;

    /// Permanently remove a soft-deleted secret
    async fn purge_deleted(&self, name: &str) -> std::result::Result<(), BackendError>;
}

/// Key/value rendezvous for join credentials
#[derive(Clone)]
pub struct CoordinationStore {
    backend: Arc<dyn SecretBackend>,
    purge_delay: Duration,
}

impl CoordinationStore {
    /// Wrap a backend; `purge_delay` is the pause between purge and rewrite
    pub fn new(backend: Arc<dyn SecretBackend>, purge_delay: Duration) -> Self {
        Self {
            backend,
            purge_delay,
        }
    }

    /// Read a key, `None` if it was never published or has been deleted
    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        match self.backend.get(key).await {
            Ok(value) => Ok(Some(value)),
            Err(BackendError::NotFound) | Err(BackendError::SoftDeleted) => Ok(None),
            Err(e) => Err(e.into_error(key)),
        }
    }

    /// Publish a value
    ///
    /// A soft-deleted secret holding the name is purged and the write retried
    /// exactly once; a second conflict is returned as an error.
    pub async fn set(&self, key: &str, value: &str) -> Result<()> {
        match self.backend.set(key, value).await {
            Ok(()) => {
                debug!(key = %key, "Published secret");
                Ok(())
            }
            Err(BackendError::SoftDeleted) => {
                warn!(key = %key, "Secret is soft-deleted, purging before rewrite");
                self.backend
                    .purge_deleted(key)
                    .await
                    .map_err(|e| e.into_error(key))?;
                tokio::time::sleep(self.purge_delay).await;

                match self.backend.set(key, value).await {
                    Ok(()) => {
                        info!(key = %key, "Published secret after purge");
                        Ok(())
                    }
                    Err(BackendError::SoftDeleted) => Err(Error::store(
                        key,
                        "still soft-deleted after purge and retry",
                    )),
                    Err(e) => Err(e.into_error(key)),
                }
            }
            Err(e) => Err(e.into_error(key)),
        }
    }

    /// Delete a key, ignoring failures other than rejected credentials
    pub async fn delete(&self, key: &str) -> Result<()> {
        match self.backend.delete(key).await {
            Ok(()) => {
                info!(key = %key, "Deleted secret");
                Ok(())
            }
            Err(BackendError::NotFound) | Err(BackendError::SoftDeleted) => Ok(()),
            Err(BackendError::Unauthorized(msg)) => Err(Error::store_unauthorized(key, msg)),
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to delete secret, continuing");
                Ok(())
            }
        }
    }

    /// Poll for a key until it appears or `max_attempts` polls have been made
    ///
    /// Transient backend errors count as "not yet"; rejected credentials end
    /// the wait immediately.
    pub async fn wait_for(&self, key: &str, max_attempts: u32, interval: Duration) -> Result<String> {
        info!(key = %key, max_attempts, interval_secs = interval.as_secs(), "Waiting for secret");

        let found = poll_attempts(key, max_attempts, interval, || async move {
            match self.backend.get(key).await {
                Ok(value) => Ok(Some(value)),
                Err(BackendError::NotFound) | Err(BackendError::SoftDeleted) => Ok(None),
                Err(BackendError::Unauthorized(msg)) => Err(Error::store_unauthorized(key, msg)),
                Err(e) => {
                    warn!(key = %key, error = %e, "Transient store error while waiting");
                    Ok(None)
                }
            }
        })
        .await?;

        found.ok_or_else(|| Error::store_timeout(key, max_attempts))
    }
}
