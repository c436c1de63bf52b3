//! Remote command execution seam
//!
//! A [`RemoteShell`] opens one connection per instance; the returned
//! [`RemoteExecutor`] runs every command for that instance over it and must
//! be closed by the caller once the instance is done.

use std::fmt;

use async_trait::async_trait;
use thiserror::Error;

/// A named shell script to run on a node
///
/// The name is what gets logged and reported; the body may carry join
/// tokens and is never included in error messages.
#[derive(Clone, PartialEq, Eq)]
pub struct Script {
    /// Short stable identifier (e.g., "kubeadm-init")
    pub name: String,
    /// Shell source passed to `bash -c` on the node
    pub body: String,
    /// Whether running this changes node state (probes are read-only)
    pub mutating: bool,
}

impl Script {
    /// A read-only probe, safe to run on any node at any time
    pub fn probe(name: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            body: body.into(),
            mutating: false,
        }
    }

    /// A command that changes node state
    pub fn mutating(name: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            body: body.into(),
            mutating: true,
        }
    }
}

impl fmt::Debug for Script {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Body may contain join tokens
        f.debug_struct("Script")
            .field("name", &self.name)
            .field("mutating", &self.mutating)
            .finish()
    }
}

/// Failure running a command on a node
///
/// Output is always kept so diagnostics survive the failure.
#[derive(Debug, Clone, Error)]
pub enum ExecError {
    /// The command ran and exited non-zero
    #[error("{script} exited with status {}", .code.map_or_else(|| "unknown".to_string(), |c| c.to_string()))]
    Failed {
        /// Script name
        script: String,
        /// Exit code, if the process reported one
        code: Option<i32>,
        /// Combined stdout and stderr
        output: String,
    },

    /// The channel to the node failed (connect, spawn, dropped session)
    #[error("transport failure for {script}: {message}")]
    Transport {
        /// Script name (or "connect")
        script: String,
        /// Description of what failed
        message: String,
    },
}

impl ExecError {
    /// Combined output captured before the failure
    pub fn output(&self) -> &str {
        match self {
            ExecError::Failed { output, .. } => output,
            ExecError::Transport { .. } => "",
        }
    }

    /// Convert into the crate error with the instance it ran on
    pub fn into_error(self, instance: &str) -> kubepool_common::Error {
        let output = self.output().to_string();
        kubepool_common::Error::remote(instance, self.to_string(), output)
    }
}

/// Where to reach a node: the shared public address plus its NAT port
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeEndpoint {
    /// Instance name the endpoint leads to
    pub instance: String,
    /// Public address of the load balancer front end
    pub host: String,
    /// NAT frontend port mapped to the instance's sshd
    pub port: u16,
}

/// Runs commands on one node over an already-established connection
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    /// Instance this executor is connected to
    fn instance(&self) -> &str;

    /// Run a script in a fresh session and return its combined output
    async fn execute(&self, script: &Script) -> Result<String, ExecError>;

    /// Release the underlying connection
    async fn close(&self) -> Result<(), ExecError>;
}

/// Opens authenticated connections to nodes
#[async_trait]
pub trait RemoteShell: Send + Sync {
    /// Establish the single connection used for one instance's bootstrap
    async fn connect(&self, endpoint: &NodeEndpoint) -> Result<Box<dyn RemoteExecutor>, ExecError>;
}
