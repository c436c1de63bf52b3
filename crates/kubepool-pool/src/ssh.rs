//! SSH remote shell over the system `ssh` client
//!
//! Each instance gets one multiplexed control-master connection through its
//! NAT port; every command then runs as a new session on that master, so
//! authentication happens once per instance. The master is torn down by
//! [`RemoteExecutor::close`].

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::executor::{ExecError, NodeEndpoint, RemoteExecutor, RemoteShell, Script};

/// ssh reserves this exit code for its own failures
const SSH_TRANSPORT_FAILURE: i32 = 255;

/// Connection settings shared by every instance of a pool
#[derive(Debug, Clone)]
pub struct SshShell {
    user: String,
    identity_file: Option<PathBuf>,
    connect_timeout: Duration,
    socket_dir: PathBuf,
}

impl SshShell {
    /// Create a shell that logs in as `user`
    pub fn new(user: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            identity_file: None,
            connect_timeout: Duration::from_secs(30),
            socket_dir: std::env::temp_dir(),
        }
    }

    /// Authenticate with a specific private key
    pub fn with_identity_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.identity_file = Some(path.into());
        self
    }

    /// Override the TCP connect timeout
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    fn control_socket(&self, endpoint: &NodeEndpoint) -> PathBuf {
        self.socket_dir.join(format!(
            "kubepool-{}-{}.sock",
            std::process::id(),
            sanitize(&endpoint.instance)
        ))
    }

    /// Arguments that start a backgrounded control master
    fn master_args(&self, endpoint: &NodeEndpoint, socket: &Path) -> Vec<String> {
        let mut args = vec![
            "-M".to_string(),
            "-S".to_string(),
            socket.display().to_string(),
            "-o".to_string(),
            "ControlPersist=yes".to_string(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=accept-new".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout.as_secs()),
            "-o".to_string(),
            "ServerAliveInterval=30".to_string(),
            "-p".to_string(),
            endpoint.port.to_string(),
        ];
        if let Some(ref key) = self.identity_file {
            args.push("-i".to_string());
            args.push(key.display().to_string());
        }
        args.push("-fN".to_string());
        args.push(format!("{}@{}", self.user, endpoint.host));
        args
    }
}

#[async_trait]
impl RemoteShell for SshShell {
    async fn connect(&self, endpoint: &NodeEndpoint) -> Result<Box<dyn RemoteExecutor>, ExecError> {
        let socket = self.control_socket(endpoint);
        remove_stale_socket(&socket).await;

        info!(
            instance = %endpoint.instance,
            host = %endpoint.host,
            port = endpoint.port,
            "Opening SSH connection"
        );

        let output = Command::new("ssh")
            .args(self.master_args(endpoint, &socket))
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| ExecError::Transport {
                script: "connect".to_string(),
                message: format!("failed to spawn ssh: {}", e),
            })?;

        if !output.status.success() {
            return Err(ExecError::Transport {
                script: "connect".to_string(),
                message: format!(
                    "ssh to {}:{} failed: {}",
                    endpoint.host,
                    endpoint.port,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }

        Ok(Box::new(SshSession {
            instance: endpoint.instance.clone(),
            destination: format!("{}@{}", self.user, endpoint.host),
            port: endpoint.port,
            socket,
        }))
    }
}

/// Commands for one instance, multiplexed over its control master
#[derive(Debug)]
pub struct SshSession {
    instance: String,
    destination: String,
    port: u16,
    socket: PathBuf,
}

impl SshSession {
    fn session_args(&self, script: &Script) -> Vec<String> {
        vec![
            "-S".to_string(),
            self.socket.display().to_string(),
            "-p".to_string(),
            self.port.to_string(),
            self.destination.clone(),
            remote_invocation(&script.body),
        ]
    }
}

#[async_trait]
impl RemoteExecutor for SshSession {
    fn instance(&self) -> &str {
        &self.instance
    }

    async fn execute(&self, script: &Script) -> Result<String, ExecError> {
        debug!(instance = %self.instance, script = %script.name, "Running remote command");

        let output = Command::new("ssh")
            .args(self.session_args(script))
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| ExecError::Transport {
                script: script.name.clone(),
                message: format!("failed to spawn ssh: {}", e),
            })?;

        // Remote stderr is folded into stdout by the invocation; local stderr
        // only carries ssh's own diagnostics.
        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        let local_stderr = String::from_utf8_lossy(&output.stderr);
        if !local_stderr.trim().is_empty() {
            combined.push_str(&local_stderr);
        }

        match output.status.code() {
            Some(0) => Ok(combined),
            Some(SSH_TRANSPORT_FAILURE) => Err(ExecError::Transport {
                script: script.name.clone(),
                message: local_stderr.trim().to_string(),
            }),
            code => Err(ExecError::Failed {
                script: script.name.clone(),
                code,
                output: combined,
            }),
        }
    }

    async fn close(&self) -> Result<(), ExecError> {
        let output = Command::new("ssh")
            .args([
                "-S".to_string(),
                self.socket.display().to_string(),
                "-O".to_string(),
                "exit".to_string(),
                "-p".to_string(),
                self.port.to_string(),
                self.destination.clone(),
            ])
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| ExecError::Transport {
                script: "close".to_string(),
                message: format!("failed to spawn ssh: {}", e),
            })?;

        if self.socket.exists() {
            if let Err(e) = std::fs::remove_file(&self.socket) {
                warn!(socket = %self.socket.display(), error = %e, "Failed to remove control socket");
            }
        }

        if output.status.success() {
            debug!(instance = %self.instance, "Closed SSH connection");
            Ok(())
        } else {
            Err(ExecError::Transport {
                script: "close".to_string(),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }
}

/// Wrap a script so the remote side runs it under bash with stderr merged
fn remote_invocation(body: &str) -> String {
    format!("bash -c {} 2>&1", shell_quote(body))
}

/// Quote a string for a POSIX shell using single quotes
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Keep socket file names to a safe character set
fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect()
}

/// Drop a control socket left behind by a crashed pass
async fn remove_stale_socket(socket: &Path) {
    match tokio::fs::remove_file(socket).await {
        Ok(()) => debug!(socket = %socket.display(), "Removed stale control socket"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(
            socket = %socket.display(),
            error = %e,
            "Failed to remove stale control socket"
        ),
    }
}
