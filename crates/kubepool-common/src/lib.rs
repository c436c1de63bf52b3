//! Common types for kubepool: errors, polling and logging

#![deny(missing_docs)]

pub mod error;
pub mod retry;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Port the Kubernetes API server listens on, on every control-plane node
pub const API_SERVER_PORT: u16 = 6443;

/// Port sshd listens on inside every instance (the NAT backend port)
pub const SSH_BACKEND_PORT: u16 = 22;
