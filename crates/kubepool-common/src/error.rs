//! Error types for kubepool
//!
//! Errors carry the context an operator needs to diagnose a failed pass
//! without re-running it: the coordination key, the pool, the instance and
//! the bootstrap step that was in progress.

use std::time::Duration;

use thiserror::Error;

/// Main error type for kubepool operations
#[derive(Debug, Error)]
pub enum Error {
    /// Coordination store failure (backend unreachable, write rejected)
    #[error("store error for {key}: {message}")]
    Store {
        /// Coordination key being read or written
        key: String,
        /// Description of what failed
        message: String,
        /// Whether the backend rejected our credentials
        unauthorized: bool,
    },

    /// A bounded wait on the coordination store ran out of attempts
    #[error("timed out waiting for {key} after {attempts} attempts")]
    StoreTimeout {
        /// Coordination key that never appeared
        key: String,
        /// Number of polls performed
        attempts: u32,
    },

    /// A remote command failed outside of a probe
    #[error("remote command failed on {instance}: {message}")]
    Remote {
        /// Instance the command ran on
        instance: String,
        /// Description of what failed
        message: String,
        /// Combined stdout and stderr of the failed command
        output: String,
    },

    /// Instance discovery or NAT reachability failure
    #[error("access error for pool {pool}: {message}")]
    Access {
        /// Pool being resolved
        pool: String,
        /// Description of what failed
        message: String,
    },

    /// Instances did not report a private address before the deadline
    #[error(
        "pool {pool}: only {found} of {expected} instances running after {}s",
        .elapsed.as_secs()
    )]
    InstancesNotRunning {
        /// Pool being waited on
        pool: String,
        /// Instances required
        expected: usize,
        /// Instances observed at the deadline
        found: usize,
        /// Time spent waiting
        elapsed: Duration,
    },

    /// Cloud provider API error
    #[error("provider error [{provider}]: {message}")]
    Provider {
        /// Provider API (e.g., "arm", "keyvault")
        provider: String,
        /// Description of what failed
        message: String,
        /// Whether this error is retryable
        retryable: bool,
    },

    /// Invalid configuration
    #[error("validation error: {message}")]
    Validation {
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "timings.waitAttempts")
        field: Option<String>,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The document kind being processed (if known)
        kind: Option<String>,
    },

    /// The role of the next node could not be determined
    #[error("cannot determine node role for cluster {cluster}: {message}")]
    RoleResolution {
        /// Cluster being bootstrapped
        cluster: String,
        /// Description of what failed
        message: String,
    },

    /// An instance failed while in a bootstrap step
    #[error("bootstrap of {instance} failed during {step}: {source}")]
    Bootstrap {
        /// Instance being bootstrapped
        instance: String,
        /// Step that was in progress
        step: String,
        /// Underlying failure
        #[source]
        source: Box<Error>,
    },

    /// An instance ran past its wall-clock budget
    #[error("bootstrap of {instance} exceeded its {}s budget before {step}", .budget.as_secs())]
    DeadlineExceeded {
        /// Instance being bootstrapped
        instance: String,
        /// Step that was about to start
        step: String,
        /// Configured per-instance budget
        budget: Duration,
    },
}

impl Error {
    /// Create a store error for a coordination key
    pub fn store(key: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Store {
            key: key.into(),
            message: msg.into(),
            unauthorized: false,
        }
    }

    /// Create a store error caused by rejected credentials
    pub fn store_unauthorized(key: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Store {
            key: key.into(),
            message: msg.into(),
            unauthorized: true,
        }
    }

    /// Create a store timeout error
    pub fn store_timeout(key: impl Into<String>, attempts: u32) -> Self {
        Self::StoreTimeout {
            key: key.into(),
            attempts,
        }
    }

    /// Create a remote command error
    pub fn remote(
        instance: impl Into<String>,
        msg: impl Into<String>,
        output: impl Into<String>,
    ) -> Self {
        Self::Remote {
            instance: instance.into(),
            message: msg.into(),
            output: output.into(),
        }
    }

    /// Create an access error for a pool
    pub fn access_for(pool: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Access {
            pool: pool.into(),
            message: msg.into(),
        }
    }

    /// Create a retryable provider error
    pub fn provider(provider: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Provider {
            provider: provider.into(),
            message: msg.into(),
            retryable: true,
        }
    }

    /// Create a non-retryable provider error (e.g., 403, 404)
    pub fn provider_permanent(provider: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Provider {
            provider: provider.into(),
            message: msg.into(),
            retryable: false,
        }
    }

    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error for a specific field
    pub fn validation_for_field(field: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a serialization error with document kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create a role resolution error
    pub fn role_resolution(cluster: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::RoleResolution {
            cluster: cluster.into(),
            message: msg.into(),
        }
    }

    /// Wrap an error with the instance and step it occurred in
    ///
    /// Already-wrapped errors are returned untouched so the innermost step wins.
    pub fn in_step(self, instance: impl Into<String>, step: impl ToString) -> Self {
        match self {
            Error::Bootstrap { .. } | Error::DeadlineExceeded { .. } => self,
            other => Self::Bootstrap {
                instance: instance.into(),
                step: step.to_string(),
                source: Box::new(other),
            },
        }
    }

    /// Check if this error is retryable
    ///
    /// Timeouts and remote failures are worth a re-run once the operator has
    /// looked at the cause; configuration problems are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Store { unauthorized, .. } => !unauthorized,
            Error::StoreTimeout { .. } => true,
            Error::Remote { .. } => true,
            Error::Access { .. } => true,
            Error::InstancesNotRunning { .. } => true,
            Error::Provider { retryable, .. } => *retryable,
            Error::Validation { .. } => false,
            Error::Serialization { .. } => false,
            Error::RoleResolution { .. } => true,
            Error::Bootstrap { source, .. } => source.is_retryable(),
            Error::DeadlineExceeded { .. } => true,
        }
    }

    /// Check if this error must abort the whole pool pass
    ///
    /// Losing the coordination store's trust or the ability to decide node
    /// roles invalidates every remaining instance, not just the current one.
    pub fn is_fatal_global(&self) -> bool {
        match self {
            Error::Store { unauthorized, .. } => *unauthorized,
            Error::RoleResolution { .. } | Error::Validation { .. } => true,
            Error::Bootstrap { source, .. } => source.is_fatal_global(),
            _ => false,
        }
    }

    /// Get the instance name if this error is tied to one
    pub fn instance(&self) -> Option<&str> {
        match self {
            Error::Remote { instance, .. }
            | Error::Bootstrap { instance, .. }
            | Error::DeadlineExceeded { instance, .. } => Some(instance),
            _ => None,
        }
    }

    /// Get the bootstrap step if this error was raised inside one
    pub fn step(&self) -> Option<&str> {
        match self {
            Error::Bootstrap { step, .. } | Error::DeadlineExceeded { step, .. } => Some(step),
            _ => None,
        }
    }
}
