//! Bootstrap tuning knobs
//!
//! Durations are stored as whole seconds so they read naturally in the
//! YAML pool file (`waitIntervalSecs: 30`).

use std::time::Duration;

use kubepool_common::{Error, Result};
use serde::{Deserialize, Serialize};

/// Default flannel manifest applied as the pod overlay network
pub const DEFAULT_OVERLAY_MANIFEST_URL: &str =
    "https://github.com/flannel-io/flannel/releases/latest/download/kube-flannel.yml";

/// Timing policy for one bootstrap pass
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Timings {
    /// Polls before a coordination wait gives up
    pub wait_attempts: u32,
    /// Seconds between coordination polls
    pub wait_interval_secs: u64,
    /// Seconds to wait after purging a soft-deleted secret
    pub purge_delay_secs: u64,
    /// Seconds to let a fresh control plane settle before issuing tokens
    pub stabilization_delay_secs: u64,
    /// TCP connect timeout for the control-plane health check
    pub health_check_timeout_secs: u64,
    /// Seconds between instance discovery polls
    pub running_poll_secs: u64,
    /// Seconds to wait for all instances to report an address
    pub running_timeout_secs: u64,
    /// Wall-clock budget for bootstrapping one instance
    pub instance_budget_secs: u64,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            wait_attempts: 60,
            wait_interval_secs: 30,
            purge_delay_secs: 10,
            stabilization_delay_secs: 60,
            health_check_timeout_secs: 10,
            running_poll_secs: 10,
            running_timeout_secs: 15 * 60,
            instance_budget_secs: 60 * 60,
        }
    }
}

impl Timings {
    /// Interval between coordination polls
    pub fn wait_interval(&self) -> Duration {
        Duration::from_secs(self.wait_interval_secs)
    }

    /// Delay after purging a soft-deleted secret
    pub fn purge_delay(&self) -> Duration {
        Duration::from_secs(self.purge_delay_secs)
    }

    /// Settling time after overlay network install
    pub fn stabilization_delay(&self) -> Duration {
        Duration::from_secs(self.stabilization_delay_secs)
    }

    /// Health check connect timeout
    pub fn health_check_timeout(&self) -> Duration {
        Duration::from_secs(self.health_check_timeout_secs)
    }

    /// Interval between instance discovery polls
    pub fn running_poll(&self) -> Duration {
        Duration::from_secs(self.running_poll_secs)
    }

    /// Deadline for instances to come up
    pub fn running_timeout(&self) -> Duration {
        Duration::from_secs(self.running_timeout_secs)
    }

    /// Per-instance wall-clock budget
    pub fn instance_budget(&self) -> Duration {
        Duration::from_secs(self.instance_budget_secs)
    }

    /// Reject values that would make waits meaningless
    pub fn validate(&self) -> Result<()> {
        if self.wait_attempts == 0 {
            return Err(Error::validation_for_field(
                "timings.waitAttempts",
                "must be at least 1",
            ));
        }
        if self.wait_interval_secs == 0 {
            return Err(Error::validation_for_field(
                "timings.waitIntervalSecs",
                "must be at least 1",
            ));
        }
        if self.running_poll_secs == 0 {
            return Err(Error::validation_for_field(
                "timings.runningPollSecs",
                "must be at least 1",
            ));
        }
        if self.health_check_timeout_secs == 0 {
            return Err(Error::validation_for_field(
                "timings.healthCheckTimeoutSecs",
                "must be at least 1",
            ));
        }
        if self.instance_budget_secs == 0 {
            return Err(Error::validation_for_field(
                "timings.instanceBudgetSecs",
                "must be at least 1",
            ));
        }
        Ok(())
    }
}

/// What gets installed on the nodes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct KubernetesSettings {
    /// Minor release track (e.g., "1.30"), used for the package repository
    pub version: String,
    /// Pod network CIDR handed to `kubeadm init`
    pub pod_network_cidr: String,
    /// Overlay network manifest applied once per new control plane
    pub overlay_manifest_url: String,
}

impl Default for KubernetesSettings {
    fn default() -> Self {
        Self {
            version: "1.30".to_string(),
            pod_network_cidr: "10.244.0.0/16".to_string(),
            overlay_manifest_url: DEFAULT_OVERLAY_MANIFEST_URL.to_string(),
        }
    }
}

impl KubernetesSettings {
    /// Check the version track and CIDR are usable in generated scripts
    pub fn validate(&self) -> Result<()> {
        let mut parts = self.version.split('.');
        let well_formed = matches!(
            (parts.next(), parts.next(), parts.next()),
            (Some(major), Some(minor), None)
                if !major.is_empty()
                    && !minor.is_empty()
                    && major.chars().all(|c| c.is_ascii_digit())
                    && minor.chars().all(|c| c.is_ascii_digit())
        );
        if !well_formed {
            return Err(Error::validation_for_field(
                "kubernetes.version",
                format!("expected MAJOR.MINOR, got '{}'", self.version),
            ));
        }

        let cidr_ok = self
            .pod_network_cidr
            .split_once('/')
            .map(|(addr, bits)| {
                addr.parse::<std::net::Ipv4Addr>().is_ok()
                    && bits.parse::<u8>().map(|b| b <= 32).unwrap_or(false)
            })
            .unwrap_or(false);
        if !cidr_ok {
            return Err(Error::validation_for_field(
                "kubernetes.podNetworkCidr",
                format!("'{}' is not an IPv4 CIDR", self.pod_network_cidr),
            ));
        }

        if !self.overlay_manifest_url.starts_with("https://") {
            return Err(Error::validation_for_field(
                "kubernetes.overlayManifestUrl",
                "must be an https URL",
            ));
        }
        Ok(())
    }
}
