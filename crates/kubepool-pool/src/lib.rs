//! Bootstrap orchestration for kubeadm clusters on VM scale sets
//!
//! A [`PoolBootstrapper`] takes a pool of freshly created VMs and turns each
//! one into a control-plane or worker node. It has no channel to the nodes
//! other than SSH through the pool's load balancer NAT, and no state of its
//! own: join credentials are exchanged through a [`CoordinationStore`], and
//! the role of every node is decided from what that store and the
//! infrastructure report at the start of the pass.
//!
//! The cloud and transport seams are traits ([`InfrastructureProvisioner`],
//! [`SecretBackend`], [`RemoteShell`], [`EndpointProbe`]) so the orchestrator
//! is independent of any one provider.

#![deny(missing_docs)]

pub mod access;
pub mod checks;
pub mod config;
pub mod executor;
pub mod installer;
pub mod kubeconfig;
pub mod role;
pub mod scripts;
pub mod ssh;
pub mod store;

pub use access::{
    InboundNatPool, InboundNatRule, InfrastructureProvisioner, Instance, InstanceAccessResolver,
    LoadBalancerInfo, ScaleSetVm,
};
pub use checks::{EndpointProbe, TcpProbe};
pub use config::{KubernetesSettings, Timings};
pub use executor::{ExecError, NodeEndpoint, RemoteExecutor, RemoteShell, Script};
pub use installer::{
    BootstrapStep, InstanceOutcome, InstanceReport, PassReport, PoolBootstrapper, PoolSpec,
};
pub use role::{ClusterState, NodeRole, NodeRoleResolver, PoolRole, RoleDecision};
pub use ssh::SshShell;
pub use store::{secret_key, BackendError, CoordinationStore, SecretBackend, SecretPurpose};
