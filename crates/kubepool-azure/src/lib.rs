//! Azure backends for kubepool
//!
//! - [`KeyVaultBackend`]: coordination store on Key Vault secrets
//! - [`ArmProvisioner`]: scale sets, NICs and load balancers via Resource Manager
//!
//! Both take a bearer token supplied by the caller; acquiring one is left to
//! whatever identity tooling the operator already uses.

#![deny(missing_docs)]

pub mod arm;
pub mod keyvault;
pub mod models;

pub use arm::{ArmProvisioner, ResourceScope, ARM_ENDPOINT};
pub use keyvault::{KeyVaultBackend, KEYVAULT_API_VERSION};
