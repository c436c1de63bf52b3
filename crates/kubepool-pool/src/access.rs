//! Instance discovery and NAT reachability
//!
//! Pool members have no public address of their own. Each one is reached
//! through the pool's load balancer: either an explicit per-instance inbound
//! NAT rule or a NAT pool whose frontend port range is handed out in
//! instance order.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

#[cfg(test)]
use mockall::automock;

use kubepool_common::retry::poll_until_deadline;
use kubepool_common::{Error, Result, SSH_BACKEND_PORT};

/// One scale-set VM as reported by the provisioner
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScaleSetVm {
    /// Instance name (`{pool}_{instanceId}`)
    pub name: String,
    /// Scale-set instance identifier
    pub instance_id: String,
    /// Primary private address, once the NIC has one
    pub private_address: Option<String>,
}

/// Explicit inbound NAT rule on a load balancer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundNatRule {
    /// Rule name
    pub name: String,
    /// Externally reachable port
    pub frontend_port: u16,
    /// Port on the instance
    pub backend_port: u16,
    /// Resource ID of the backend IP configuration, if bound
    pub backend_ip_configuration: Option<String>,
}

/// Inbound NAT pool: a port range spread across a scale set
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundNatPool {
    /// Pool name
    pub name: String,
    /// First port of the frontend range
    pub frontend_port_start: u16,
    /// Last port of the frontend range (inclusive)
    pub frontend_port_end: u16,
    /// Port on the instances
    pub backend_port: u16,
}

/// Front-end view of a load balancer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadBalancerInfo {
    /// Load balancer name
    pub name: String,
    /// Public IP or FQDN of the frontend
    pub public_address: String,
    /// Explicit per-instance rules
    pub nat_rules: Vec<InboundNatRule>,
    /// Range-based NAT pools
    pub nat_pools: Vec<InboundNatPool>,
}

/// Read-only view of infrastructure created before bootstrap
#[cfg_attr(test, automock)]
#[async_trait]
pub trait InfrastructureProvisioner: Send + Sync {
    /// VMs currently in a scale-set pool
    async fn list_pool_vms(&self, pool: &str) -> Result<Vec<ScaleSetVm>>;

    /// NAT and frontend configuration of a load balancer
    async fn load_balancer(&self, name: &str) -> Result<LoadBalancerInfo>;

    /// Names of the control-plane pools tagged for a cluster
    async fn control_plane_pools(&self, cluster: &str) -> Result<Vec<String>>;
}

/// A pool member ready to be bootstrapped
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instance {
    /// Instance name
    pub name: String,
    /// Scale-set instance identifier
    pub instance_id: String,
    /// Primary private address
    pub private_address: String,
    /// Position in discovery order
    pub index: usize,
}

/// Maps a pool's instances to addresses and NAT ports
#[derive(Clone)]
pub struct InstanceAccessResolver {
    provisioner: Arc<dyn InfrastructureProvisioner>,
}

impl InstanceAccessResolver {
    /// Create a resolver backed by a provisioner
    pub fn new(provisioner: Arc<dyn InfrastructureProvisioner>) -> Self {
        Self { provisioner }
    }

    /// Instances that report a private address, in instance-id order
    pub async fn list_instances(&self, pool: &str) -> Result<Vec<Instance>> {
        let mut vms: Vec<ScaleSetVm> = self
            .provisioner
            .list_pool_vms(pool)
            .await?
            .into_iter()
            .filter(|vm| vm.private_address.as_deref().is_some_and(|a| !a.is_empty()))
            .collect();
        vms.sort_by(|a, b| instance_order(&a.instance_id, &b.instance_id));

        Ok(vms
            .into_iter()
            .enumerate()
            .filter_map(|(index, vm)| {
                vm.private_address.map(|private_address| Instance {
                    name: vm.name,
                    instance_id: vm.instance_id,
                    private_address,
                    index,
                })
            })
            .collect())
    }

    /// Map each instance name to the frontend port that reaches its sshd
    ///
    /// Per-instance NAT rules win; without any, the NAT pool's range is used
    /// with port = start + instance index. An empty mapping is an error.
    pub async fn resolve_access(
        &self,
        pool: &str,
        load_balancer: &str,
    ) -> Result<BTreeMap<String, u16>> {
        let lb = self.provisioner.load_balancer(load_balancer).await?;

        let mut ports = ports_from_rules(pool, &lb.nat_rules);
        if ports.is_empty() {
            debug!(pool = %pool, load_balancer = %load_balancer, "No per-instance NAT rules, trying NAT pools");
            let instances = self.list_instances(pool).await?;
            ports = ports_from_pool(pool, &lb.nat_pools, &instances);
        }

        if ports.is_empty() {
            return Err(Error::access_for(
                pool,
                format!("load balancer {} has no SSH NAT mapping for this pool", load_balancer),
            ));
        }

        info!(pool = %pool, load_balancer = %load_balancer, mappings = ports.len(), "Resolved NAT ports");
        Ok(ports)
    }

    /// Public address shared by every NAT mapping of the load balancer
    pub async fn public_address(&self, load_balancer: &str) -> Result<String> {
        let lb = self.provisioner.load_balancer(load_balancer).await?;
        if lb.public_address.is_empty() {
            return Err(Error::access_for(
                load_balancer,
                "load balancer has no public frontend address",
            ));
        }
        Ok(lb.public_address)
    }

    /// Wait until at least `expected` instances report a private address
    pub async fn wait_until_running(
        &self,
        pool: &str,
        expected: usize,
        timeout: Duration,
        interval: Duration,
    ) -> Result<Vec<Instance>> {
        let start = tokio::time::Instant::now();
        let description = format!("{} instances running", pool);

        let outcome = poll_until_deadline(&description, timeout, interval, || async move {
            let instances = self.list_instances(pool).await?;
            info!(pool = %pool, found = instances.len(), expected, "Checked running instances");
            Ok((instances.len() >= expected, instances))
        })
        .await?;

        match outcome {
            Ok(instances) => Ok(instances),
            Err(last) => Err(Error::InstancesNotRunning {
                pool: pool.to_string(),
                expected,
                found: last.len(),
                elapsed: start.elapsed(),
            }),
        }
    }
}

/// Numeric instance ids sort numerically, anything else lexically after them
fn instance_order(a: &str, b: &str) -> std::cmp::Ordering {
    match (a.parse::<u64>(), b.parse::<u64>()) {
        (Ok(x), Ok(y)) => x.cmp(&y),
        (Ok(_), Err(_)) => std::cmp::Ordering::Less,
        (Err(_), Ok(_)) => std::cmp::Ordering::Greater,
        (Err(_), Err(_)) => a.cmp(b),
    }
}

/// Extract `(scale set, instance id)` from a backend IP configuration ID
///
/// `.../virtualMachineScaleSets/{vmss}/virtualMachines/{id}/networkInterfaces/...`
pub fn parse_backend_instance(resource_id: &str) -> Option<(String, String)> {
    let segments: Vec<&str> = resource_id.split('/').collect();
    let vmss_at = segments
        .iter()
        .position(|s| s.eq_ignore_ascii_case("virtualMachineScaleSets"))?;
    let vmss = segments.get(vmss_at + 1)?;
    let marker = segments.get(vmss_at + 2)?;
    let id = segments.get(vmss_at + 3)?;
    if !marker.eq_ignore_ascii_case("virtualMachines") || vmss.is_empty() || id.is_empty() {
        return None;
    }
    Some((vmss.to_string(), id.to_string()))
}

fn ports_from_rules(pool: &str, rules: &[InboundNatRule]) -> BTreeMap<String, u16> {
    let mut ports = BTreeMap::new();
    for rule in rules.iter().filter(|r| r.backend_port == SSH_BACKEND_PORT) {
        let Some(config_id) = rule.backend_ip_configuration.as_deref() else {
            continue;
        };
        match parse_backend_instance(config_id) {
            Some((vmss, id)) if vmss.eq_ignore_ascii_case(pool) => {
                ports.insert(format!("{}_{}", pool, id), rule.frontend_port);
            }
            Some(_) => {}
            None => warn!(rule = %rule.name, "Unrecognized NAT rule backend, skipping"),
        }
    }
    ports
}

fn ports_from_pool(
    pool: &str,
    nat_pools: &[InboundNatPool],
    instances: &[Instance],
) -> BTreeMap<String, u16> {
    let ssh_pools = || nat_pools.iter().filter(|p| p.backend_port == SSH_BACKEND_PORT);
    let lowered = pool.to_lowercase();
    let Some(nat_pool) = ssh_pools()
        .find(|p| p.name.to_lowercase().contains(&lowered))
        .or_else(|| ssh_pools().next())
    else {
        return BTreeMap::new();
    };

    let mut ports = BTreeMap::new();
    for instance in instances {
        let port = u32::from(nat_pool.frontend_port_start) + instance.index as u32;
        match u16::try_from(port) {
            Ok(port) if port <= nat_pool.frontend_port_end => {
                ports.insert(instance.name.clone(), port);
            }
            _ => warn!(
                instance = %instance.name,
                nat_pool = %nat_pool.name,
                "Instance index is beyond the NAT pool port range, skipping"
            ),
        }
    }
    ports
}
