//! Wire types for the Key Vault and Resource Manager REST APIs
//!
//! Only the fields kubepool reads are modelled; everything else in the
//! payloads is ignored.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use kubepool_pool::{InboundNatPool, InboundNatRule, ScaleSetVm};

/// Key Vault secret bundle (GET response)
#[derive(Debug, Clone, Deserialize)]
pub struct SecretBundle {
    /// Secret value
    pub value: String,
}

/// Key Vault secret write body (PUT request)
#[derive(Debug, Serialize)]
pub struct SecretSetRequest<'a> {
    /// Secret value
    pub value: &'a str,
}

/// Error envelope shared by Key Vault and Resource Manager
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorEnvelope {
    /// The error itself
    pub error: ErrorBody,
}

/// Error body, possibly with a more specific inner error
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorBody {
    /// Machine-readable code
    #[serde(default)]
    pub code: String,
    /// Human-readable message
    #[serde(default)]
    pub message: String,
    /// Nested error carrying the specific code
    #[serde(default, rename = "innererror")]
    pub inner_error: Option<Box<ErrorBody>>,
}

impl ErrorBody {
    /// True if this error or any nested one carries `code`
    pub fn has_code(&self, code: &str) -> bool {
        self.code == code
            || self
                .inner_error
                .as_deref()
                .is_some_and(|inner| inner.has_code(code))
    }
}

/// One page of a Resource Manager list operation
#[derive(Debug, Clone, Deserialize)]
pub struct Page<T> {
    /// Items on this page
    #[serde(default = "Vec::new")]
    pub value: Vec<T>,
    /// URL of the next page, absent on the last one
    #[serde(default, rename = "nextLink")]
    pub next_link: Option<String>,
}

/// Reference to another resource by ID
#[derive(Debug, Clone, Deserialize)]
pub struct SubResource {
    /// Full resource ID
    pub id: String,
}

/// Scale-set VM network interface
#[derive(Debug, Clone, Deserialize)]
pub struct NetworkInterface {
    /// NIC name
    #[serde(default)]
    pub name: String,
    /// NIC properties
    pub properties: NetworkInterfaceProperties,
}

/// Properties of a network interface
#[derive(Debug, Clone, Deserialize)]
pub struct NetworkInterfaceProperties {
    /// VM the NIC is attached to
    #[serde(default, rename = "virtualMachine")]
    pub virtual_machine: Option<SubResource>,
    /// IP configurations of the NIC
    #[serde(default, rename = "ipConfigurations")]
    pub ip_configurations: Vec<IpConfiguration>,
}

/// NIC IP configuration
#[derive(Debug, Clone, Deserialize)]
pub struct IpConfiguration {
    /// Configuration name
    #[serde(default)]
    pub name: String,
    /// Configuration properties
    pub properties: IpConfigurationProperties,
}

/// Properties of a NIC IP configuration
#[derive(Debug, Clone, Deserialize)]
pub struct IpConfigurationProperties {
    /// Private address, once allocated
    #[serde(default, rename = "privateIPAddress")]
    pub private_ip_address: Option<String>,
    /// Whether this is the NIC's primary configuration
    #[serde(default)]
    pub primary: Option<bool>,
}

impl NetworkInterface {
    /// The VM this NIC belongs to, as a pool member of scale set `vmss`
    ///
    /// The primary IP configuration's address wins; without one the first
    /// configuration that has an address is used.
    pub fn to_vm(&self, vmss: &str) -> Option<ScaleSetVm> {
        let vm_id = &self.properties.virtual_machine.as_ref()?.id;
        let instance_id = vm_id.rsplit('/').find(|s| !s.is_empty())?.to_string();

        let configs = &self.properties.ip_configurations;
        let private_address = configs
            .iter()
            .find(|c| c.properties.primary == Some(true))
            .and_then(|c| c.properties.private_ip_address.clone())
            .or_else(|| {
                configs
                    .iter()
                    .find_map(|c| c.properties.private_ip_address.clone())
            })
            .filter(|a| !a.is_empty());

        Some(ScaleSetVm {
            name: format!("{}_{}", vmss, instance_id),
            instance_id,
            private_address,
        })
    }
}

/// Load balancer resource
#[derive(Debug, Clone, Deserialize)]
pub struct LoadBalancer {
    /// Load balancer name
    pub name: String,
    /// Load balancer properties
    pub properties: LoadBalancerProperties,
}

/// Properties of a load balancer
#[derive(Debug, Clone, Deserialize)]
pub struct LoadBalancerProperties {
    /// Frontend IP configurations
    #[serde(default, rename = "frontendIPConfigurations")]
    pub frontend_ip_configurations: Vec<FrontendIpConfiguration>,
    /// Explicit NAT rules
    #[serde(default, rename = "inboundNatRules")]
    pub inbound_nat_rules: Vec<NatRule>,
    /// Range-based NAT pools
    #[serde(default, rename = "inboundNatPools")]
    pub inbound_nat_pools: Vec<NatPool>,
}

/// Load balancer frontend
#[derive(Debug, Clone, Deserialize)]
pub struct FrontendIpConfiguration {
    /// Frontend name
    #[serde(default)]
    pub name: String,
    /// Frontend properties
    pub properties: FrontendIpProperties,
}

/// Properties of a load balancer frontend
#[derive(Debug, Clone, Deserialize)]
pub struct FrontendIpProperties {
    /// Public IP resource bound to the frontend
    #[serde(default, rename = "publicIPAddress")]
    pub public_ip_address: Option<SubResource>,
}

/// Inbound NAT rule
#[derive(Debug, Clone, Deserialize)]
pub struct NatRule {
    /// Rule name
    pub name: String,
    /// Rule properties
    pub properties: NatRuleProperties,
}

/// Properties of an inbound NAT rule
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NatRuleProperties {
    /// Frontend port (absent on range-style rules)
    #[serde(default)]
    pub frontend_port: Option<u16>,
    /// Backend port
    #[serde(default)]
    pub backend_port: Option<u16>,
    /// Backend IP configuration the rule forwards to
    #[serde(default, rename = "backendIPConfiguration")]
    pub backend_ip_configuration: Option<SubResource>,
}

impl NatRule {
    /// Domain view; rules without a frontend or backend port are dropped
    pub fn to_rule(&self) -> Option<InboundNatRule> {
        Some(InboundNatRule {
            name: self.name.clone(),
            frontend_port: self.properties.frontend_port?,
            backend_port: self.properties.backend_port?,
            backend_ip_configuration: self
                .properties
                .backend_ip_configuration
                .as_ref()
                .map(|r| r.id.clone()),
        })
    }
}

/// Inbound NAT pool
#[derive(Debug, Clone, Deserialize)]
pub struct NatPool {
    /// Pool name
    pub name: String,
    /// Pool properties
    pub properties: NatPoolProperties,
}

/// Properties of an inbound NAT pool
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NatPoolProperties {
    /// First frontend port
    pub frontend_port_range_start: u16,
    /// Last frontend port (inclusive)
    pub frontend_port_range_end: u16,
    /// Backend port
    pub backend_port: u16,
}

impl From<&NatPool> for InboundNatPool {
    fn from(pool: &NatPool) -> Self {
        InboundNatPool {
            name: pool.name.clone(),
            frontend_port_start: pool.properties.frontend_port_range_start,
            frontend_port_end: pool.properties.frontend_port_range_end,
            backend_port: pool.properties.backend_port,
        }
    }
}

/// Public IP address resource
#[derive(Debug, Clone, Deserialize)]
pub struct PublicIpAddress {
    /// Public IP properties
    pub properties: PublicIpProperties,
}

/// Properties of a public IP address
#[derive(Debug, Clone, Deserialize)]
pub struct PublicIpProperties {
    /// Allocated address
    #[serde(default, rename = "ipAddress")]
    pub ip_address: Option<String>,
    /// DNS label settings
    #[serde(default, rename = "dnsSettings")]
    pub dns_settings: Option<DnsSettings>,
}

/// DNS settings of a public IP
#[derive(Debug, Clone, Deserialize)]
pub struct DnsSettings {
    /// Fully qualified domain name
    #[serde(default)]
    pub fqdn: Option<String>,
}

impl PublicIpAddress {
    /// The allocated address, falling back to the FQDN
    pub fn address(&self) -> Option<String> {
        self.properties
            .ip_address
            .clone()
            .filter(|a| !a.is_empty())
            .or_else(|| {
                self.properties
                    .dns_settings
                    .as_ref()
                    .and_then(|d| d.fqdn.clone())
                    .filter(|f| !f.is_empty())
            })
    }
}

/// Scale set resource (tags only)
#[derive(Debug, Clone, Deserialize)]
pub struct ScaleSet {
    /// Scale set name
    pub name: String,
    /// Resource tags
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

impl ScaleSet {
    /// Tagged as a control-plane pool of `cluster`
    pub fn is_control_plane_of(&self, cluster: &str) -> bool {
        self.tags.get("cluster").map(String::as_str) == Some(cluster)
            && self
                .tags
                .get("role")
                .is_some_and(|r| r.eq_ignore_ascii_case("control-plane"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nic_page_maps_to_pool_vms() {
        let page: Page<NetworkInterface> = serde_json::from_str(
            r#"{
              "value": [
                {
                  "name": "nic",
                  "properties": {
                    "virtualMachine": {"id": "/subscriptions/s/resourceGroups/rg/providers/Microsoft.Compute/virtualMachineScaleSets/cp/virtualMachines/3"},
                    "ipConfigurations": [
                      {"name": "secondary", "properties": {"privateIPAddress": "10.0.1.9", "primary": false}},
                      {"name": "ipconfig1", "properties": {"privateIPAddress": "10.0.0.7", "primary": true}}
                    ]
                  }
                },
                {
                  "name": "nic",
                  "properties": {
                    "virtualMachine": {"id": "/subscriptions/s/resourceGroups/rg/providers/Microsoft.Compute/virtualMachineScaleSets/cp/virtualMachines/4"},
                    "ipConfigurations": [{"name": "ipconfig1", "properties": {}}]
                  }
                }
              ],
              "nextLink": "https://management.azure.com/next"
            }"#,
        )
        .unwrap();

        assert_eq!(page.next_link.as_deref(), Some("https://management.azure.com/next"));
        let vms: Vec<ScaleSetVm> = page.value.iter().filter_map(|n| n.to_vm("cp")).collect();
        assert_eq!(
            vms,
            vec![
                ScaleSetVm {
                    name: "cp_3".to_string(),
                    instance_id: "3".to_string(),
                    private_address: Some("10.0.0.7".to_string()),
                },
                ScaleSetVm {
                    name: "cp_4".to_string(),
                    instance_id: "4".to_string(),
                    private_address: None,
                },
            ]
        );
    }

    #[test]
    fn test_detached_nic_is_skipped() {
        let nic: NetworkInterface =
            serde_json::from_str(r#"{"name": "orphan", "properties": {}}"#).unwrap();
        assert!(nic.to_vm("cp").is_none());
    }

    #[test]
    fn test_load_balancer_rules_and_pools() {
        let lb: LoadBalancer = serde_json::from_str(
            r#"{
              "name": "k8s-lb",
              "properties": {
                "frontendIPConfigurations": [
                  {"name": "fe", "properties": {"publicIPAddress": {"id": "/subscriptions/s/resourceGroups/rg/providers/Microsoft.Network/publicIPAddresses/k8s-ip"}}}
                ],
                "inboundNatRules": [
                  {"name": "ssh-0", "properties": {"frontendPort": 50000, "backendPort": 22,
                    "backendIPConfiguration": {"id": "/x/virtualMachineScaleSets/cp/virtualMachines/0/networkInterfaces/nic/ipConfigurations/ipconfig1"}}},
                  {"name": "range", "properties": {"backendPort": 22}}
                ],
                "inboundNatPools": [
                  {"name": "cp-ssh", "properties": {"frontendPortRangeStart": 50000, "frontendPortRangeEnd": 50099, "backendPort": 22, "protocol": "Tcp"}}
                ]
              }
            }"#,
        )
        .unwrap();

        let rules: Vec<InboundNatRule> = lb
            .properties
            .inbound_nat_rules
            .iter()
            .filter_map(NatRule::to_rule)
            .collect();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].frontend_port, 50000);
        assert!(rules[0]
            .backend_ip_configuration
            .as_deref()
            .is_some_and(|id| id.contains("virtualMachines/0")));

        let pool = InboundNatPool::from(&lb.properties.inbound_nat_pools[0]);
        assert_eq!((pool.frontend_port_start, pool.frontend_port_end), (50000, 50099));
        assert!(lb.properties.frontend_ip_configurations[0]
            .properties
            .public_ip_address
            .is_some());
    }

    #[test]
    fn test_public_ip_prefers_address_over_fqdn() {
        let ip: PublicIpAddress = serde_json::from_str(
            r#"{"properties": {"ipAddress": "20.1.2.3", "dnsSettings": {"fqdn": "k8s.westeurope.cloudapp.azure.com"}}}"#,
        )
        .unwrap();
        assert_eq!(ip.address().as_deref(), Some("20.1.2.3"));

        let dynamic: PublicIpAddress = serde_json::from_str(
            r#"{"properties": {"dnsSettings": {"fqdn": "k8s.westeurope.cloudapp.azure.com"}}}"#,
        )
        .unwrap();
        assert_eq!(
            dynamic.address().as_deref(),
            Some("k8s.westeurope.cloudapp.azure.com")
        );

        let none: PublicIpAddress = serde_json::from_str(r#"{"properties": {}}"#).unwrap();
        assert!(none.address().is_none());
    }

    #[test]
    fn test_scale_set_tags() {
        let page: Page<ScaleSet> = serde_json::from_str(
            r#"{"value": [
              {"name": "cp-a", "tags": {"cluster": "prod", "role": "control-plane"}},
              {"name": "workers", "tags": {"cluster": "prod", "role": "worker"}},
              {"name": "cp-b", "tags": {"cluster": "staging", "role": "control-plane"}},
              {"name": "untagged"}
            ]}"#,
        )
        .unwrap();

        let names: Vec<&str> = page
            .value
            .iter()
            .filter(|s| s.is_control_plane_of("prod"))
            .map(|s| s.name.as_str())
            .collect();
        assert_eq!(names, vec!["cp-a"]);
        assert!(page.next_link.is_none());
    }

    #[test]
    fn test_inner_error_code_lookup() {
        let envelope: ErrorEnvelope = serde_json::from_str(
            r#"{"error": {"code": "Conflict", "message": "Secret c-master-join is currently in a deleted but recoverable state",
                "innererror": {"code": "ObjectIsDeletedButRecoverable"}}}"#,
        )
        .unwrap();
        assert!(envelope.error.has_code("ObjectIsDeletedButRecoverable"));
        assert!(!envelope.error.has_code("SecretNotFound"));
    }
}
