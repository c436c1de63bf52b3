//! Shell scripts run on the nodes, and parsers for what they print
//!
//! Every builder returns a named [`Script`]; names are what shows up in logs
//! and errors, bodies are never logged.

use kubepool_common::{Error, Result, API_SERVER_PORT};

use crate::config::KubernetesSettings;
use crate::executor::Script;

const ADMIN_KUBECONFIG: &str = "/etc/kubernetes/admin.conf";

/// Characters that would let a published join command run something else
const FORBIDDEN_JOIN_CHARS: &[char] = &[';', '|', '&', '$', '`', '\n', '\r', '>', '<'];

/// Toolchain presence: container runtime, kubeadm and kubelet
pub fn probe_bootstrapped() -> Script {
    Script::probe(
        "probe-bootstrapped",
        "command -v containerd >/dev/null \
         && command -v kubeadm >/dev/null \
         && command -v kubelet >/dev/null \
         && sudo kubeadm version -o short >/dev/null \
         && systemctl is-active --quiet containerd",
    )
}

/// Kubelet joined to a cluster, or an API server already listening
pub fn probe_member() -> Script {
    Script::probe(
        "probe-member",
        format!(
            "sudo test -f /etc/kubernetes/kubelet.conf || sudo ss -ltn | grep -q ':{} '",
            API_SERVER_PORT
        ),
    )
}

/// Install containerd, kubeadm, kubelet and kubectl on Ubuntu
pub fn install_prerequisites(kubernetes: &KubernetesSettings) -> Script {
    let version = &kubernetes.version;
    Script::mutating(
        "install-prerequisites",
        format!(
            r#"set -euo pipefail
export DEBIAN_FRONTEND=noninteractive
sudo swapoff -a
sudo sed -i '/\sswap\s/ s/^/#/' /etc/fstab
printf 'overlay\nbr_netfilter\n' | sudo tee /etc/modules-load.d/k8s.conf >/dev/null
sudo modprobe overlay
sudo modprobe br_netfilter
printf 'net.bridge.bridge-nf-call-iptables = 1\nnet.bridge.bridge-nf-call-ip6tables = 1\nnet.ipv4.ip_forward = 1\n' | sudo tee /etc/sysctl.d/k8s.conf >/dev/null
sudo sysctl --system >/dev/null
sudo apt-get update -q
sudo apt-get install -y -q apt-transport-https ca-certificates curl gpg containerd
sudo mkdir -p /etc/containerd /etc/apt/keyrings
containerd config default | sudo tee /etc/containerd/config.toml >/dev/null
sudo sed -i 's/SystemdCgroup = false/SystemdCgroup = true/' /etc/containerd/config.toml
sudo systemctl restart containerd
sudo systemctl enable containerd
curl -fsSL https://pkgs.k8s.io/core:/stable:/v{version}/deb/Release.key | sudo gpg --batch --yes --dearmor -o /etc/apt/keyrings/kubernetes-apt-keyring.gpg
echo 'deb [signed-by=/etc/apt/keyrings/kubernetes-apt-keyring.gpg] https://pkgs.k8s.io/core:/stable:/v{version}/deb/ /' | sudo tee /etc/apt/sources.list.d/kubernetes.list >/dev/null
sudo apt-get update -q
sudo apt-get install -y -q kubelet kubeadm kubectl
sudo apt-mark hold kubelet kubeadm kubectl
sudo systemctl enable --now kubelet
"#
        ),
    )
}

/// A host firewall port that must be open for a node role
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FirewallRule {
    /// Port or `start:end` range in ufw syntax
    pub port: &'static str,
    /// `tcp` or `udp`
    pub proto: &'static str,
}

const fn rule(port: &'static str, proto: &'static str) -> FirewallRule {
    FirewallRule { port, proto }
}

/// API server, etcd, kubelet, controller-manager, scheduler, flannel VXLAN
pub const CONTROL_PLANE_FIREWALL: &[FirewallRule] = &[
    rule("6443", "tcp"),
    rule("2379:2380", "tcp"),
    rule("10250", "tcp"),
    rule("10257", "tcp"),
    rule("10259", "tcp"),
    rule("8472", "udp"),
];

/// Kubelet, NodePort range, flannel VXLAN
pub const WORKER_FIREWALL: &[FirewallRule] = &[
    rule("10250", "tcp"),
    rule("30000:32767", "tcp"),
    rule("8472", "udp"),
];

impl FirewallRule {
    fn slug(&self) -> String {
        format!("{}-{}", self.port.replace(':', "-"), self.proto)
    }

    /// Succeeds only if the rule is already present
    pub fn probe(&self) -> Script {
        Script::probe(
            format!("probe-firewall-{}", self.slug()),
            format!(
                "sudo ufw status | grep -qE '^{}/{}[[:space:]]'",
                self.port, self.proto
            ),
        )
    }

    /// Add the allow rule
    pub fn allow(&self) -> Script {
        Script::mutating(
            format!("allow-firewall-{}", self.slug()),
            format!("sudo ufw allow {}/{}", self.port, self.proto),
        )
    }
}

/// Initialize the first control plane bound to its private address
pub fn kubeadm_init(private_address: &str, public_address: &str, pod_network_cidr: &str) -> Script {
    Script::mutating(
        "kubeadm-init",
        format!(
            "sudo kubeadm init \
             --apiserver-advertise-address={private} \
             --apiserver-cert-extra-sans={private},{public} \
             --pod-network-cidr={cidr} \
             --upload-certs",
            private = private_address,
            public = public_address,
            cidr = pod_network_cidr,
        ),
    )
}

/// Write `controlPlaneEndpoint` into the kubeadm ClusterConfiguration
///
/// A cluster initialized without a control-plane endpoint refuses
/// control-plane joins; patching it in after init keeps init independent of
/// external DNS.
pub fn multi_master_patch(private_address: &str) -> Script {
    let endpoint = format!("{}:{}", private_address, API_SERVER_PORT);
    Script::mutating(
        "multi-master-patch",
        format!(
            r#"set -euo pipefail
KUBECTL="sudo kubectl --kubeconfig {admin}"
TMP=$(mktemp)
$KUBECTL -n kube-system get configmap kubeadm-config -o jsonpath='{{.data.ClusterConfiguration}}' > "$TMP"
if grep -q '^controlPlaneEndpoint:' "$TMP"; then
  sed -i 's|^controlPlaneEndpoint:.*|controlPlaneEndpoint: {endpoint}|' "$TMP"
else
  echo 'controlPlaneEndpoint: {endpoint}' >> "$TMP"
fi
$KUBECTL -n kube-system create configmap kubeadm-config --from-file=ClusterConfiguration="$TMP" --dry-run=client -o yaml | $KUBECTL apply -f -
rm -f "$TMP"
"#,
            admin = ADMIN_KUBECONFIG,
            endpoint = endpoint,
        ),
    )
}

/// Give the login user a working `kubectl`
pub fn configure_local_access() -> Script {
    Script::mutating(
        "configure-local-access",
        format!(
            "mkdir -p \"$HOME/.kube\" \
             && sudo cp -f {} \"$HOME/.kube/config\" \
             && sudo chown \"$(id -u):$(id -g)\" \"$HOME/.kube/config\"",
            ADMIN_KUBECONFIG
        ),
    )
}

/// Print the admin kubeconfig
pub fn read_admin_kubeconfig() -> Script {
    Script::probe("read-admin-kubeconfig", format!("sudo cat {}", ADMIN_KUBECONFIG))
}

/// Apply the overlay network manifest
pub fn install_overlay_network(manifest_url: &str) -> Script {
    Script::mutating(
        "install-overlay-network",
        format!(
            "sudo kubectl --kubeconfig {} apply -f {}",
            ADMIN_KUBECONFIG, manifest_url
        ),
    )
}

/// Mint a bootstrap token and print the worker join command
pub fn create_join_token() -> Script {
    Script::mutating("create-join-token", "sudo kubeadm token create --print-join-command")
}

/// Re-upload control-plane certificates and print the decryption key
pub fn upload_certs() -> Script {
    Script::mutating("upload-certs", "sudo kubeadm init phase upload-certs --upload-certs")
}

/// Join this node as an additional control plane
pub fn join_control_plane(join_command: &str, private_address: &str) -> Script {
    Script::mutating(
        "join-control-plane",
        format!(
            "sudo {} --apiserver-advertise-address={}",
            join_command, private_address
        ),
    )
}

/// Join this node as a worker
pub fn join_worker(join_command: &str) -> Script {
    Script::mutating("join-worker", format!("sudo {}", join_command))
}

/// Find the `kubeadm join ...` line in `token create` output
pub fn parse_join_command(output: &str) -> Result<String> {
    output
        .lines()
        .map(str::trim)
        .find(|line| line.starts_with("kubeadm join "))
        .map(str::to_string)
        .ok_or_else(|| Error::serialization_for_kind("join-command", "no kubeadm join line in output"))
}

/// Point a join command at `{private}:6443` regardless of what kubeadm printed
pub fn pin_join_endpoint(join_command: &str, private_address: &str) -> String {
    let mut parts: Vec<String> = join_command.split_whitespace().map(str::to_string).collect();
    if let Some(endpoint) = parts.get_mut(2) {
        if !endpoint.starts_with("--") {
            *endpoint = format!("{}:{}", private_address, API_SERVER_PORT);
        }
    }
    parts.join(" ")
}

/// The certificate key is the last line of `upload-certs` output
pub fn parse_certificate_key(output: &str) -> Result<String> {
    let key = output
        .lines()
        .map(str::trim)
        .rev()
        .find(|line| !line.is_empty())
        .unwrap_or_default();

    if key.len() == 64 && key.chars().all(|c| c.is_ascii_hexdigit()) {
        Ok(key.to_string())
    } else {
        Err(Error::serialization_for_kind(
            "certificate-key",
            "upload-certs output did not end with a 64-character hex key",
        ))
    }
}

/// Control-plane join command built from the worker one
pub fn control_plane_join_command(worker_join: &str, certificate_key: &str) -> String {
    format!(
        "{} --control-plane --certificate-key {}",
        worker_join, certificate_key
    )
}

/// Reject anything that is not a plain `kubeadm join` invocation
///
/// Join commands come out of the shared store and are run with sudo.
pub fn validate_join_command(join_command: &str) -> Result<()> {
    if !join_command.starts_with("kubeadm join ") {
        return Err(Error::validation("published join command is not a kubeadm join"));
    }
    if join_command.contains(FORBIDDEN_JOIN_CHARS) {
        return Err(Error::validation(
            "published join command contains shell metacharacters",
        ));
    }
    Ok(())
}
