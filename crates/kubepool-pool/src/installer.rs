//! Pool bootstrap orchestration
//!
//! One pass takes a pool from "VMs exist" to "every instance is a cluster
//! member". Instances are processed one at a time, each through
//! `NotStarted -> PrerequisitesEnsured -> RoleApplied -> Done`, over a single
//! connection that is closed before the next instance starts.
//!
//! Nothing is rolled back on failure. Every step is guarded by a probe or a
//! store lookup so a re-run picks up where the last one stopped.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{info, instrument, warn};

use kubepool_common::{Error, Result, API_SERVER_PORT};

use crate::access::{InfrastructureProvisioner, Instance, InstanceAccessResolver};
use crate::checks::{is_bootstrapped, is_cluster_member, probe_succeeds, EndpointProbe};
use crate::config::{KubernetesSettings, Timings};
use crate::executor::{NodeEndpoint, RemoteExecutor, RemoteShell, Script};
use crate::kubeconfig::rewrite_server;
use crate::role::{
    invalidate_published_credentials, ClusterState, NodeRole, NodeRoleResolver, PoolRole,
    RoleDecision,
};
use crate::scripts::{self, CONTROL_PLANE_FIREWALL, WORKER_FIREWALL};
use crate::store::{secret_key, CoordinationStore, SecretPurpose};

/// The pool a pass operates on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolSpec {
    /// Cluster the pool belongs to; prefixes every coordination key
    pub cluster: String,
    /// Scale-set name
    pub pool: String,
    /// Declared role
    pub role: PoolRole,
    /// Instances that must be running before bootstrap starts
    pub expected_instances: usize,
    /// Load balancer carrying the pool's SSH NAT mappings
    pub load_balancer: String,
}

impl PoolSpec {
    /// Check names and counts before touching anything
    pub fn validate(&self) -> Result<()> {
        if self.cluster.is_empty() {
            return Err(Error::validation_for_field("cluster", "must not be empty"));
        }
        if !self
            .cluster
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-')
        {
            return Err(Error::validation_for_field(
                "cluster",
                "may only contain letters, digits and '-'",
            ));
        }
        if self.pool.is_empty() {
            return Err(Error::validation_for_field("pool", "must not be empty"));
        }
        if self.load_balancer.is_empty() {
            return Err(Error::validation_for_field("loadBalancer", "must not be empty"));
        }
        if self.expected_instances == 0 {
            return Err(Error::validation_for_field(
                "expectedInstances",
                "must be at least 1",
            ));
        }
        Ok(())
    }
}

/// Step of an instance's bootstrap, as reported in errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapStep {
    /// Opening the connection to the node
    Connect,
    /// Moving to `PrerequisitesEnsured`
    Prerequisites,
    /// Moving to `RoleApplied`
    RoleApplied,
}

impl fmt::Display for BootstrapStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BootstrapStep::Connect => write!(f, "connect"),
            BootstrapStep::Prerequisites => write!(f, "prerequisites"),
            BootstrapStep::RoleApplied => write!(f, "role-applied"),
        }
    }
}

/// How an instance ended up
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum InstanceOutcome {
    /// Initialized or joined in this pass
    Bootstrapped,
    /// Already a member; nothing changed on the node
    AlreadyMember,
    /// Already a member; missing credentials were published again
    CredentialsRepublished,
}

/// Result for one instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstanceReport {
    /// Instance name
    pub instance: String,
    /// Role it was bootstrapped as
    pub role: NodeRole,
    /// What happened
    pub outcome: InstanceOutcome,
}

/// Result of a successful pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PassReport {
    /// Cluster name
    pub cluster: String,
    /// Pool name
    pub pool: String,
    /// Per-instance results, in processing order
    pub instances: Vec<InstanceReport>,
}

impl PassReport {
    /// Instances whose state changed in this pass
    pub fn changed(&self) -> usize {
        self.instances
            .iter()
            .filter(|r| r.outcome != InstanceOutcome::AlreadyMember)
            .count()
    }
}

/// Per-instance wall-clock budget, checked between steps
struct Budget<'a> {
    instance: &'a str,
    deadline: Instant,
    limit: std::time::Duration,
}

impl Budget<'_> {
    fn check(&self, step: BootstrapStep) -> Result<()> {
        if Instant::now() >= self.deadline {
            return Err(Error::DeadlineExceeded {
                instance: self.instance.to_string(),
                step: step.to_string(),
                budget: self.limit,
            });
        }
        Ok(())
    }
}

/// Drives a pool through bootstrap
pub struct PoolBootstrapper {
    provisioner: Arc<dyn InfrastructureProvisioner>,
    access: InstanceAccessResolver,
    store: CoordinationStore,
    shell: Arc<dyn RemoteShell>,
    probe: Arc<dyn EndpointProbe>,
    resolver: NodeRoleResolver,
    timings: Timings,
    kubernetes: KubernetesSettings,
}

impl PoolBootstrapper {
    /// Assemble a bootstrapper from its collaborators
    pub fn new(
        provisioner: Arc<dyn InfrastructureProvisioner>,
        store: CoordinationStore,
        shell: Arc<dyn RemoteShell>,
        probe: Arc<dyn EndpointProbe>,
        timings: Timings,
        kubernetes: KubernetesSettings,
    ) -> Self {
        Self {
            access: InstanceAccessResolver::new(provisioner.clone()),
            provisioner,
            store,
            shell,
            probe,
            resolver: NodeRoleResolver,
            timings,
            kubernetes,
        }
    }

    /// Run one pass over a pool
    ///
    /// Stops at the first failing instance; the error names the instance
    /// and the step it was in.
    #[instrument(skip(self), fields(cluster = %spec.cluster, pool = %spec.pool, role = %spec.role))]
    pub async fn run(&self, spec: &PoolSpec) -> Result<PassReport> {
        spec.validate()?;
        self.timings.validate()?;
        self.kubernetes.validate()?;

        let instances = self
            .access
            .wait_until_running(
                &spec.pool,
                spec.expected_instances,
                self.timings.running_timeout(),
                self.timings.running_poll(),
            )
            .await?;
        let ports = self
            .access
            .resolve_access(&spec.pool, &spec.load_balancer)
            .await?;
        let public_address = self.access.public_address(&spec.load_balancer).await?;

        let mut state = match spec.role {
            PoolRole::ControlPlane => {
                ClusterState::observe(
                    self.provisioner.as_ref(),
                    &self.store,
                    self.probe.as_ref(),
                    &spec.cluster,
                    &spec.pool,
                    self.timings.health_check_timeout(),
                )
                .await?
            }
            // Workers only consume credentials; cluster health is irrelevant
            PoolRole::Worker => ClusterState::default(),
        };
        let mut first_control_plane_bootstrapped = false;

        info!(instances = instances.len(), public_address = %public_address, "Starting bootstrap pass");

        let mut report = PassReport {
            cluster: spec.cluster.clone(),
            pool: spec.pool.clone(),
            instances: Vec::with_capacity(instances.len()),
        };

        for instance in &instances {
            let endpoint = endpoint_for(&instance.name, &public_address, &ports, &spec.pool)?;
            let decision =
                self.resolver
                    .resolve(spec.role, &state, first_control_plane_bootstrapped);

            if decision.rebuild {
                invalidate_published_credentials(&self.store, &spec.cluster).await?;
            }

            let outcome = self
                .bootstrap_instance(spec, instance, &endpoint, decision)
                .await?;

            if decision.role == NodeRole::FirstControlPlane {
                state = ClusterState::bootstrapped();
                first_control_plane_bootstrapped = true;
            }

            report.instances.push(InstanceReport {
                instance: instance.name.clone(),
                role: decision.role,
                outcome,
            });
        }

        for entry in &report.instances {
            info!(instance = %entry.instance, role = %entry.role, outcome = ?entry.outcome, "Instance done");
        }
        info!(
            instances = report.instances.len(),
            changed = report.changed(),
            "Bootstrap pass complete"
        );
        Ok(report)
    }

    /// Bootstrap one instance over its own connection
    ///
    /// The connection is closed before returning, whatever the outcome.
    #[instrument(skip(self, spec, endpoint, decision), fields(instance = %instance.name, role = %decision.role))]
    pub(crate) async fn bootstrap_instance(
        &self,
        spec: &PoolSpec,
        instance: &Instance,
        endpoint: &NodeEndpoint,
        decision: RoleDecision,
    ) -> Result<InstanceOutcome> {
        let budget = Budget {
            instance: &instance.name,
            deadline: Instant::now() + self.timings.instance_budget(),
            limit: self.timings.instance_budget(),
        };

        let exec = self
            .shell
            .connect(endpoint)
            .await
            .map_err(|e| e.into_error(&instance.name).in_step(&instance.name, BootstrapStep::Connect))?;

        let result = self
            .drive(spec, instance, exec.as_ref(), decision, &budget, &endpoint.host)
            .await;

        if let Err(e) = exec.close().await {
            warn!(instance = %instance.name, error = %e, "Failed to close connection");
        }

        result
    }

    async fn drive(
        &self,
        spec: &PoolSpec,
        instance: &Instance,
        exec: &dyn RemoteExecutor,
        decision: RoleDecision,
        budget: &Budget<'_>,
        public_address: &str,
    ) -> Result<InstanceOutcome> {
        let name = instance.name.as_str();

        budget.check(BootstrapStep::Prerequisites)?;
        self.ensure_prerequisites(exec, decision.role)
            .await
            .map_err(|e| e.in_step(name, BootstrapStep::Prerequisites))?;
        info!(instance = %name, "Prerequisites ensured");

        budget.check(BootstrapStep::RoleApplied)?;
        let outcome = match decision.role {
            NodeRole::FirstControlPlane => {
                self.apply_first_control_plane(spec, instance, exec, budget, public_address)
                    .await
            }
            NodeRole::AdditionalControlPlane => {
                self.apply_additional_control_plane(spec, instance, exec)
                    .await
            }
            NodeRole::Worker => self.apply_worker(spec, exec).await,
        }
        .map_err(|e| e.in_step(name, BootstrapStep::RoleApplied))?;

        info!(instance = %name, outcome = ?outcome, "Role applied");
        Ok(outcome)
    }

    async fn ensure_prerequisites(&self, exec: &dyn RemoteExecutor, role: NodeRole) -> Result<()> {
        if is_bootstrapped(exec).await? {
            info!(instance = %exec.instance(), "Toolchain already present, skipping prerequisites");
            return Ok(());
        }

        run(exec, &scripts::install_prerequisites(&self.kubernetes)).await?;

        let rules = if role.is_control_plane() {
            CONTROL_PLANE_FIREWALL
        } else {
            WORKER_FIREWALL
        };
        for rule in rules {
            if !probe_succeeds(exec, &rule.probe()).await? {
                run(exec, &rule.allow()).await?;
            }
        }
        Ok(())
    }

    async fn apply_first_control_plane(
        &self,
        spec: &PoolSpec,
        instance: &Instance,
        exec: &dyn RemoteExecutor,
        budget: &Budget<'_>,
        public_address: &str,
    ) -> Result<InstanceOutcome> {
        let private = instance.private_address.as_str();

        if is_cluster_member(exec).await? {
            // A previous pass may have stopped between init and the overlay
            info!(instance = %instance.name, "Already a control plane, reapplying post-init steps");
            run(exec, &scripts::multi_master_patch(private)).await?;
            run(exec, &scripts::configure_local_access()).await?;
            self.install_overlay(exec).await?;
            return self
                .ensure_credentials_published(spec, exec, private, public_address)
                .await;
        }

        run(
            exec,
            &scripts::kubeadm_init(private, public_address, &self.kubernetes.pod_network_cidr),
        )
        .await?;
        run(exec, &scripts::multi_master_patch(private)).await?;
        run(exec, &scripts::configure_local_access()).await?;
        self.publish_kubeconfig(spec, exec, public_address).await?;
        self.install_overlay(exec).await?;

        info!(
            instance = %instance.name,
            delay_secs = self.timings.stabilization_delay().as_secs(),
            "Waiting for control plane to settle"
        );
        tokio::time::sleep(self.timings.stabilization_delay()).await;
        budget.check(BootstrapStep::RoleApplied)?;

        let (worker_join, master_join) = self.issue_join_commands(exec, private).await?;
        self.publish_credentials(spec, public_address, &worker_join, &master_join)
            .await?;
        Ok(InstanceOutcome::Bootstrapped)
    }

    async fn install_overlay(&self, exec: &dyn RemoteExecutor) -> Result<()> {
        run(
            exec,
            &scripts::install_overlay_network(&self.kubernetes.overlay_manifest_url),
        )
        .await?;
        Ok(())
    }

    /// Republish whatever a restarted first control plane is missing
    async fn ensure_credentials_published(
        &self,
        spec: &PoolSpec,
        exec: &dyn RemoteExecutor,
        private: &str,
        public_address: &str,
    ) -> Result<InstanceOutcome> {
        let mut missing = Vec::new();
        for purpose in SecretPurpose::CREDENTIALS {
            if self
                .store
                .get(&secret_key(&spec.cluster, purpose))
                .await?
                .is_none()
            {
                missing.push(purpose);
            }
        }
        let kubeconfig_missing = self
            .store
            .get(&secret_key(&spec.cluster, SecretPurpose::Kubeconfig))
            .await?
            .is_none();

        if missing.is_empty() && !kubeconfig_missing {
            return Ok(InstanceOutcome::AlreadyMember);
        }

        if !missing.is_empty() {
            info!(
                missing = ?missing.iter().map(SecretPurpose::as_str).collect::<Vec<_>>(),
                "Regenerating join credentials"
            );
            let (worker_join, master_join) = self.issue_join_commands(exec, private).await?;
            self.publish_credentials(spec, public_address, &worker_join, &master_join)
                .await?;
        }
        if kubeconfig_missing {
            self.publish_kubeconfig(spec, exec, public_address).await?;
        }
        Ok(InstanceOutcome::CredentialsRepublished)
    }

    /// Worker and control-plane join commands, both pinned to the private address
    async fn issue_join_commands(
        &self,
        exec: &dyn RemoteExecutor,
        private: &str,
    ) -> Result<(String, String)> {
        let printed = run(exec, &scripts::create_join_token()).await?;
        let worker_join = scripts::pin_join_endpoint(&scripts::parse_join_command(&printed)?, private);
        scripts::validate_join_command(&worker_join)?;

        let uploaded = run(exec, &scripts::upload_certs()).await?;
        let certificate_key = scripts::parse_certificate_key(&uploaded)?;
        let master_join = scripts::control_plane_join_command(&worker_join, &certificate_key);
        Ok((worker_join, master_join))
    }

    async fn publish_credentials(
        &self,
        spec: &PoolSpec,
        public_address: &str,
        worker_join: &str,
        master_join: &str,
    ) -> Result<()> {
        let endpoint = format!("{}:{}", public_address, API_SERVER_PORT);
        self.store
            .set(&secret_key(&spec.cluster, SecretPurpose::ApiEndpoint), &endpoint)
            .await?;
        self.store
            .set(&secret_key(&spec.cluster, SecretPurpose::WorkerJoin), worker_join)
            .await?;
        self.store
            .set(&secret_key(&spec.cluster, SecretPurpose::MasterJoin), master_join)
            .await?;
        info!(cluster = %spec.cluster, api_endpoint = %endpoint, "Published join credentials");
        Ok(())
    }

    async fn publish_kubeconfig(
        &self,
        spec: &PoolSpec,
        exec: &dyn RemoteExecutor,
        public_address: &str,
    ) -> Result<()> {
        let admin = run(exec, &scripts::read_admin_kubeconfig()).await?;
        let external = rewrite_server(
            &admin,
            &format!("https://{}:{}", public_address, API_SERVER_PORT),
        )?;
        self.store
            .set(&secret_key(&spec.cluster, SecretPurpose::Kubeconfig), &external)
            .await?;
        info!(cluster = %spec.cluster, "Published admin kubeconfig");
        Ok(())
    }

    async fn apply_additional_control_plane(
        &self,
        spec: &PoolSpec,
        instance: &Instance,
        exec: &dyn RemoteExecutor,
    ) -> Result<InstanceOutcome> {
        if is_cluster_member(exec).await? {
            info!(instance = %instance.name, "Already a cluster member, skipping join");
            return Ok(InstanceOutcome::AlreadyMember);
        }

        let join = self
            .store
            .wait_for(
                &secret_key(&spec.cluster, SecretPurpose::MasterJoin),
                self.timings.wait_attempts,
                self.timings.wait_interval(),
            )
            .await?;
        scripts::validate_join_command(&join)?;

        run(exec, &scripts::join_control_plane(&join, &instance.private_address)).await?;
        run(exec, &scripts::configure_local_access()).await?;
        Ok(InstanceOutcome::Bootstrapped)
    }

    async fn apply_worker(&self, spec: &PoolSpec, exec: &dyn RemoteExecutor) -> Result<InstanceOutcome> {
        if is_cluster_member(exec).await? {
            info!(instance = %exec.instance(), "Already a cluster member, skipping join");
            return Ok(InstanceOutcome::AlreadyMember);
        }

        let join = self
            .store
            .wait_for(
                &secret_key(&spec.cluster, SecretPurpose::WorkerJoin),
                self.timings.wait_attempts,
                self.timings.wait_interval(),
            )
            .await?;
        scripts::validate_join_command(&join)?;

        run(exec, &scripts::join_worker(&join)).await?;
        Ok(InstanceOutcome::Bootstrapped)
    }
}

/// Run a non-probe script; any failure is an error carrying the output
async fn run(exec: &dyn RemoteExecutor, script: &Script) -> Result<String> {
    info!(instance = %exec.instance(), script = %script.name, "Running");
    exec.execute(script)
        .await
        .map_err(|e| e.into_error(exec.instance()))
}

fn endpoint_for(
    instance: &str,
    public_address: &str,
    ports: &BTreeMap<String, u16>,
    pool: &str,
) -> Result<NodeEndpoint> {
    let port = ports.get(instance).copied().ok_or_else(|| {
        Error::access_for(pool, format!("no NAT port mapped to {}", instance))
            .in_step(instance, BootstrapStep::Connect)
    })?;
    Ok(NodeEndpoint {
        instance: instance.to_string(),
        host: public_address.to_string(),
        port,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::{InboundNatPool, LoadBalancerInfo, MockInfrastructureProvisioner, ScaleSetVm};
    use crate::checks::MockEndpointProbe;
    use crate::executor::ExecError;
    use crate::store::{BackendError, SecretBackend};
    use async_trait::async_trait;
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;
    use std::time::Duration;

    const CLUSTER: &str = "prod";
    const PUBLIC: &str = "20.1.2.3";
    const JOIN_HASH: &str = "sha256:0f4b4e0a4e1b2cdbb3a2d2ba0ea9e9c1e0c3a3b0f7a3ccf5b42e0d5b8e2c6c1a";
    const CERT_KEY: &str = "9c6d9f1b2f0a9c7e4b3e8d6a1f5c2b7e0d4a3c9b8e7f6a5d4c3b2a1f0e9d8c7b";

    // =========================================================================
    // In-memory secret backend
    // =========================================================================

    #[derive(Default)]
    struct MemoryState {
        live: HashMap<String, String>,
        soft_deleted: HashSet<String>,
        ops: Vec<String>,
    }

    /// Secret store that soft-deletes like the real one and logs every call
    #[derive(Default)]
    struct MemoryBackend {
        state: Mutex<MemoryState>,
    }

    impl MemoryBackend {
        fn with(entries: &[(&str, &str)]) -> Self {
            let backend = Self::default();
            {
                let mut state = backend.state.lock().unwrap();
                for (k, v) in entries {
                    state.live.insert(k.to_string(), v.to_string());
                }
            }
            backend
        }

        fn ops(&self) -> Vec<String> {
            self.state.lock().unwrap().ops.clone()
        }

        fn value(&self, key: &str) -> Option<String> {
            self.state.lock().unwrap().live.get(key).cloned()
        }

        fn writes(&self) -> Vec<String> {
            self.ops()
                .into_iter()
                .filter(|op| op.starts_with("set ") || op.starts_with("delete ") || op.starts_with("purge "))
                .collect()
        }
    }

    #[async_trait]
    impl SecretBackend for MemoryBackend {
        async fn get(&self, name: &str) -> std::result::Result<String, BackendError> {
            let mut state = self.state.lock().unwrap();
            state.ops.push(format!("get {}", name));
            state.live.get(name).cloned().ok_or(BackendError::NotFound)
        }

        async fn set(&self, name: &str, value: &str) -> std::result::Result<(), BackendError> {
            let mut state = self.state.lock().unwrap();
            state.ops.push(format!("set {}", name));
            if state.soft_deleted.contains(name) {
                return Err(BackendError::SoftDeleted);
            }
            state.live.insert(name.to_string(), value.to_string());
            Ok(())
        }

        async fn delete(&self, name: &str) -> std::result::Result<(), BackendError> {
            let mut state = self.state.lock().unwrap();
            state.ops.push(format!("delete {}", name));
            match state.live.remove(name) {
                Some(_) => {
                    state.soft_deleted.insert(name.to_string());
                    Ok(())
                }
                None => Err(BackendError::NotFound),
            }
        }

        async fn purge_deleted(&self, name: &str) -> std::result::Result<(), BackendError> {
            let mut state = self.state.lock().unwrap();
            state.ops.push(format!("purge {}", name));
            state.soft_deleted.remove(name);
            Ok(())
        }
    }

    // =========================================================================
    // Fake nodes
    // =========================================================================

    #[derive(Debug, Default, Clone)]
    struct NodeState {
        bootstrapped: bool,
        member: bool,
        firewall: HashSet<String>,
    }

    #[derive(Default)]
    struct FleetState {
        nodes: HashMap<String, NodeState>,
        /// (instance, script name, mutating, body)
        commands: Vec<(String, String, bool, String)>,
        opened: usize,
        closed: usize,
        fail_script: Option<String>,
    }

    /// Remote shell over simulated nodes that react to script names
    #[derive(Clone, Default)]
    struct FakeShell {
        fleet: Arc<Mutex<FleetState>>,
    }

    impl FakeShell {
        fn with_node(self, instance: &str, node: NodeState) -> Self {
            self.fleet
                .lock()
                .unwrap()
                .nodes
                .insert(instance.to_string(), node);
            self
        }

        fn failing_on(self, script: &str) -> Self {
            self.fleet.lock().unwrap().fail_script = Some(script.to_string());
            self
        }

        fn clear_failure(&self) {
            self.fleet.lock().unwrap().fail_script = None;
        }

        fn commands(&self) -> Vec<(String, String, bool, String)> {
            self.fleet.lock().unwrap().commands.clone()
        }

        fn script_names_for(&self, instance: &str) -> Vec<String> {
            self.commands()
                .into_iter()
                .filter(|(i, ..)| i == instance)
                .map(|(_, name, ..)| name)
                .collect()
        }

        fn mutating_count(&self) -> usize {
            self.commands().iter().filter(|(_, _, m, _)| *m).count()
        }

        fn connections(&self) -> (usize, usize) {
            let fleet = self.fleet.lock().unwrap();
            (fleet.opened, fleet.closed)
        }
    }

    #[async_trait]
    impl RemoteShell for FakeShell {
        async fn connect(
            &self,
            endpoint: &NodeEndpoint,
        ) -> std::result::Result<Box<dyn RemoteExecutor>, ExecError> {
            self.fleet.lock().unwrap().opened += 1;
            Ok(Box::new(FakeExecutor {
                instance: endpoint.instance.clone(),
                fleet: self.fleet.clone(),
            }))
        }
    }

    struct FakeExecutor {
        instance: String,
        fleet: Arc<Mutex<FleetState>>,
    }

    fn failed(script: &Script) -> ExecError {
        ExecError::Failed {
            script: script.name.clone(),
            code: Some(1),
            output: String::new(),
        }
    }

    #[async_trait]
    impl RemoteExecutor for FakeExecutor {
        fn instance(&self) -> &str {
            &self.instance
        }

        async fn execute(&self, script: &Script) -> std::result::Result<String, ExecError> {
            let mut fleet = self.fleet.lock().unwrap();
            fleet.commands.push((
                self.instance.clone(),
                script.name.clone(),
                script.mutating,
                script.body.clone(),
            ));
            if fleet.fail_script.as_deref() == Some(script.name.as_str()) {
                return Err(ExecError::Failed {
                    script: script.name.clone(),
                    code: Some(1),
                    output: "[ERROR] simulated failure".to_string(),
                });
            }

            let node = fleet.nodes.entry(self.instance.clone()).or_default();
            let name = script.name.as_str();
            match name {
                "probe-bootstrapped" if node.bootstrapped => Ok(String::new()),
                "probe-bootstrapped" => Err(failed(script)),
                "probe-member" if node.member => Ok(String::new()),
                "probe-member" => Err(failed(script)),
                "install-prerequisites" => {
                    node.bootstrapped = true;
                    Ok(String::new())
                }
                "kubeadm-init" | "join-control-plane" | "join-worker" => {
                    node.member = true;
                    Ok(String::new())
                }
                "read-admin-kubeconfig" => Ok(
                    "apiVersion: v1\nkind: Config\nclusters:\n- name: kubernetes\n  cluster:\n    server: https://10.0.0.4:6443\n"
                        .to_string(),
                ),
                "create-join-token" => Ok(format!(
                    "kubeadm join 10.0.0.4:6443 --token abcdef.0123456789abcdef --discovery-token-ca-cert-hash {}\n",
                    JOIN_HASH
                )),
                "upload-certs" => Ok(format!(
                    "[upload-certs] Storing the certificates in Secret \"kubeadm-certs\"\n[upload-certs] Using certificate key:\n{}\n",
                    CERT_KEY
                )),
                n if n.starts_with("probe-firewall-") => {
                    let rule = n.trim_start_matches("probe-firewall-");
                    if node.firewall.contains(rule) {
                        Ok(String::new())
                    } else {
                        Err(failed(script))
                    }
                }
                n if n.starts_with("allow-firewall-") => {
                    node.firewall
                        .insert(n.trim_start_matches("allow-firewall-").to_string());
                    Ok(String::new())
                }
                _ => Ok(String::new()),
            }
        }

        async fn close(&self) -> std::result::Result<(), ExecError> {
            self.fleet.lock().unwrap().closed += 1;
            Ok(())
        }
    }

    // =========================================================================
    // Fixtures
    // =========================================================================

    fn fast_timings() -> Timings {
        Timings {
            wait_attempts: 4,
            wait_interval_secs: 30,
            ..Default::default()
        }
    }

    fn provisioner(pool: &'static str, count: usize, other_cp_pools: &'static [&'static str]) -> MockInfrastructureProvisioner {
        let mut provisioner = MockInfrastructureProvisioner::new();
        provisioner.expect_list_pool_vms().returning(move |_| {
            Ok((0..count)
                .map(|i| ScaleSetVm {
                    name: format!("{}_{}", pool, i),
                    instance_id: i.to_string(),
                    private_address: Some(format!("10.0.0.{}", 4 + i)),
                })
                .collect())
        });
        provisioner.expect_load_balancer().returning(move |_| {
            Ok(LoadBalancerInfo {
                name: "lb".to_string(),
                public_address: PUBLIC.to_string(),
                nat_rules: vec![],
                nat_pools: vec![InboundNatPool {
                    name: format!("{}-ssh", pool),
                    frontend_port_start: 50000,
                    frontend_port_end: 50099,
                    backend_port: 22,
                }],
            })
        });
        provisioner.expect_control_plane_pools().returning(move |_| {
            let mut pools: Vec<String> = other_cp_pools.iter().map(|p| p.to_string()).collect();
            pools.push("cp".to_string());
            Ok(pools)
        });
        provisioner
    }

    fn probe(reachable: bool) -> MockEndpointProbe {
        let mut probe = MockEndpointProbe::new();
        probe.expect_reachable().returning(move |_, _| reachable);
        probe
    }

    fn bootstrapper(
        provisioner: MockInfrastructureProvisioner,
        backend: Arc<MemoryBackend>,
        shell: FakeShell,
        probe: MockEndpointProbe,
    ) -> PoolBootstrapper {
        PoolBootstrapper::new(
            Arc::new(provisioner),
            CoordinationStore::new(backend, Duration::from_secs(10)),
            Arc::new(shell),
            Arc::new(probe),
            fast_timings(),
            KubernetesSettings::default(),
        )
    }

    fn spec(pool: &str, role: PoolRole, expected: usize) -> PoolSpec {
        PoolSpec {
            cluster: CLUSTER.to_string(),
            pool: pool.to_string(),
            role,
            expected_instances: expected,
            load_balancer: "lb".to_string(),
        }
    }

    fn joined() -> NodeState {
        NodeState {
            bootstrapped: true,
            member: true,
            firewall: HashSet::new(),
        }
    }

    fn master_join() -> String {
        format!(
            "kubeadm join 10.0.0.4:6443 --token abcdef.0123456789abcdef --discovery-token-ca-cert-hash {} --control-plane --certificate-key {}",
            JOIN_HASH, CERT_KEY
        )
    }

    fn worker_join() -> String {
        format!(
            "kubeadm join 10.0.0.4:6443 --token abcdef.0123456789abcdef --discovery-token-ca-cert-hash {}",
            JOIN_HASH
        )
    }

    /// Backend holding everything a healthy cluster publishes
    fn published_cluster() -> MemoryBackend {
        let worker = worker_join();
        let master = master_join();
        MemoryBackend::with(&[
            ("prod-api-endpoint", "20.1.2.3:6443"),
            ("prod-worker-join", worker.as_str()),
            ("prod-master-join", master.as_str()),
            ("prod-kubeconfig", "apiVersion: v1\n"),
        ])
    }

    // =========================================================================
    // Scenarios
    // =========================================================================

    /// Story: three fresh control-plane VMs become a three-master cluster
    #[tokio::test(start_paused = true)]
    async fn story_three_node_control_plane_from_scratch() {
        let backend = Arc::new(MemoryBackend::default());
        let shell = FakeShell::default();
        let b = bootstrapper(provisioner("cp", 3, &[]), backend.clone(), shell.clone(), probe(false));

        let report = b.run(&spec("cp", PoolRole::ControlPlane, 3)).await.unwrap();

        let roles: Vec<NodeRole> = report.instances.iter().map(|r| r.role).collect();
        assert_eq!(
            roles,
            vec![
                NodeRole::FirstControlPlane,
                NodeRole::AdditionalControlPlane,
                NodeRole::AdditionalControlPlane
            ]
        );
        assert!(report
            .instances
            .iter()
            .all(|r| r.outcome == InstanceOutcome::Bootstrapped));

        // Instance 1 published the three credentials plus the kubeconfig
        assert_eq!(backend.value("prod-api-endpoint").as_deref(), Some("20.1.2.3:6443"));
        assert_eq!(backend.value("prod-worker-join"), Some(worker_join()));
        assert_eq!(backend.value("prod-master-join"), Some(master_join()));
        let kubeconfig = backend.value("prod-kubeconfig").unwrap();
        assert!(kubeconfig.contains("https://20.1.2.3:6443"));

        // Instances 2 and 3 consumed master-join and joined with their own address
        let ops = backend.ops();
        assert_eq!(
            ops.iter().filter(|op| *op == "get prod-master-join").count(),
            2
        );
        let joins: Vec<(String, String)> = shell
            .commands()
            .into_iter()
            .filter(|(_, name, ..)| name == "join-control-plane")
            .map(|(instance, _, _, body)| (instance, body))
            .collect();
        assert_eq!(joins.len(), 2);
        assert_eq!(joins[0].0, "cp_1");
        assert!(joins[0].1.contains("--certificate-key"));
        assert!(joins[0].1.ends_with("--apiserver-advertise-address=10.0.0.5"));
        assert!(joins[1].1.ends_with("--apiserver-advertise-address=10.0.0.6"));

        // First node ran init, patch and overlay in that order
        let first = shell.script_names_for("cp_0");
        let pos = |s: &str| first.iter().position(|n| n == s).unwrap();
        assert!(pos("kubeadm-init") < pos("multi-master-patch"));
        assert!(pos("multi-master-patch") < pos("install-overlay-network"));
        assert!(pos("install-overlay-network") < pos("create-join-token"));

        // One connection per instance, all released
        assert_eq!(shell.connections(), (3, 3));
    }

    /// Story: two workers join a healthy cluster without touching control-plane secrets
    #[tokio::test(start_paused = true)]
    async fn story_worker_pool_joins_healthy_cluster() {
        let backend = Arc::new(published_cluster());
        let shell = FakeShell::default();
        let b = bootstrapper(provisioner("workers", 2, &[]), backend.clone(), shell.clone(), probe(true));

        let report = b.run(&spec("workers", PoolRole::Worker, 2)).await.unwrap();

        assert!(report.instances.iter().all(|r| r.role == NodeRole::Worker));
        let ops = backend.ops();
        assert_eq!(ops, vec!["get prod-worker-join", "get prod-worker-join"]);
        assert!(backend.writes().is_empty());

        let joins: Vec<String> = shell
            .commands()
            .into_iter()
            .filter(|(_, name, ..)| name == "join-worker")
            .map(|(_, _, _, body)| body)
            .collect();
        assert_eq!(joins, vec![format!("sudo {}", worker_join()); 2]);
        assert_eq!(shell.connections(), (2, 2));
    }

    /// Story: re-running a finished control plane changes nothing
    #[tokio::test(start_paused = true)]
    async fn story_rerun_against_joined_cluster_is_a_noop() {
        let backend = Arc::new(published_cluster());
        let shell = FakeShell::default()
            .with_node("cp_0", joined())
            .with_node("cp_1", joined())
            .with_node("cp_2", joined());
        let b = bootstrapper(provisioner("cp", 3, &[]), backend.clone(), shell.clone(), probe(true));

        let report = b.run(&spec("cp", PoolRole::ControlPlane, 3)).await.unwrap();

        assert!(report
            .instances
            .iter()
            .all(|r| r.role == NodeRole::AdditionalControlPlane
                && r.outcome == InstanceOutcome::AlreadyMember));
        assert_eq!(report.changed(), 0);
        assert_eq!(shell.mutating_count(), 0);
        assert!(backend.writes().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rerun_worker_pool_is_a_noop() {
        let backend = Arc::new(published_cluster());
        let shell = FakeShell::default()
            .with_node("cp_0", joined())
            .with_node("cp_1", joined());
        let b = bootstrapper(provisioner("cp", 2, &[]), backend.clone(), shell.clone(), probe(true));

        b.run(&spec("cp", PoolRole::Worker, 2)).await.unwrap();
        assert_eq!(shell.mutating_count(), 0);
        assert!(backend.ops().is_empty());
    }

    /// Story: the old control plane is gone; stale credentials are removed first
    #[tokio::test(start_paused = true)]
    async fn story_unhealthy_control_plane_is_rebuilt() {
        let backend = Arc::new(published_cluster());
        let shell = FakeShell::default();
        let b = bootstrapper(
            provisioner("cp", 1, &["cp-old"]),
            backend.clone(),
            shell.clone(),
            probe(false),
        );

        let report = b.run(&spec("cp", PoolRole::ControlPlane, 1)).await.unwrap();
        assert_eq!(report.instances[0].role, NodeRole::FirstControlPlane);

        let writes = backend.writes();
        let first_set = writes.iter().position(|op| op.starts_with("set ")).unwrap();
        let deletes: Vec<&String> = writes[..first_set].iter().collect();
        assert_eq!(
            deletes,
            vec![
                "delete prod-worker-join",
                "delete prod-master-join",
                "delete prod-api-endpoint"
            ]
        );

        // Soft-deleted names were purged and republished
        assert!(writes.contains(&"purge prod-api-endpoint".to_string()));
        assert_eq!(backend.value("prod-master-join"), Some(master_join()));
        assert_eq!(backend.value("prod-api-endpoint").as_deref(), Some("20.1.2.3:6443"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_healthy_cluster_never_assigns_first_control_plane() {
        let backend = Arc::new(published_cluster());
        let shell = FakeShell::default();
        let b = bootstrapper(
            provisioner("cp", 2, &["cp-old"]),
            backend.clone(),
            shell.clone(),
            probe(true),
        );

        let report = b.run(&spec("cp", PoolRole::ControlPlane, 2)).await.unwrap();
        assert!(report
            .instances
            .iter()
            .all(|r| r.role == NodeRole::AdditionalControlPlane));
        assert!(!shell
            .commands()
            .iter()
            .any(|(_, name, ..)| name == "kubeadm-init"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_restarted_first_control_plane_republishes_missing_credentials() {
        // Init finished last time but nothing got published
        let backend = Arc::new(MemoryBackend::default());
        let shell = FakeShell::default().with_node("cp_0", joined());
        let b = bootstrapper(provisioner("cp", 1, &[]), backend.clone(), shell.clone(), probe(false));

        let report = b.run(&spec("cp", PoolRole::ControlPlane, 1)).await.unwrap();

        assert_eq!(report.instances[0].role, NodeRole::FirstControlPlane);
        assert_eq!(report.instances[0].outcome, InstanceOutcome::CredentialsRepublished);
        let names = shell.script_names_for("cp_0");
        assert!(!names.contains(&"kubeadm-init".to_string()));
        assert!(names.contains(&"create-join-token".to_string()));
        assert!(backend.value("prod-master-join").is_some());
        assert!(backend.value("prod-kubeconfig").is_some());
    }

    /// Story: a pass dies after init; the next pass finishes the control plane
    #[tokio::test(start_paused = true)]
    async fn story_rerun_after_failed_patch_completes_first_control_plane() {
        let backend = Arc::new(MemoryBackend::default());
        let shell = FakeShell::default().failing_on("multi-master-patch");
        let first = bootstrapper(provisioner("cp", 1, &[]), backend.clone(), shell.clone(), probe(false));

        first.run(&spec("cp", PoolRole::ControlPlane, 1)).await.unwrap_err();
        assert!(backend.writes().is_empty());
        let before = shell.commands().len();

        shell.clear_failure();
        let second = bootstrapper(provisioner("cp", 1, &[]), backend.clone(), shell.clone(), probe(false));
        let report = second.run(&spec("cp", PoolRole::ControlPlane, 1)).await.unwrap();

        assert_eq!(report.instances[0].role, NodeRole::FirstControlPlane);
        assert_eq!(report.instances[0].outcome, InstanceOutcome::CredentialsRepublished);

        let rerun: Vec<String> = shell.commands()[before..]
            .iter()
            .map(|(_, name, ..)| name.clone())
            .collect();
        let pos = |s: &str| rerun.iter().position(|n| n == s).unwrap();
        assert!(!rerun.contains(&"kubeadm-init".to_string()));
        assert!(pos("multi-master-patch") < pos("install-overlay-network"));
        assert!(pos("configure-local-access") < pos("install-overlay-network"));
        assert!(pos("install-overlay-network") < pos("create-join-token"));
        assert!(shell.commands()[before..]
            .iter()
            .any(|(_, name, _, body)| name == "multi-master-patch" && body.contains("10.0.0.4:6443")));
        assert_eq!(backend.value("prod-api-endpoint").as_deref(), Some("20.1.2.3:6443"));
        assert!(backend.value("prod-kubeconfig").is_some());
    }

    /// Story: nobody ever publishes master-join
    #[tokio::test(start_paused = true)]
    async fn story_master_join_never_published_times_out() {
        let backend = Arc::new(MemoryBackend::default());
        let shell = FakeShell::default();
        let b = bootstrapper(provisioner("cp", 1, &[]), backend.clone(), shell.clone(), probe(true));

        let instance = Instance {
            name: "cp_1".to_string(),
            instance_id: "1".to_string(),
            private_address: "10.0.0.5".to_string(),
            index: 1,
        };
        let endpoint = NodeEndpoint {
            instance: "cp_1".to_string(),
            host: PUBLIC.to_string(),
            port: 50001,
        };
        let decision = RoleDecision {
            role: NodeRole::AdditionalControlPlane,
            rebuild: false,
        };

        let err = b
            .bootstrap_instance(&spec("cp", PoolRole::ControlPlane, 1), &instance, &endpoint, decision)
            .await
            .unwrap_err();

        assert_eq!(err.instance(), Some("cp_1"));
        assert_eq!(err.step(), Some("role-applied"));
        let msg = err.to_string();
        assert!(msg.contains("prod-master-join"));
        assert!(msg.contains("4 attempts"));
        assert_eq!(
            backend
                .ops()
                .iter()
                .filter(|op| *op == "get prod-master-join")
                .count(),
            4
        );
        assert!(!shell
            .script_names_for("cp_1")
            .contains(&"join-control-plane".to_string()));
        // Connection released on failure too
        assert_eq!(shell.connections(), (1, 1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_worker_without_published_join_fails_the_pass() {
        let backend = Arc::new(MemoryBackend::default());
        let shell = FakeShell::default();
        let b = bootstrapper(provisioner("cp", 2, &[]), backend.clone(), shell.clone(), probe(true));

        let err = b.run(&spec("cp", PoolRole::Worker, 2)).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Bootstrap { ref source, .. } if matches!(**source, Error::StoreTimeout { .. })
        ));
        // Fail-fast: the second instance is never contacted
        assert_eq!(shell.connections(), (1, 1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_command_failure_names_instance_and_step() {
        let backend = Arc::new(MemoryBackend::default());
        let shell = FakeShell::default().failing_on("kubeadm-init");
        let b = bootstrapper(provisioner("cp", 3, &[]), backend.clone(), shell.clone(), probe(false));

        let err = b.run(&spec("cp", PoolRole::ControlPlane, 3)).await.unwrap_err();

        assert_eq!(err.instance(), Some("cp_0"));
        assert_eq!(err.step(), Some("role-applied"));
        match err {
            Error::Bootstrap { source, .. } => match *source {
                Error::Remote { output, .. } => assert!(output.contains("simulated failure")),
                other => panic!("Expected Remote, got {:?}", other),
            },
            other => panic!("Expected Bootstrap, got {:?}", other),
        }
        assert!(backend.writes().is_empty());
        assert_eq!(shell.connections(), (1, 1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_prerequisites_open_only_missing_firewall_rules() {
        let backend = Arc::new(published_cluster());
        let mut node = NodeState::default();
        node.firewall.insert("10250-tcp".to_string());
        let shell = FakeShell::default().with_node("cp_0", node);
        let b = bootstrapper(provisioner("cp", 1, &[]), backend, shell.clone(), probe(true));

        b.run(&spec("cp", PoolRole::Worker, 1)).await.unwrap();

        let names = shell.script_names_for("cp_0");
        assert!(names.contains(&"install-prerequisites".to_string()));
        assert!(names.contains(&"probe-firewall-10250-tcp".to_string()));
        assert!(!names.contains(&"allow-firewall-10250-tcp".to_string()));
        assert!(names.contains(&"allow-firewall-30000-32767-tcp".to_string()));
        assert!(names.contains(&"allow-firewall-8472-udp".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_bootstrapped_node_skips_prerequisites() {
        let backend = Arc::new(published_cluster());
        let node = NodeState {
            bootstrapped: true,
            ..Default::default()
        };
        let shell = FakeShell::default().with_node("cp_0", node);
        let b = bootstrapper(provisioner("cp", 1, &[]), backend, shell.clone(), probe(true));

        b.run(&spec("cp", PoolRole::Worker, 1)).await.unwrap();

        let names = shell.script_names_for("cp_0");
        assert!(!names.contains(&"install-prerequisites".to_string()));
        assert!(!names.iter().any(|n| n.starts_with("allow-firewall-")));
        assert!(names.contains(&"join-worker".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_budget_stops_before_next_step() {
        let backend = Arc::new(MemoryBackend::default());
        let shell = FakeShell::default();
        let mut b = bootstrapper(provisioner("cp", 1, &[]), backend.clone(), shell.clone(), probe(false));
        b.timings.instance_budget_secs = 30;
        b.timings.stabilization_delay_secs = 60;

        let err = b.run(&spec("cp", PoolRole::ControlPlane, 1)).await.unwrap_err();

        match err {
            Error::DeadlineExceeded {
                instance, budget, ..
            } => {
                assert_eq!(instance, "cp_0");
                assert_eq!(budget, Duration::from_secs(30));
            }
            other => panic!("Expected DeadlineExceeded, got {:?}", other),
        }
        // The running init was not interrupted; token creation never started
        let names = shell.script_names_for("cp_0");
        assert!(names.contains(&"install-overlay-network".to_string()));
        assert!(!names.contains(&"create-join-token".to_string()));
        assert_eq!(shell.connections(), (1, 1));
    }

    #[test]
    fn test_pool_spec_validation() {
        assert!(spec("cp", PoolRole::ControlPlane, 3).validate().is_ok());
        assert!(spec("cp", PoolRole::ControlPlane, 0).validate().is_err());
        let mut bad = spec("cp", PoolRole::ControlPlane, 1);
        bad.cluster = "prod;rm".to_string();
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_missing_nat_port_is_connect_error() {
        let ports = BTreeMap::from([("cp_0".to_string(), 50000u16)]);
        let err = endpoint_for("cp_1", PUBLIC, &ports, "cp").unwrap_err();
        assert_eq!(err.step(), Some("connect"));
        assert_eq!(
            endpoint_for("cp_0", PUBLIC, &ports, "cp").unwrap().port,
            50000
        );
    }
}
