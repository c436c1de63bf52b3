//! `kubepool status` - what the next pass would see
//!
//! Prints the observed cluster state, which coordination keys are published
//! (never their values) and, when an admin kubeconfig is published, the
//! readiness of every node.

use std::collections::BTreeMap;
use std::time::Duration;

use clap::Args;
use k8s_openapi::api::core::v1::Node;
use kube::api::{Api, ListParams};
use serde::Serialize;
use tracing::warn;

use kubepool_pool::{secret_key, ClusterState, CoordinationStore, PoolRole, SecretPurpose, TcpProbe};

use super::bootstrap::OutputFormat;
use super::{coordination_store, kube_client_from_yaml, provisioner, AzureTokenArgs, ConfigArgs};
use crate::{Error, Result};

const CONTROL_PLANE_LABEL: &str = "node-role.kubernetes.io/control-plane";

/// Show cluster state, published keys and node readiness
#[derive(Args, Debug)]
pub struct StatusArgs {
    #[command(flatten)]
    pub config: ConfigArgs,

    #[command(flatten)]
    pub tokens: AzureTokenArgs,

    /// Skip listing nodes through the published kubeconfig
    #[arg(long)]
    pub no_nodes: bool,

    /// Output format
    #[arg(short, long, default_value = "table")]
    pub output: OutputFormat,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusReport {
    cluster: String,
    pool: String,
    role: PoolRole,
    state: ClusterState,
    published: BTreeMap<String, bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    nodes: Option<Vec<NodeStatus>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    nodes_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
struct NodeStatus {
    name: String,
    control_plane: bool,
    ready: bool,
    kubelet_version: Option<String>,
}

pub async fn run(args: StatusArgs) -> Result<()> {
    let config = args.config.load()?;
    let store = coordination_store(&config, &args.tokens.keyvault_token)?;
    let provisioner = provisioner(&config, &args.tokens.azure_token)?;
    let cluster = &config.pool.cluster;

    let state = ClusterState::observe(
        provisioner.as_ref(),
        &store,
        &TcpProbe,
        cluster,
        &config.pool.pool,
        config.timings.health_check_timeout(),
    )
    .await?;

    let mut published = BTreeMap::new();
    for purpose in [
        SecretPurpose::WorkerJoin,
        SecretPurpose::MasterJoin,
        SecretPurpose::ApiEndpoint,
        SecretPurpose::Kubeconfig,
    ] {
        let key = secret_key(cluster, purpose);
        let present = store.get(&key).await?.is_some();
        published.insert(key, present);
    }

    let mut report = StatusReport {
        cluster: cluster.clone(),
        pool: config.pool.pool.clone(),
        role: config.pool.role,
        state,
        published,
        nodes: None,
        nodes_error: None,
    };

    if !args.no_nodes {
        match list_nodes(&store, cluster, config.azure.request_timeout()).await {
            Ok(nodes) => report.nodes = nodes,
            Err(e) => {
                warn!(cluster = %cluster, error = %e, "Could not list nodes");
                report.nodes_error = Some(e.to_string());
            }
        }
    }

    match args.output {
        OutputFormat::Table => print!("{}", format_status(&report)),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
    }
    Ok(())
}

/// Nodes as seen through the published kubeconfig, `None` if none is published
async fn list_nodes(
    store: &CoordinationStore,
    cluster: &str,
    timeout: Duration,
) -> Result<Option<Vec<NodeStatus>>> {
    let Some(kubeconfig) = store
        .get(&secret_key(cluster, SecretPurpose::Kubeconfig))
        .await?
    else {
        return Ok(None);
    };

    let client = kube_client_from_yaml(&kubeconfig).await?;
    let nodes: Api<Node> = Api::all(client);
    let list = tokio::time::timeout(timeout, nodes.list(&ListParams::default()))
        .await
        .map_err(|_| Error::command_failed("timed out listing nodes"))?
        .map_err(|e| Error::command_failed(format!("failed to list nodes: {}", e)))?;

    let mut statuses: Vec<NodeStatus> = list.items.iter().map(node_status).collect();
    statuses.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(Some(statuses))
}

fn node_status(node: &Node) -> NodeStatus {
    let ready = node
        .status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .and_then(|conds| conds.iter().find(|c| c.type_ == "Ready"))
        .is_some_and(|c| c.status == "True");

    NodeStatus {
        name: node.metadata.name.clone().unwrap_or_default(),
        control_plane: node
            .metadata
            .labels
            .as_ref()
            .is_some_and(|l| l.contains_key(CONTROL_PLANE_LABEL)),
        ready,
        kubelet_version: node
            .status
            .as_ref()
            .and_then(|s| s.node_info.as_ref())
            .map(|i| i.kubelet_version.clone()),
    }
}

fn yes_no(b: bool) -> &'static str {
    if b {
        "yes"
    } else {
        "no"
    }
}

fn format_status(report: &StatusReport) -> String {
    let mut out = format!(
        "Cluster {} (pool {}, {:?})\n  initialized: {}\n  healthy:     {}\n\nPublished keys\n",
        report.cluster,
        report.pool,
        report.role,
        yes_no(report.state.initialized),
        yes_no(report.state.healthy)
    );
    for (key, present) in &report.published {
        out.push_str(&format!("  {:<32} {}\n", key, yes_no(*present)));
    }

    match (&report.nodes, &report.nodes_error) {
        (_, Some(err)) => out.push_str(&format!("\nNodes unavailable: {}\n", err)),
        (Some(nodes), None) => {
            out.push_str("\nNodes\n");
            for n in nodes {
                out.push_str(&format!(
                    "  {:<32} {:<14} {:<9} {}\n",
                    n.name,
                    if n.control_plane { "control-plane" } else { "worker" },
                    if n.ready { "Ready" } else { "NotReady" },
                    n.kubelet_version.as_deref().unwrap_or("-")
                ));
            }
        }
        (None, None) => {}
    }
    out
}
