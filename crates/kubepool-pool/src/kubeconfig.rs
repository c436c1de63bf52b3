//! Admin kubeconfig rewriting
//!
//! kubeadm writes the admin kubeconfig against the node's private address.
//! The published copy must point at the load balancer instead.

use kubepool_common::{Error, Result};
use serde_yaml::Value;

/// Replace every cluster's `server` with `server_url`
pub fn rewrite_server(kubeconfig: &str, server_url: &str) -> Result<String> {
    let mut doc: Value = serde_yaml::from_str(kubeconfig)
        .map_err(|e| Error::serialization_for_kind("kubeconfig", e.to_string()))?;

    let clusters = doc
        .get_mut("clusters")
        .and_then(Value::as_sequence_mut)
        .ok_or_else(|| Error::serialization_for_kind("kubeconfig", "missing clusters list"))?;

    let mut rewritten = 0usize;
    for entry in clusters.iter_mut() {
        if let Some(cluster) = entry.get_mut("cluster").and_then(Value::as_mapping_mut) {
            cluster.insert(
                Value::String("server".to_string()),
                Value::String(server_url.to_string()),
            );
            rewritten += 1;
        }
    }

    if rewritten == 0 {
        return Err(Error::serialization_for_kind(
            "kubeconfig",
            "no cluster entries to rewrite",
        ));
    }

    serde_yaml::to_string(&doc).map_err(|e| Error::serialization_for_kind("kubeconfig", e.to_string()))
}

/// The `server` of the first cluster entry
pub fn server_of(kubeconfig: &str) -> Result<String> {
    let doc: Value = serde_yaml::from_str(kubeconfig)
        .map_err(|e| Error::serialization_for_kind("kubeconfig", e.to_string()))?;
    doc.get("clusters")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("cluster"))
        .and_then(|c| c.get("server"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| Error::serialization_for_kind("kubeconfig", "no cluster server"))
}
