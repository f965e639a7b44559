//! Diffs the chosen `Plan` against cluster reality and makes it so: deletes
//! closed nodes, creates opened ones (with same-price region fallback),
//! waits for new nodes to join, rebinds pods whose target changed, and
//! persists `node_info.json`.
//!
//! Grounded on `scheduler.py::_apply_plan`/`_try_create_with_fallback`.

use std::collections::BTreeSet;
use std::time::Duration;

use futures_util::stream::{self, StreamExt};
use tracing::{error, info, warn};

use crate::catalog::Catalog;
use crate::cluster::ClusterDriver;
use crate::model::{Node, Plan, MASTER_NODE_NAME};
use crate::providers::provider::{InstanceConfig, Provider};
use crate::snapshot::NodeInfoStore;

/// Bound on concurrent create/delete operations, matching
/// `ThreadPoolExecutor(max_workers=2)` in `_apply_plan`.
const APPLY_CONCURRENCY: usize = 2;
const WAIT_READY_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Default)]
pub struct ApplyReport {
    pub created: Vec<String>,
    pub deleted: Vec<String>,
    pub create_failures: Vec<(String, String)>,
    pub delete_failures: Vec<(String, String)>,
    pub not_ready: Vec<String>,
    pub bound_pods: Vec<String>,
}

/// Apply the diff between `old` (the last-known cluster state) and `new`
/// (the chosen plan for this cycle), mutating cluster/provider state and
/// `node_info`.
pub async fn apply_plan(
    old: &Plan,
    new: &Plan,
    cluster: &dyn ClusterDriver,
    provider: &Provider,
    catalog: &Catalog,
    node_info: &mut NodeInfoStore,
) -> ApplyReport {
    let mut report = ApplyReport::default();

    let old_names: BTreeSet<_> = old.node_names().map(String::from).collect();
    let new_names: BTreeSet<_> = new.node_names().map(String::from).collect();
    let pending_delete: Vec<String> = old_names.difference(&new_names).cloned().collect();
    let pending_create: Vec<String> = new_names.difference(&old_names).cloned().collect();

    let delete_results: Vec<(String, Result<(), String>)> = stream::iter(pending_delete.iter().cloned())
        .map(|name| async move {
            let result = delete_one(&name, cluster, provider).await;
            (name, result)
        })
        .buffer_unordered(APPLY_CONCURRENCY)
        .collect()
        .await;
    for (name, result) in delete_results {
        match result {
            Ok(()) => {
                info!(node = %name, "deleted node");
                node_info.remove(&name);
                report.deleted.push(name);
            }
            Err(msg) => {
                error!(node = %name, error = %msg, "delete node failed");
                report.delete_failures.push((name, msg));
            }
        }
    }

    let create_results: Vec<(String, Result<Node, String>)> = stream::iter(pending_create.iter().cloned())
        .map(|name| async move {
            let node = new.node(&name).cloned();
            let result = match node {
                Some(nd) => try_create_with_fallback(&name, &nd, provider, catalog).await,
                None => Err("node missing from plan".to_string()),
            };
            (name, result)
        })
        .buffer_unordered(APPLY_CONCURRENCY)
        .collect()
        .await;

    let mut created_nodes: Vec<Node> = Vec::new();
    for (name, result) in create_results {
        match result {
            Ok(actual) => {
                node_info.insert(
                    actual.name.clone(),
                    crate::snapshot::NodeInfoEntry {
                        machine_type: actual.machine_type.clone(),
                        region: actual.region.clone(),
                        price: actual.price,
                    },
                );
                report.created.push(actual.name.clone());
                if let Err(e) = cluster.record_node_request(&actual.name, &actual.machine_type).await {
                    warn!(node = %actual.name, error = %e, "failed to record NodeRequest audit object");
                }
                created_nodes.push(actual);
            }
            Err(msg) => {
                error!(node = %name, error = %msg, "create node failed");
                report.create_failures.push((name, msg));
            }
        }
    }

    for nd in &created_nodes {
        match cluster.wait_node_ready(&nd.name, WAIT_READY_TIMEOUT).await {
            Ok(true) => info!(node = %nd.name, "node ready"),
            Ok(false) => {
                warn!(node = %nd.name, "node not ready within timeout");
                report.not_ready.push(nd.name.clone());
            }
            Err(e) => {
                warn!(node = %nd.name, error = %e, "error waiting for node readiness");
                report.not_ready.push(nd.name.clone());
            }
        }
    }

    for (full_name, target_node) in new.pods().map(|p| (p.full_name(), new.node_of(&p.full_name()))) {
        let target_node = match target_node {
            Some(t) => t,
            None => continue,
        };
        if old.node_of(&full_name).as_deref() == Some(target_node) {
            continue;
        }
        let (ns, name) = split_full_name(&full_name);
        match cluster.bind_pod(ns, name, target_node).await {
            Ok(()) => {
                info!(pod = %full_name, node = target_node, "bound pending pod");
                report.bound_pods.push(full_name.clone());
            }
            Err(e) => {
                warn!(pod = %full_name, error = %e, "bind failed (pod may have been deleted)");
            }
        }
    }

    info!(created = report.created.len(), deleted = report.deleted.len(), "apply diff done");
    report
}

async fn delete_one(name: &str, cluster: &dyn ClusterDriver, provider: &Provider) -> Result<(), String> {
    if name == MASTER_NODE_NAME {
        return Err("refusing to delete master".to_string());
    }
    if let Err(e) = cluster.drain_node(name).await {
        warn!(node = name, error = %e, "drain before delete failed, continuing");
    }
    if let Err(e) = cluster.delete_node_object(name).await {
        warn!(node = name, error = %e, "failed to delete Node object");
    }
    provider.delete(name).await.map_err(|e| e.to_string())
}

/// Create `name` per `nd`'s region/machine type; on a fallback-eligible
/// failure, retry in any other region offering the exact same price for
/// the same machine type (within `1e-6`), mirroring
/// `_try_create_with_fallback`. Returns the node actually created — its
/// name/region may differ from `nd`'s if fallback fired.
async fn try_create_with_fallback(
    name: &str,
    nd: &Node,
    provider: &Provider,
    catalog: &Catalog,
) -> Result<Node, String> {
    let cfg = InstanceConfig::new(nd.region.clone(), nd.machine_type.clone());
    match provider.create(name, &cfg).await {
        Ok(_) => return Ok(nd.clone()),
        Err(e) if !e.is_fallback_eligible() => return Err(e.to_string()),
        Err(e) => {
            warn!(node = name, region = %nd.region, error = %e, "region unavailable, searching fallback");
        }
    }

    let candidates: Vec<&str> = catalog
        .regions()
        .filter(|r| *r != nd.region)
        .filter(|r| {
            catalog
                .price(r, &nd.machine_type)
                .map(|p| (p - nd.price).abs() < 1e-6)
                .unwrap_or(false)
        })
        .collect();

    if candidates.is_empty() {
        return Err("no region with same price for fallback".to_string());
    }

    for region in candidates {
        let cfg = InstanceConfig::new(region.to_string(), nd.machine_type.clone());
        match provider.create(name, &cfg).await {
            Ok(_) => {
                info!(node = name, region, "fallback create succeeded");
                let mut actual = nd.clone();
                actual.region = region.to_string();
                return Ok(actual);
            }
            Err(e) => warn!(node = name, region, error = %e, "fallback region failed"),
        }
    }

    Err(format!("all fallback regions exhausted for {name}"))
}

/// Splits a `namespace/name` or bare `name` full-name, matching the
/// original's `"/" in full` check in `_apply_plan`'s rebind loop.
fn split_full_name(full: &str) -> (&str, &str) {
    match full.split_once('/') {
        Some((ns, name)) => (ns, name),
        None => ("default", full),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::ClusterDriver;
    use crate::model::Pod;
    use crate::snapshot::{RawNode, RawPod};
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeCluster {
        bound: Mutex<Vec<(String, String, String)>>,
        drained: Mutex<Vec<String>>,
        deleted_objects: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ClusterDriver for FakeCluster {
        async fn list_nodes(&self) -> anyhow::Result<Vec<RawNode>> {
            Ok(vec![])
        }
        async fn list_pods(&self) -> anyhow::Result<Vec<RawPod>> {
            Ok(vec![])
        }
        async fn list_pending_for_scheduler(&self) -> anyhow::Result<Vec<RawPod>> {
            Ok(vec![])
        }
        async fn cordon_node(&self, _node_name: &str) -> anyhow::Result<()> {
            Ok(())
        }
        async fn drain_node(&self, node_name: &str) -> anyhow::Result<()> {
            self.drained.lock().unwrap().push(node_name.to_string());
            Ok(())
        }
        async fn bind_pod(&self, namespace: &str, name: &str, node_name: &str) -> anyhow::Result<()> {
            self.bound.lock().unwrap().push((namespace.to_string(), name.to_string(), node_name.to_string()));
            Ok(())
        }
        async fn wait_node_ready(&self, _node_name: &str, _timeout: Duration) -> anyhow::Result<bool> {
            Ok(true)
        }
        async fn node_cpu_util(&self, _node_name: &str) -> anyhow::Result<Option<f64>> {
            Ok(None)
        }
        async fn delete_node_object(&self, node_name: &str) -> anyhow::Result<()> {
            self.deleted_objects.lock().unwrap().push(node_name.to_string());
            Ok(())
        }
    }

    fn test_catalog() -> Catalog {
        let spec = serde_json::json!({
            "us-east1": [{"name": "e2-standard-4", "vcpus": 4, "mem_gib": 16.0}],
            "us-west1": [{"name": "e2-standard-4", "vcpus": 4, "mem_gib": 16.0}],
        });
        let price = serde_json::json!({
            "us-east1": { "OnDemand": { "e2-standard-4": 0.134 } },
            "us-west1": { "OnDemand": { "e2-standard-4": 0.134 } },
        });
        Catalog::from_json(&spec.to_string(), &price.to_string()).unwrap()
    }

    #[tokio::test]
    async fn creates_opened_nodes_and_deletes_closed_ones() {
        let mut old = Plan::new();
        old.open_node(Node::new("w-old", "us-east1", "e2-standard-4", 4.0, 16.0, 0.134, true));

        let mut new = Plan::new();
        new.open_node(Node::new("w-new", "us-east1", "e2-standard-4", 4.0, 16.0, 0.134, false));

        let cluster = FakeCluster::default();
        let provider = Provider::Fake(crate::providers::fake::FakeProvider::new());
        let catalog = test_catalog();
        let mut node_info = NodeInfoStore::default();

        let report = apply_plan(&old, &new, &cluster, &provider, &catalog, &mut node_info).await;
        assert_eq!(report.created, vec!["w-new".to_string()]);
        assert_eq!(report.deleted, vec!["w-old".to_string()]);
        assert!(node_info.get("w-new").is_some());
        assert!(node_info.get("w-old").is_none());
    }

    #[tokio::test]
    async fn fallback_creates_in_same_price_region_on_exhaustion() {
        let old = Plan::new();
        let mut new = Plan::new();
        new.open_node(Node::new("w-new", "us-east1", "e2-standard-4", 4.0, 16.0, 0.134, false));

        let cluster = FakeCluster::default();
        let provider = Provider::Fake(
            crate::providers::fake::FakeProvider::new()
                .on_next_create(crate::providers::fake::CreateBehavior::ZoneResourcePoolExhausted),
        );
        let catalog = test_catalog();
        let mut node_info = NodeInfoStore::default();

        let report = apply_plan(&old, &new, &cluster, &provider, &catalog, &mut node_info).await;
        assert_eq!(report.created, vec!["w-new".to_string()]);
        assert!(report.create_failures.is_empty());
    }

    #[tokio::test]
    async fn rebinds_pod_whose_target_node_changed() {
        let mut old = Plan::new();
        old.open_node(Node::new("w1", "us-east1", "e2-standard-4", 4.0, 16.0, 0.134, true));
        old.open_node(Node::new("w2", "us-east1", "e2-standard-4", 4.0, 16.0, 0.134, true));
        old.add_pod("w1", Pod::new("default", "a", 1.0, 1.0)).unwrap();

        let mut new = Plan::new();
        new.open_node(Node::new("w1", "us-east1", "e2-standard-4", 4.0, 16.0, 0.134, true));
        new.open_node(Node::new("w2", "us-east1", "e2-standard-4", 4.0, 16.0, 0.134, true));
        new.add_pod("w2", Pod::new("default", "a", 1.0, 1.0)).unwrap();

        let cluster = FakeCluster::default();
        let provider = Provider::Fake(crate::providers::fake::FakeProvider::new());
        let catalog = test_catalog();
        let mut node_info = NodeInfoStore::default();

        let report = apply_plan(&old, &new, &cluster, &provider, &catalog, &mut node_info).await;
        assert_eq!(report.bound_pods, vec!["default/a".to_string()]);
    }

    #[test]
    fn split_full_name_handles_bare_names() {
        assert_eq!(split_full_name("default/a"), ("default", "a"));
        assert_eq!(split_full_name("a"), ("default", "a"));
    }
}
