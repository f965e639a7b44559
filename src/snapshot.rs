//! Turns raw cluster observations into a [`Plan`], and persists the
//! node-name -> (machine_type, region) mapping Kubernetes itself doesn't
//! track.
//!
//! Grounded on `cluster_state.py` (`snapshot_cluster`, `_parse_cpu`,
//! `_parse_mem`, `_load_node_info`/`_save_node_info`). The algorithm
//! modules depend only on [`Plan`], never on a live cluster client —
//! matching the original's comment that "算法模块只依赖 ResourceModel".

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{Node, Plan, Pod};

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("failed to read node-info file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write node-info file {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse node-info file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid cpu quantity: {0}")]
    BadCpuQuantity(String),
    #[error("invalid memory quantity: {0}")]
    BadMemQuantity(String),
}

/// Persisted `{node_name: {machine_type, region}}` sidecar. Kubernetes
/// doesn't record which catalog entry a node was created from, so the
/// scheduler keeps its own record across restarts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeInfoStore(BTreeMap<String, NodeInfoEntry>);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfoEntry {
    pub machine_type: String,
    pub region: String,
    pub price: f64,
}

impl NodeInfoStore {
    pub fn load(path: &Path) -> Result<Self, SnapshotError> {
        if !path.exists() {
            return Ok(NodeInfoStore::default());
        }
        let text = std::fs::read_to_string(path).map_err(|e| SnapshotError::Read {
            path: path.display().to_string(),
            source: e,
        })?;
        serde_json::from_str(&text).map_err(|e| SnapshotError::Parse {
            path: path.display().to_string(),
            source: e,
        })
    }

    pub fn save(&self, path: &Path) -> Result<(), SnapshotError> {
        let text = serde_json::to_string_pretty(self).expect("NodeInfoStore is always serializable");
        std::fs::write(path, text).map_err(|e| SnapshotError::Write {
            path: path.display().to_string(),
            source: e,
        })
    }

    pub fn get(&self, node_name: &str) -> Option<&NodeInfoEntry> {
        self.0.get(node_name)
    }

    pub fn insert(&mut self, node_name: impl Into<String>, entry: NodeInfoEntry) {
        self.0.insert(node_name.into(), entry);
    }

    pub fn remove(&mut self, node_name: &str) {
        self.0.remove(node_name);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &NodeInfoEntry)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }
}

/// Parse a Kubernetes CPU quantity (`"250m"` or `"2"`) into cores.
pub fn parse_cpu(raw: &str) -> Result<f64, SnapshotError> {
    if let Some(milli) = raw.strip_suffix('m') {
        milli
            .parse::<f64>()
            .map(|m| m / 1000.0)
            .map_err(|_| SnapshotError::BadCpuQuantity(raw.to_string()))
    } else {
        raw.parse::<f64>()
            .map_err(|_| SnapshotError::BadCpuQuantity(raw.to_string()))
    }
}

/// Parse a Kubernetes memory quantity (`"4Gi"`/`"512Mi"`/`"1024Ki"`) into GiB.
pub fn parse_mem(raw: &str) -> Result<f64, SnapshotError> {
    if let Some(gi) = raw.strip_suffix("Gi") {
        gi.parse::<f64>()
            .map_err(|_| SnapshotError::BadMemQuantity(raw.to_string()))
    } else if let Some(mi) = raw.strip_suffix("Mi") {
        mi.parse::<f64>()
            .map(|v| v / 1024.0)
            .map_err(|_| SnapshotError::BadMemQuantity(raw.to_string()))
    } else if let Some(ki) = raw.strip_suffix("Ki") {
        ki.parse::<f64>()
            .map(|v| v / (1024.0 * 1024.0))
            .map_err(|_| SnapshotError::BadMemQuantity(raw.to_string()))
    } else {
        raw.parse::<f64>()
            .map_err(|_| SnapshotError::BadMemQuantity(raw.to_string()))
    }
}

/// A node as reported live by the API server, before it's matched against
/// [`NodeInfoStore`].
#[derive(Debug, Clone)]
pub struct RawNode {
    pub name: String,
    pub ready: bool,
    pub allocatable_cpu: String,
    pub allocatable_mem: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawPodPhase {
    Running,
    Pending,
    Other,
}

/// Per-container resource requests/limits, already as raw quantity strings.
#[derive(Debug, Clone, Default)]
pub struct RawContainerResources {
    pub request_cpu: Option<String>,
    pub limit_cpu: Option<String>,
    pub request_mem: Option<String>,
    pub limit_mem: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RawPod {
    pub namespace: String,
    pub name: String,
    pub phase: RawPodPhase,
    pub node_name: Option<String>,
    pub labels: BTreeMap<String, String>,
    pub containers: Vec<RawContainerResources>,
}

impl RawPod {
    /// Per-dimension demand: the sum over containers of
    /// `max(request, limit)`, matching the original's overflow-safe
    /// accumulation (defaults to zero when a quantity is absent).
    fn demand(&self) -> Result<(f64, f64), SnapshotError> {
        let mut cpu = 0.0;
        let mut mem = 0.0;
        for c in &self.containers {
            let req_cpu = c
                .request_cpu
                .as_deref()
                .map(parse_cpu)
                .transpose()?
                .unwrap_or(0.0);
            let lim_cpu = c
                .limit_cpu
                .as_deref()
                .map(parse_cpu)
                .transpose()?
                .unwrap_or(0.0);
            cpu += req_cpu.max(lim_cpu);

            let req_mem = c
                .request_mem
                .as_deref()
                .map(parse_mem)
                .transpose()?
                .unwrap_or(0.0);
            let lim_mem = c
                .limit_mem
                .as_deref()
                .map(parse_mem)
                .transpose()?
                .unwrap_or(0.0);
            mem += req_mem.max(lim_mem);
        }
        Ok((cpu, mem))
    }
}

/// Build a [`Plan`] from a live cluster observation plus the persisted
/// node-info sidecar. Nodes with no `node_info` entry are skipped rather
/// than guessed at. Running pods are attached overflow-tolerantly; Pending
/// pods are returned unattached (as `is_new` pods) for the placer to act on.
pub fn build_plan(
    raw_nodes: &[RawNode],
    raw_pods: &[RawPod],
    node_info: &NodeInfoStore,
) -> Result<(Plan, Vec<Pod>), SnapshotError> {
    let mut plan = Plan::new();

    for n in raw_nodes {
        if !n.ready {
            continue;
        }
        let Some(info) = node_info.get(&n.name) else {
            continue;
        };
        let cpu_cap = parse_cpu(&n.allocatable_cpu)?;
        let mem_cap = parse_mem(&n.allocatable_mem)?;
        plan.open_node(Node::new(
            n.name.clone(),
            info.region.clone(),
            info.machine_type.clone(),
            cpu_cap,
            mem_cap,
            info.price,
            true,
        ));
    }

    let mut pending = Vec::new();
    for p in raw_pods {
        match p.phase {
            RawPodPhase::Running => {
                let Some(node_name) = &p.node_name else { continue };
                if plan.node(node_name).is_none() {
                    continue;
                }
                let (cpu, mem) = p.demand()?;
                let mut pod = Pod::new(p.namespace.clone(), p.name.clone(), cpu, mem);
                pod.labels = p.labels.clone();
                pod.is_new = false;
                // Overflow-tolerant: a running pod already on the node is
                // modeled even if bookkeeping makes it look oversized.
                plan.add_pod_overflow_tolerant(node_name, pod)
                    .expect("node just verified present");
            }
            RawPodPhase::Pending => {
                let (cpu, mem) = p.demand()?;
                let mut pod = Pod::new(p.namespace.clone(), p.name.clone(), cpu, mem);
                pod.labels = p.labels.clone();
                pod.is_new = true;
                pending.push(pod);
            }
            RawPodPhase::Other => {}
        }
    }

    Ok((plan, pending))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_millicore_and_whole_cpu() {
        assert_eq!(parse_cpu("250m").unwrap(), 0.25);
        assert_eq!(parse_cpu("2").unwrap(), 2.0);
    }

    #[test]
    fn parses_memory_units() {
        assert_eq!(parse_mem("4Gi").unwrap(), 4.0);
        assert_eq!(parse_mem("512Mi").unwrap(), 0.5);
        assert_eq!(parse_mem("1048576Ki").unwrap(), 1.0);
    }

    fn container(cpu: &str, mem: &str) -> RawContainerResources {
        RawContainerResources {
            request_cpu: Some(cpu.to_string()),
            limit_cpu: None,
            request_mem: Some(mem.to_string()),
            limit_mem: None,
        }
    }

    #[test]
    fn running_pods_attach_and_pending_pods_stay_unbound() {
        let raw_nodes = vec![RawNode {
            name: "worker-1".to_string(),
            ready: true,
            allocatable_cpu: "4".to_string(),
            allocatable_mem: "16Gi".to_string(),
        }];
        let mut info = NodeInfoStore::default();
        info.insert(
            "worker-1",
            NodeInfoEntry {
                machine_type: "e2-standard-4".to_string(),
                region: "us-east1".to_string(),
                price: 0.134,
            },
        );

        let raw_pods = vec![
            RawPod {
                namespace: "default".to_string(),
                name: "running-a".to_string(),
                phase: RawPodPhase::Running,
                node_name: Some("worker-1".to_string()),
                labels: BTreeMap::new(),
                containers: vec![container("500m", "1Gi")],
            },
            RawPod {
                namespace: "default".to_string(),
                name: "pending-b".to_string(),
                phase: RawPodPhase::Pending,
                node_name: None,
                labels: BTreeMap::new(),
                containers: vec![container("1", "2Gi")],
            },
        ];

        let (plan, pending) = build_plan(&raw_nodes, &raw_pods, &info).unwrap();
        assert_eq!(plan.node("worker-1").unwrap().cpu_used, 0.5);
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].name, "pending-b");
    }

    #[test]
    fn node_without_sidecar_entry_is_skipped() {
        let raw_nodes = vec![RawNode {
            name: "mystery".to_string(),
            ready: true,
            allocatable_cpu: "4".to_string(),
            allocatable_mem: "16Gi".to_string(),
        }];
        let (plan, _) = build_plan(&raw_nodes, &[], &NodeInfoStore::default()).unwrap();
        assert!(plan.node("mystery").is_none());
    }

    #[test]
    fn not_ready_node_is_skipped() {
        let raw_nodes = vec![RawNode {
            name: "worker-1".to_string(),
            ready: false,
            allocatable_cpu: "4".to_string(),
            allocatable_mem: "16Gi".to_string(),
        }];
        let mut info = NodeInfoStore::default();
        info.insert(
            "worker-1",
            NodeInfoEntry {
                machine_type: "e2-standard-4".to_string(),
                region: "us-east1".to_string(),
                price: 0.134,
            },
        );
        let (plan, _) = build_plan(&raw_nodes, &[], &info).unwrap();
        assert!(plan.node("worker-1").is_none());
    }
}
