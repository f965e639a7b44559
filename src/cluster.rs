//! Live-cluster collaborator: the thin layer between the scheduler's pure
//! algorithms and the Kubernetes API.
//!
//! Grounded on `original_source/system/schedule/ClusterMonitor.py` in full
//! (cordon/drain/bind/wait-ready/node-cpu-util) and on the teacher's
//! `controller::get_unschedulable_pods` for the `kube::Api` call idiom.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{Context, Result};
use k8s_openapi::api::core::v1::{Node as K8sNode, Pod as K8sPod};
use kube::api::{Api, DeleteParams, ListParams, ObjectMeta, Patch, PatchParams};
use kube::core::{DynamicObject, GroupVersionKind};
use kube::{Client, ResourceExt};
use tracing::{debug, info, warn};

use crate::node_request::{create_node_request, NodeRequestSpec};
use crate::snapshot::{RawContainerResources, RawNode, RawPod, RawPodPhase};

/// Name the original pending-pod fetch filters on: only pods explicitly
/// assigned to this scheduler are candidates for placement.
pub const SCHEDULER_NAME: &str = "custom-scheduling";

#[async_trait::async_trait]
pub trait ClusterDriver: Send + Sync {
    async fn list_nodes(&self) -> Result<Vec<RawNode>>;
    async fn list_pods(&self) -> Result<Vec<RawPod>>;
    /// Pods pending, unbound, in the default namespace, targeting this
    /// scheduler — the exact filter `_fetch_pending_list` applies.
    async fn list_pending_for_scheduler(&self) -> Result<Vec<RawPod>>;
    async fn cordon_node(&self, node_name: &str) -> Result<()>;
    async fn drain_node(&self, node_name: &str) -> Result<()>;
    async fn bind_pod(&self, namespace: &str, name: &str, node_name: &str) -> Result<()>;
    async fn wait_node_ready(&self, node_name: &str, timeout: Duration) -> Result<bool>;
    async fn node_cpu_util(&self, node_name: &str) -> Result<Option<f64>>;
    async fn delete_node_object(&self, node_name: &str) -> Result<()>;

    /// Record a `NodeRequest` audit object for a node the apply step just
    /// created, for `kubectl get noderequests` observability. Purely
    /// best-effort bookkeeping, not the placement mechanism itself — a
    /// no-op by default so test doubles don't need to implement it.
    async fn record_node_request(&self, _node_name: &str, _machine_type: &str) -> Result<()> {
        Ok(())
    }
}

pub struct KubeClusterDriver {
    client: Client,
}

impl KubeClusterDriver {
    pub fn new(client: Client) -> Self {
        KubeClusterDriver { client }
    }

    fn container_resources(containers: &[k8s_openapi::api::core::v1::Container]) -> Vec<RawContainerResources> {
        containers
            .iter()
            .map(|c| {
                let (requests, limits) = c
                    .resources
                    .as_ref()
                    .map(|r| (r.requests.clone(), r.limits.clone()))
                    .unwrap_or((None, None));
                let get = |m: &Option<BTreeMap<String, k8s_openapi::apimachinery::pkg::api::resource::Quantity>>,
                           key: &str| m.as_ref().and_then(|m| m.get(key)).map(|q| q.0.clone());
                RawContainerResources {
                    request_cpu: get(&requests, "cpu"),
                    limit_cpu: get(&limits, "cpu"),
                    request_mem: get(&requests, "memory"),
                    limit_mem: get(&limits, "memory"),
                }
            })
            .collect()
    }
}

#[async_trait::async_trait]
impl ClusterDriver for KubeClusterDriver {
    async fn list_nodes(&self) -> Result<Vec<RawNode>> {
        let api: Api<K8sNode> = Api::all(self.client.clone());
        let nodes = api.list(&ListParams::default()).await?;
        Ok(nodes
            .into_iter()
            .map(|n| {
                let ready = n
                    .status
                    .as_ref()
                    .and_then(|s| s.conditions.as_ref())
                    .map(|conds| conds.iter().any(|c| c.type_ == "Ready" && c.status == "True"))
                    .unwrap_or(false);
                let allocatable = n.status.as_ref().and_then(|s| s.allocatable.clone()).unwrap_or_default();
                let cpu = allocatable.get("cpu").map(|q| q.0.clone()).unwrap_or_else(|| "0".to_string());
                let mem = allocatable
                    .get("memory")
                    .map(|q| q.0.clone())
                    .unwrap_or_else(|| "0Ki".to_string());
                RawNode {
                    name: n.name_any(),
                    ready,
                    allocatable_cpu: cpu,
                    allocatable_mem: mem,
                }
            })
            .collect())
    }

    async fn list_pods(&self) -> Result<Vec<RawPod>> {
        let api: Api<K8sPod> = Api::all(self.client.clone());
        let pods = api.list(&ListParams::default()).await?;
        Ok(pods.into_iter().filter_map(to_raw_pod).collect())
    }

    async fn list_pending_for_scheduler(&self) -> Result<Vec<RawPod>> {
        let api: Api<K8sPod> = Api::namespaced(self.client.clone(), "default");
        let lp = ListParams::default().fields("status.phase=Pending");
        let pods = api.list(&lp).await?;
        Ok(pods
            .into_iter()
            .filter(|p| {
                let spec = match &p.spec {
                    Some(s) => s,
                    None => return false,
                };
                let right_scheduler = spec.scheduler_name.as_deref() == Some(SCHEDULER_NAME);
                let unbound = spec.node_name.is_none();
                right_scheduler && unbound
            })
            .filter_map(to_raw_pod)
            .collect())
    }

    async fn cordon_node(&self, node_name: &str) -> Result<()> {
        let api: Api<K8sNode> = Api::all(self.client.clone());
        let patch = serde_json::json!({"spec": {"unschedulable": true}});
        api.patch(node_name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .with_context(|| format!("cordon node {node_name}"))?;
        info!(node = node_name, "cordoned node");
        Ok(())
    }

    async fn drain_node(&self, node_name: &str) -> Result<()> {
        self.cordon_node(node_name).await?;
        let api: Api<K8sPod> = Api::all(self.client.clone());
        let lp = ListParams::default().fields(&format!("spec.nodeName={node_name}"));
        let pods = api.list(&lp).await?;
        if pods.items.is_empty() {
            debug!(node = node_name, "no pods to evict");
            return Ok(());
        }
        for pod in pods {
            let name = pod.name_any();
            let ns = pod.namespace().unwrap_or_else(|| "default".to_string());
            let ns_api: Api<K8sPod> = Api::namespaced(self.client.clone(), &ns);
            if let Err(e) = ns_api.delete(&name, &DeleteParams::default()).await {
                warn!(pod = %name, error = %e, "failed to evict pod during drain");
            }
        }
        info!(node = node_name, "drain attempted for all pods");
        Ok(())
    }

    async fn bind_pod(&self, namespace: &str, name: &str, node_name: &str) -> Result<()> {
        let binding = serde_json::json!({
            "apiVersion": "v1",
            "kind": "Binding",
            "metadata": { "name": name, "namespace": namespace },
            "target": { "apiVersion": "v1", "kind": "Node", "name": node_name }
        });
        let api: Api<K8sPod> = Api::namespaced(self.client.clone(), namespace);
        api.patch_subresource("binding", name, &PatchParams::default(), &Patch::Apply(&binding))
            .await
            .with_context(|| format!("bind pod {namespace}/{name} to node {node_name}"))?;
        info!(pod = name, node = node_name, "bound pending pod");
        Ok(())
    }

    async fn wait_node_ready(&self, node_name: &str, timeout: Duration) -> Result<bool> {
        let api: Api<K8sNode> = Api::all(self.client.clone());
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if let Ok(node) = api.get(node_name).await {
                let ready = node
                    .status
                    .as_ref()
                    .and_then(|s| s.conditions.as_ref())
                    .map(|conds| conds.iter().any(|c| c.type_ == "Ready" && c.status == "True"))
                    .unwrap_or(false);
                if ready {
                    return Ok(true);
                }
            }
            tokio::time::sleep(Duration::from_secs(5)).await;
        }
        Ok(false)
    }

    async fn node_cpu_util(&self, node_name: &str) -> Result<Option<f64>> {
        let gvk = GroupVersionKind::gvk("metrics.k8s.io", "v1beta1", "NodeMetrics");
        let ar = kube::core::ApiResource::from_gvk(&gvk);
        let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &ar);
        let metrics = match api.get(node_name).await {
            Ok(m) => m,
            Err(kube::Error::Api(e)) if e.code == 404 => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let usage_nano: f64 = metrics
            .data
            .get("usage")
            .and_then(|u| u.get("cpu"))
            .and_then(|v| v.as_str())
            .and_then(|s| s.strip_suffix('n'))
            .and_then(|s| s.parse::<f64>().ok())
            .unwrap_or(0.0);

        let node_api: Api<K8sNode> = Api::all(self.client.clone());
        let node = node_api.get(node_name).await?;
        let cap_core: f64 = node
            .status
            .and_then(|s| s.capacity)
            .and_then(|c| c.get("cpu").map(|q| q.0.clone()))
            .and_then(|s| s.parse::<f64>().ok())
            .unwrap_or(0.0);

        if cap_core <= 0.0 {
            return Ok(None);
        }
        Ok(Some((usage_nano / 1e9) / cap_core))
    }

    async fn delete_node_object(&self, node_name: &str) -> Result<()> {
        let api: Api<K8sNode> = Api::all(self.client.clone());
        api.delete(node_name, &DeleteParams::default()).await?;
        Ok(())
    }

    async fn record_node_request(&self, node_name: &str, machine_type: &str) -> Result<()> {
        create_node_request(
            self.client.clone(),
            node_name,
            NodeRequestSpec {
                target_offering: machine_type.to_string(),
            },
        )
        .await
        .with_context(|| format!("record NodeRequest for {node_name}"))?;
        Ok(())
    }
}

fn to_raw_pod(p: K8sPod) -> Option<RawPod> {
    let namespace = p.namespace().unwrap_or_else(|| "default".to_string());
    let name = p.name_any();
    let labels = p.labels().clone().into_iter().collect::<BTreeMap<_, _>>();
    let phase = match p.status.as_ref().and_then(|s| s.phase.as_deref()) {
        Some("Running") => RawPodPhase::Running,
        Some("Pending") => RawPodPhase::Pending,
        _ => RawPodPhase::Other,
    };
    let spec = p.spec?;
    let node_name = spec.node_name.clone();
    let containers = KubeClusterDriver::container_resources(&spec.containers);
    Some(RawPod {
        namespace,
        name,
        phase,
        node_name,
        labels,
        containers,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{PodSpec, PodStatus};

    #[test]
    fn to_raw_pod_reads_phase_and_node_name() {
        let mut pod = K8sPod {
            metadata: ObjectMeta {
                name: Some("a".to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            spec: Some(PodSpec {
                node_name: Some("worker-1".to_string()),
                ..Default::default()
            }),
            status: Some(PodStatus {
                phase: Some("Running".to_string()),
                ..Default::default()
            }),
        };
        let raw = to_raw_pod(pod.clone()).unwrap();
        assert_eq!(raw.phase, RawPodPhase::Running);
        assert_eq!(raw.node_name.as_deref(), Some("worker-1"));

        pod.spec = None;
        assert!(to_raw_pod(pod).is_none());
    }
}
