//! Background consolidator: periodically closes real nodes sitting well
//! below the idle-utilization threshold, independent of the main
//! scheduling cycle.
//!
//! Grounded on `scheduler.py::_consolidate_loop`/`_close_idle_node`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::stream::{self, StreamExt};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::cluster::ClusterDriver;
use crate::config::SchedulerConfig;
use crate::model::{Plan, MASTER_NODE_NAME, SPECIAL_NODE_NAME};
use crate::providers::provider::Provider;
use crate::snapshot::{build_plan, NodeInfoStore};

/// Bound on concurrent node closures, matching
/// `ThreadPoolExecutor(max_workers=2)` in `_consolidate_loop`.
const CONSOLIDATE_CONCURRENCY: usize = 2;

#[derive(Debug, Default)]
pub struct ConsolidateReport {
    pub closed: Vec<String>,
    pub failures: Vec<(String, String)>,
}

/// Background consolidator sharing the scheduler's `op_lock` and
/// `node_info.json` sidecar.
pub struct Consolidator {
    cfg: SchedulerConfig,
    cluster: Arc<dyn ClusterDriver>,
    provider: Provider,
    op_lock: Arc<Mutex<()>>,
    node_info_path: std::path::PathBuf,
    /// When the last node creation completed; consolidation is inhibited
    /// for `creation_block_sec` afterward so a just-opened node isn't
    /// immediately judged idle and closed, matching `_consolidate_loop`'s
    /// `last_creation_ts` gate.
    last_creation: Mutex<Option<Instant>>,
}

impl Consolidator {
    pub fn new(
        cfg: SchedulerConfig,
        cluster: Arc<dyn ClusterDriver>,
        provider: Provider,
        op_lock: Arc<Mutex<()>>,
    ) -> Self {
        let node_info_path = std::path::PathBuf::from(&cfg.node_info_path);
        Consolidator {
            cfg,
            cluster,
            provider,
            op_lock,
            node_info_path,
            last_creation: Mutex::new(None),
        }
    }

    /// Record that a node creation just happened, inhibiting consolidation
    /// for `creation_block_sec`. The scheduler calls this after every
    /// `apply_plan` that created at least one node.
    pub async fn note_creation(&self) {
        *self.last_creation.lock().await = Some(Instant::now());
    }

    pub async fn run_forever(&self) {
        let mut ticker = tokio::time::interval(Duration::from_secs(self.cfg.consolidate_sleep_sec));
        loop {
            ticker.tick().await;
            self.run_once().await;
        }
    }

    pub async fn run_once(&self) -> ConsolidateReport {
        if self.is_inhibited().await {
            debug!("consolidation inhibited, recent creation");
            return ConsolidateReport::default();
        }

        let _guard = self.op_lock.lock().await;

        let node_info = match NodeInfoStore::load(&self.node_info_path) {
            Ok(n) => n,
            Err(e) => {
                error!(error = %e, "failed to load node_info for consolidation");
                return ConsolidateReport::default();
            }
        };
        let raw_nodes = match self.cluster.list_nodes().await {
            Ok(n) => n,
            Err(e) => {
                error!(error = %e, "failed to list nodes for consolidation");
                return ConsolidateReport::default();
            }
        };
        let raw_pods = match self.cluster.list_pods().await {
            Ok(p) => p,
            Err(e) => {
                error!(error = %e, "failed to list pods for consolidation");
                return ConsolidateReport::default();
            }
        };
        let (plan, _pending) = match build_plan(&raw_nodes, &raw_pods, &node_info) {
            Ok(v) => v,
            Err(e) => {
                error!(error = %e, "failed to build plan for consolidation");
                return ConsolidateReport::default();
            }
        };

        let idle = self.find_idle_nodes(&plan).await;
        if idle.is_empty() {
            return ConsolidateReport::default();
        }
        info!(count = idle.len(), "closing idle nodes");

        let mut node_info = node_info;
        let results: Vec<(String, Result<(), String>)> = stream::iter(idle)
            .map(|name| async move {
                let result = self.close_idle_node(&name).await;
                (name, result)
            })
            .buffer_unordered(CONSOLIDATE_CONCURRENCY)
            .collect()
            .await;

        let mut report = ConsolidateReport::default();
        for (name, result) in results {
            match result {
                Ok(()) => {
                    node_info.remove(&name);
                    report.closed.push(name);
                }
                Err(msg) => report.failures.push((name, msg)),
            }
        }
        if let Err(e) = node_info.save(&self.node_info_path) {
            error!(error = %e, "failed to persist node_info.json after consolidation");
        }
        report
    }

    async fn is_inhibited(&self) -> bool {
        match *self.last_creation.lock().await {
            None => false,
            Some(t) => t.elapsed() < Duration::from_secs(self.cfg.creation_block_sec),
        }
    }

    /// Nodes whose real-time CPU utilization (via metrics.k8s.io) is below
    /// `consolidate_low_threshold`, excluding the master and the special
    /// utility node, matching `_consolidate_loop`'s candidate selection.
    async fn find_idle_nodes(&self, plan: &Plan) -> Vec<String> {
        let mut idle = Vec::new();
        for node in plan.nodes() {
            if node.name == MASTER_NODE_NAME || node.name == SPECIAL_NODE_NAME {
                continue;
            }
            match self.cluster.node_cpu_util(&node.name).await {
                Ok(Some(util)) if util <= self.cfg.consolidate_low_threshold => {
                    idle.push(node.name.clone());
                }
                Ok(_) => {}
                Err(e) => warn!(node = %node.name, error = %e, "failed to read node cpu util"),
            }
        }
        idle
    }

    /// Drain, delete the Node object, and destroy the backing VM — the
    /// same sequence `apply.rs::delete_one` uses for planned closures,
    /// mirroring `_close_idle_node`'s drain-then-destroy shape.
    async fn close_idle_node(&self, name: &str) -> Result<(), String> {
        if let Err(e) = self.cluster.drain_node(name).await {
            warn!(node = name, error = %e, "drain before consolidation-close failed, continuing");
        }
        if let Err(e) = self.cluster.delete_node_object(name).await {
            warn!(node = name, error = %e, "failed to delete Node object during consolidation");
        }
        self.provider.delete(name).await.map_err(|e| e.to_string())
    }
}
