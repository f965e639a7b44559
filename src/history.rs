//! Append-only CSV schedule history, one row per cycle (plus consolidator
//! passes), header written once on first append.
//!
//! Grounded on `scheduler.py::_dump_history`/`_energy_parts`.

use std::path::Path;

use serde::Serialize;
use thiserror::Error;

use crate::model::{Plan, MASTER_NODE_NAME};
use crate::sa::{energy, SaConfig};

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("failed to open history file {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write history row: {0}")]
    Write(#[from] csv::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleMode {
    Incremental,
    Full,
    Consolidate,
}

impl CycleMode {
    fn as_str(&self) -> &'static str {
        match self {
            CycleMode::Incremental => "incremental",
            CycleMode::Full => "full",
            CycleMode::Consolidate => "consolidate",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct HistoryRow {
    ts: String,
    cycle_id: u64,
    mode: String,
    energy: String,
    cost: String,
    idle_ratio: String,
    conc: String,
    node_cnt: usize,
    nodes: String,
    nodes_pods: String,
}

/// The four energy-adjacent metrics dumped alongside the scalar energy
/// value, mirroring `_energy_parts`'s `(E, cost, idle, conc)` tuple.
pub struct EnergyParts {
    pub energy: f64,
    pub cost: f64,
    pub idle: f64,
    pub conc: f64,
}

pub fn energy_parts(plan: &Plan, cfg: &SaConfig) -> EnergyParts {
    let cost: f64 = plan.nodes().filter(|n| n.name != MASTER_NODE_NAME).map(|n| n.price).sum();
    let idle: f64 = plan
        .nodes()
        .filter(|n| n.name != MASTER_NODE_NAME && n.usable_cpu_cap() > 0.0)
        .map(|n| (n.usable_cpu_cap() - n.cpu_used) / n.usable_cpu_cap())
        .sum();

    let mut reg_hist: std::collections::HashMap<&str, usize> = std::collections::HashMap::new();
    for n in plan.nodes().filter(|n| n.name != MASTER_NODE_NAME) {
        *reg_hist.entry(n.region.as_str()).or_insert(0) += 1;
    }
    let total = plan.nodes().filter(|n| n.name != MASTER_NODE_NAME).count();
    let conc = if total > 0 {
        reg_hist.values().map(|c| (*c as f64 / total as f64).powi(2)).sum()
    } else {
        1.0
    };

    EnergyParts {
        energy: energy(plan, cfg),
        cost,
        idle,
        conc,
    }
}

/// Append one history row for `plan`, writing a header first if the file
/// doesn't exist yet. `timestamp` is passed in (RFC3339) rather than
/// sampled internally, keeping this function pure and testable.
pub fn append_row(
    path: &Path,
    cycle_id: u64,
    mode: CycleMode,
    plan: &Plan,
    cfg: &SaConfig,
    timestamp: &str,
) -> Result<(), HistoryError> {
    let write_header = !path.exists();
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| HistoryError::Open {
            path: path.display().to_string(),
            source: e,
        })?;
    let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(file);

    if write_header {
        writer.write_record([
            "ts",
            "cycle_id",
            "mode",
            "energy",
            "cost",
            "idle_ratio",
            "conc",
            "node_cnt",
            "nodes",
            "nodes_pods",
        ])?;
    }

    let parts = energy_parts(plan, cfg);
    let workers: Vec<_> = plan.nodes().filter(|n| n.name != MASTER_NODE_NAME).collect();
    let nodes_desc = workers
        .iter()
        .map(|n| format!("{}|{}|{}|{}", n.region, n.machine_type, n.price, n.name))
        .collect::<Vec<_>>()
        .join(";");
    let nodes_pods = workers
        .iter()
        .map(|n| {
            let pods = n.pod_names().join("|");
            format!("{}:[{}]", n.name, pods)
        })
        .collect::<Vec<_>>()
        .join(";");

    let row = HistoryRow {
        ts: timestamp.to_string(),
        cycle_id,
        mode: mode.as_str().to_string(),
        energy: format!("{:.4}", parts.energy),
        cost: format!("{:.4}", parts.cost),
        idle_ratio: format!("{:.4}", parts.idle),
        conc: format!("{:.4}", parts.conc),
        node_cnt: workers.len(),
        nodes: nodes_desc,
        nodes_pods,
    };
    writer.serialize(row)?;
    writer.flush().map_err(|e| HistoryError::Open {
        path: path.display().to_string(),
        source: e,
    })?;
    Ok(())
}
