//! RFSA: the deterministic greedy seed placer.
//!
//! Places pending pods onto existing nodes where possible, opening a new
//! node at minimum cost/suitability when nothing fits. Used both as the
//! entry point for incremental scheduling and as the seed for simulated
//! annealing.
//!
//! Grounded on `rfsa_optimizer.py` in full.

use crate::catalog::Catalog;
use crate::model::{Node, Plan, Pod, MASTER_NODE_NAME};

pub const MAX_WORKER_NODES: usize = 6;
pub const MAX_CLUSTER_CPU: f64 = 30.0;

const SUIT_THRESHOLD: f64 = 0.6;

/// Result of a placement attempt: the resulting plan plus whatever
/// couldn't be placed under the hard constraints.
pub struct PlacementResult {
    pub plan: Plan,
    pub still_pending: Vec<Pod>,
}

/// Place `pending` pods into `current`, preferring existing nodes and
/// opening new ones from `catalog` only when nothing fits.
///
/// Pods are placed in descending order of `cpu + mem` demand so the
/// hardest-to-place pods are handled first.
pub fn place(current: &Plan, mut pending: Vec<Pod>, catalog: &Catalog) -> PlacementResult {
    let mut plan = current.clone();
    let mut still_pending = Vec::new();

    pending.sort_by(|a, b| (b.cpu + b.mem).total_cmp(&(a.cpu + a.mem)));

    for pod in pending {
        if fit_existing(&mut plan, &pod) {
            continue;
        }
        if let Some(new_node) = open_new_node(&plan, &pod, catalog) {
            let node_name = new_node.name.clone();
            plan.open_node(new_node);
            plan.add_pod(&node_name, pod)
                .expect("node was just sized to fit this pod");
            continue;
        }
        still_pending.push(pod);
    }

    PlacementResult { plan, still_pending }
}

/// Try to fit `pod` onto the best existing node, scored by
/// `(cpu_ratio_after, suit)` ascending. Returns true and mutates `plan` on
/// success.
fn fit_existing(plan: &mut Plan, pod: &Pod) -> bool {
    let mut best: Option<(f64, f64, String)> = None;

    for nd in plan.nodes() {
        if nd.name == MASTER_NODE_NAME || !nd.can_fit(pod) {
            continue;
        }

        let cpu_left = nd.usable_cpu_cap() - nd.cpu_used;
        let mem_left = nd.mem_cap - nd.mem_used;

        let cpu_ratio = (cpu_left - pod.cpu) / nd.cpu_cap;
        let rho_pod = if pod.mem != 0.0 { pod.cpu / pod.mem } else { f64::INFINITY };
        let rho_node = if mem_left != 0.0 { cpu_left / mem_left } else { f64::INFINITY };
        let suit = (rho_pod - rho_node).abs() / (rho_node + 1e-6);

        let better = match &best {
            None => true,
            Some((b_ratio, b_suit, _)) => (cpu_ratio, suit) < (*b_ratio, *b_suit),
        };
        if better {
            best = Some((cpu_ratio, suit, nd.name.clone()));
        }
    }

    if let Some((_, _, node_name)) = best {
        plan.add_pod(&node_name, pod.clone())
            .expect("fit_existing only selects nodes that can_fit the pod");
        true
    } else {
        false
    }
}

struct Candidate {
    cpu_left: f64,
    suit: f64,
    price: f64,
    region: String,
    machine_type: String,
}

/// Enumerate the catalog for the minimum-cost, best-suited machine type
/// that fits `pod`, subject to the worker-count and cluster-CPU caps.
fn open_new_node(plan: &Plan, pod: &Pod, catalog: &Catalog) -> Option<Node> {
    use crate::model::DEFAULT_OVERHEAD_CPU;

    let worker_nodes: Vec<&Node> = plan.nodes().filter(|n| n.name != MASTER_NODE_NAME).collect();
    if worker_nodes.len() >= MAX_WORKER_NODES {
        return None;
    }
    let curr_cpu_cap: f64 = worker_nodes.iter().map(|n| n.cpu_cap).sum();

    let rho_pod = if pod.mem != 0.0 { pod.cpu / pod.mem } else { f64::INFINITY };

    let mut good: Vec<Candidate> = Vec::new();
    let mut other: Vec<Candidate> = Vec::new();

    for entry in catalog.entries() {
        let vcpu = entry.vcpus as f64;
        let mem = entry.mem_gib;
        if vcpu - DEFAULT_OVERHEAD_CPU < pod.cpu || mem < pod.mem {
            continue;
        }
        if curr_cpu_cap + vcpu > MAX_CLUSTER_CPU {
            continue;
        }
        if entry.price <= 0.0 {
            continue;
        }

        let rho_node = if mem != 0.0 { vcpu / mem } else { f64::INFINITY };
        let suit = (rho_pod - rho_node).abs() / (rho_node + 1e-6);
        let cpu_left = (vcpu - DEFAULT_OVERHEAD_CPU) - pod.cpu;

        let cand = Candidate {
            cpu_left,
            suit,
            price: entry.price,
            region: entry.region,
            machine_type: entry.machine_type,
        };
        if suit <= SUIT_THRESHOLD {
            good.push(cand);
        } else {
            other.push(cand);
        }
    }

    let mut candidates = if !good.is_empty() { good } else { other };
    if candidates.is_empty() {
        return None;
    }

    candidates.sort_by(|a, b| {
        let region_load = |region: &str| plan.nodes_by_region(region).count();
        (a.cpu_left, a.suit, a.price, region_load(&a.region))
            .partial_cmp(&(b.cpu_left, b.suit, b.price, region_load(&b.region)))
            .unwrap()
    });

    let chosen = &candidates[0];
    let spec = catalog.spec(&chosen.region, &chosen.machine_type)?;
    let suffix: u32 = rand::random::<u32>() % 90_000 + 10_000;
    let node_name = format!("rfsa-{}-{}-{}", chosen.region, chosen.machine_type, suffix);
    Some(Node::new(
        node_name,
        chosen.region.clone(),
        chosen.machine_type.clone(),
        spec.vcpus as f64,
        spec.mem_gib,
        chosen.price,
        false,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Node as ModelNode;

    fn catalog_with_one_option() -> Catalog {
        let spec_json = r#"{"us-east1": [{"name": "e2-standard-4", "vcpus": 4, "mem_gib": 16}]}"#;
        let price_json = r#"{"us-east1": {"OnDemand": {"e2-standard-4": 0.134}}}"#;
        Catalog::from_json(spec_json, price_json).unwrap()
    }

    #[test]
    fn prefers_existing_node_over_opening_new() {
        let mut plan = Plan::new();
        plan.open_node(ModelNode::new("worker-1", "us-east1", "e2-standard-4", 4.0, 16.0, 0.134, true));
        let catalog = catalog_with_one_option();

        let pod = Pod::new("default", "a", 1.0, 1.0);
        let result = place(&plan, vec![pod], &catalog);

        assert!(result.still_pending.is_empty());
        assert_eq!(result.plan.nodes().count(), 1);
        assert_eq!(result.plan.node("worker-1").unwrap().cpu_used, 1.0);
    }

    #[test]
    fn opens_new_node_when_nothing_fits() {
        let plan = Plan::new();
        let catalog = catalog_with_one_option();
        let pod = Pod::new("default", "a", 1.0, 1.0);

        let result = place(&plan, vec![pod], &catalog);
        assert!(result.still_pending.is_empty());
        assert_eq!(result.plan.nodes().count(), 1);
        let node = result.plan.nodes().next().unwrap();
        assert_eq!(node.machine_type, "e2-standard-4");
        assert_eq!(node.region, "us-east1");
    }

    #[test]
    fn worker_node_cap_blocks_opening_more() {
        let mut plan = Plan::new();
        for i in 0..MAX_WORKER_NODES {
            plan.open_node(ModelNode::new(
                format!("w{i}"),
                "us-east1",
                "e2-standard-4",
                4.0,
                16.0,
                0.134,
                true,
            ));
            // fill each node so a new pod can't fit existing ones
            plan.add_pod(&format!("w{i}"), Pod::new("default", format!("p{i}"), 4.0, 16.0))
                .unwrap();
        }
        let catalog = catalog_with_one_option();
        let pod = Pod::new("default", "overflow", 1.0, 1.0);
        let result = place(&plan, vec![pod], &catalog);
        assert_eq!(result.still_pending.len(), 1);
    }

    #[test]
    fn cluster_cpu_cap_blocks_opening_oversized_machine() {
        let plan = Plan::new();
        let spec_json = r#"{"us-east1": [{"name": "huge", "vcpus": 32, "mem_gib": 64}]}"#;
        let price_json = r#"{"us-east1": {"OnDemand": {"huge": 1.0}}}"#;
        let catalog = Catalog::from_json(spec_json, price_json).unwrap();
        let pod = Pod::new("default", "a", 1.0, 1.0);

        let result = place(&plan, vec![pod], &catalog);
        assert_eq!(result.still_pending.len(), 1);
    }

    #[test]
    fn pods_are_placed_hardest_first() {
        // With only one existing node big enough for the larger pod,
        // the smaller pod must be the one left pending if order were
        // reversed; confirm the larger pod gets seated.
        let mut plan = Plan::new();
        plan.open_node(ModelNode::new("worker-1", "us-east1", "e2-standard-4", 4.0, 16.0, 0.134, true));
        let catalog = Catalog::default();

        let small = Pod::new("default", "small", 0.5, 0.5);
        let big = Pod::new("default", "big", 3.0, 3.0);
        let result = place(&plan, vec![small, big], &catalog);
        assert!(result.still_pending.is_empty());
    }
}
