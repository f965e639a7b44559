//! Post-processing passes applied after a placement algorithm produces a
//! candidate plan: folding hypothetical nodes back onto equivalent
//! existing ones, and bin-packing small new nodes into fewer larger ones.
//!
//! Grounded on `scheduler.py::_reuse_nodes` and `_pack_small_nodes`.

use std::collections::HashMap;

use rand::Rng;

use crate::catalog::Catalog;
use crate::model::{Node, Plan, Pod, MASTER_NODE_NAME};

#[derive(Debug, Clone)]
pub struct PostprocessConfig {
    pub reuse_spec_gap: f64,
    pub reuse_price_gap: f64,
    /// Cost slack allowed when packing N small nodes into one larger one:
    /// the replacement's price may exceed the sum of the originals' prices
    /// by up to this factor. See DESIGN.md's Open Question 2.
    pub pack_cost_slack: f64,
    pub pack_bin_cap_vcpu: f64,
}

impl Default for PostprocessConfig {
    fn default() -> Self {
        PostprocessConfig {
            reuse_spec_gap: 0.05,
            reuse_price_gap: 0.05,
            pack_cost_slack: 1.10,
            pack_bin_cap_vcpu: 8.0,
        }
    }
}

/// Map hypothetical nodes in `new` onto equivalent existing nodes in
/// `cur` when their capacity and price are within the configured gaps,
/// moving the hypothetical node's pods onto the matched existing node and
/// dropping the hypothetical node from `new`.
pub fn reuse_nodes(cur: &Plan, new: &mut Plan, cfg: &PostprocessConfig) {
    let hypothetical: Vec<String> = new
        .nodes()
        .filter(|n| !n.is_existing)
        .map(|n| n.name.clone())
        .collect();

    for new_name in hypothetical {
        let Some(nd_new) = new.node(&new_name) else { continue };
        let (cpu_cap, mem_cap, price) = (nd_new.cpu_cap, nd_new.mem_cap, nd_new.price);

        let matched = cur.nodes().find(|nd_old| {
            nd_old.is_existing
                && (cpu_cap - nd_old.cpu_cap).abs() / nd_old.cpu_cap <= cfg.reuse_spec_gap
                && (mem_cap - nd_old.mem_cap).abs() / nd_old.mem_cap <= cfg.reuse_spec_gap
                && (price - nd_old.price).abs() / nd_old.price <= cfg.reuse_price_gap
        });

        let Some(old_name) = matched.map(|n| n.name.clone()) else { continue };
        if new.node(&old_name).is_none() {
            // the existing node isn't in `new` yet (e.g. freshly snapshotted)
            continue;
        }

        let pods: Vec<Pod> = new.pods_on_node(&new_name).into_iter().cloned().collect();
        let mut ok = true;
        for pod in &pods {
            if new.move_pod(&pod.full_name(), &old_name).is_err() {
                ok = false;
                break;
            }
        }
        if ok {
            let _ = new.close_node(&new_name);
        }
    }
}

fn machine_family(machine_type: &str) -> &str {
    match machine_type.rsplit_once('-') {
        Some((family, suffix)) if suffix.chars().all(|c| c.is_ascii_digit()) => family,
        _ => machine_type,
    }
}

/// Bin-pack newly-opened small nodes (same family, same price) into
/// fewer, larger machines when the catalog offers one at or below
/// `pack_cost_slack` times the combined price of the originals.
pub fn pack_small_nodes(plan: &mut Plan, catalog: &Catalog, cfg: &PostprocessConfig, rng: &mut impl Rng) {
    let mut region_hist: HashMap<String, i64> = HashMap::new();
    for n in plan.nodes() {
        if n.name != MASTER_NODE_NAME {
            *region_hist.entry(n.region.clone()).or_insert(0) += 1;
        }
    }

    let mut groups: HashMap<(String, u64), Vec<String>> = HashMap::new();
    for n in plan.nodes() {
        if n.name == MASTER_NODE_NAME {
            continue;
        }
        let family = machine_family(&n.machine_type).to_string();
        let key = (family, n.price.to_bits());
        groups.entry(key).or_default().push(n.name.clone());
    }

    for ((family, price_bits), mut node_names) in groups {
        if node_names.len() < 2 {
            continue;
        }
        let price_small = f64::from_bits(price_bits);

        node_names.sort_by(|a, b| {
            let ca = plan.node(a).unwrap().usable_cpu_cap();
            let cb = plan.node(b).unwrap().usable_cpu_cap();
            cb.partial_cmp(&ca).unwrap()
        });

        let mut bins: Vec<Vec<String>> = Vec::new();
        for name in node_names {
            let usable = plan.node(&name).unwrap().usable_cpu_cap();
            let mut placed = false;
            for bin in &mut bins {
                let used: f64 = bin.iter().map(|n| plan.node(n).unwrap().usable_cpu_cap()).sum();
                if used + usable <= cfg.pack_bin_cap_vcpu - crate::model::DEFAULT_OVERHEAD_CPU {
                    bin.push(name.clone());
                    placed = true;
                    break;
                }
            }
            if !placed {
                bins.push(vec![name]);
            }
        }

        for box_names in bins {
            if box_names.len() < 2 {
                continue;
            }
            pack_one_box(plan, catalog, cfg, &box_names, &family, price_small, &mut region_hist, rng);
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn pack_one_box(
    plan: &mut Plan,
    catalog: &Catalog,
    cfg: &PostprocessConfig,
    box_names: &[String],
    family: &str,
    price_small: f64,
    region_hist: &mut HashMap<String, i64>,
    rng: &mut impl Rng,
) {
    let cpu_sum: f64 = box_names.iter().map(|n| plan.node(n).unwrap().usable_cpu_cap()).sum();
    let mem_sum: f64 = box_names.iter().map(|n| plan.node(n).unwrap().mem_cap).sum();
    let price_sum = price_small * box_names.len() as f64;

    let regions: Vec<&str> = box_names
        .iter()
        .map(|n| plan.node(n).unwrap().region.as_str())
        .collect();
    let target_region = if regions.iter().all(|r| *r == regions[0]) {
        regions[0].to_string()
    } else {
        regions
            .iter()
            .min_by_key(|r| *region_hist.get(**r).unwrap_or(&0))
            .map(|r| r.to_string())
            .unwrap()
    };

    let mut cand: Vec<(u32, f64, f64, String)> = Vec::new();
    for mt in catalog.machine_types_in(&target_region) {
        if !mt.starts_with(&format!("{family}-")) {
            continue;
        }
        let Some(spec) = catalog.spec(&target_region, mt) else { continue };
        if spec.vcpus as f64 > 8.0 {
            continue;
        }
        let Some(price_new) = catalog.price(&target_region, mt) else { continue };
        if spec.vcpus as f64 - crate::model::DEFAULT_OVERHEAD_CPU >= cpu_sum
            && spec.mem_gib >= mem_sum
            && price_new <= price_sum * cfg.pack_cost_slack
        {
            cand.push((spec.vcpus, spec.mem_gib, price_new, mt.to_string()));
        }
    }
    if cand.is_empty() {
        return;
    }
    cand.sort_by(|a, b| (a.0, a.2.to_bits()).cmp(&(b.0, b.2.to_bits())));
    let (vcpu, mem, price_new, mt) = cand[0].clone();

    let suffix: u32 = rand::random::<u32>() % 90_000 + 10_000;
    let _ = rng; // reserved for future deterministic seeding of the suffix
    let new_name = format!("pack-{target_region}-{mt}-{suffix}");
    let new_node = Node::new(new_name.clone(), target_region.clone(), mt, vcpu as f64, mem, price_new, false);
    plan.open_node(new_node);

    let mut moved: Vec<(String, Pod)> = Vec::new();
    let mut success = true;
    'outer: for name in box_names {
        let pods: Vec<Pod> = plan.pods_on_node(name).into_iter().cloned().collect();
        for pod in pods {
            if plan.move_pod(&pod.full_name(), &new_name).is_err() {
                success = false;
                break 'outer;
            }
            moved.push((name.clone(), pod));
        }
    }

    if !success {
        for (old_name, pod) in moved {
            let _ = plan.move_pod(&pod.full_name(), &old_name);
        }
        let _ = plan.close_node(&new_name);
        return;
    }

    for name in box_names {
        if plan.node(name).map(|n| n.is_empty()).unwrap_or(false) {
            let region = plan.node(name).unwrap().region.clone();
            let _ = plan.close_node(name);
            if let Some(c) = region_hist.get_mut(&region) {
                *c -= 1;
            }
        }
    }
    *region_hist.entry(target_region).or_insert(0) += 1;
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn catalog() -> Catalog {
        let spec_json = r#"{"us-east1": [
            {"name": "e2-standard-2", "vcpus": 2, "mem_gib": 8},
            {"name": "e2-standard-4", "vcpus": 4, "mem_gib": 16},
            {"name": "e2-standard-8", "vcpus": 8, "mem_gib": 32}
        ]}"#;
        let price_json = r#"{"us-east1": {"OnDemand": {
            "e2-standard-2": 0.067,
            "e2-standard-4": 0.134,
            "e2-standard-8": 0.268
        }}}"#;
        Catalog::from_json(spec_json, price_json).unwrap()
    }

    #[test]
    fn reuse_maps_hypothetical_node_onto_matching_existing_one() {
        let mut cur = Plan::new();
        cur.open_node(Node::new("w1", "us-east1", "e2-standard-4", 4.0, 16.0, 0.134, true));

        let mut new_plan = Plan::new();
        new_plan.open_node(Node::new("w1", "us-east1", "e2-standard-4", 4.0, 16.0, 0.134, true));
        new_plan.open_node(Node::new("hyp-1", "us-east1", "e2-standard-4", 4.05, 16.2, 0.135, false));
        new_plan.add_pod("hyp-1", Pod::new("default", "a", 1.0, 1.0)).unwrap();

        reuse_nodes(&cur, &mut new_plan, &PostprocessConfig::default());

        assert!(new_plan.node("hyp-1").is_none());
        assert_eq!(new_plan.node_of("default/a"), Some("w1"));
    }

    #[test]
    fn reuse_leaves_dissimilar_hypothetical_node_alone() {
        let cur = Plan::new();
        let mut new_plan = Plan::new();
        new_plan.open_node(Node::new("hyp-1", "us-east1", "e2-standard-8", 8.0, 32.0, 0.268, false));

        reuse_nodes(&cur, &mut new_plan, &PostprocessConfig::default());
        assert!(new_plan.node("hyp-1").is_some());
    }

    #[test]
    fn packs_two_small_nodes_into_one_larger_node() {
        let mut plan = Plan::new();
        plan.open_node(Node::new("n1", "us-east1", "e2-standard-2", 2.0, 8.0, 0.067, false));
        plan.open_node(Node::new("n2", "us-east1", "e2-standard-2", 2.0, 8.0, 0.067, false));
        plan.add_pod("n1", Pod::new("default", "a", 0.5, 1.0)).unwrap();
        plan.add_pod("n2", Pod::new("default", "b", 0.5, 1.0)).unwrap();

        let catalog = catalog();
        let cfg = PostprocessConfig::default();
        let mut rng = rand::rngs::StdRng::seed_from_u64(1);
        pack_small_nodes(&mut plan, &catalog, &cfg, &mut rng);

        assert_eq!(plan.nodes().count(), 1);
        let merged = plan.nodes().next().unwrap();
        assert_eq!(merged.machine_type, "e2-standard-4");
        assert_eq!(plan.node_of("default/a"), Some(merged.name.as_str()));
        assert_eq!(plan.node_of("default/b"), Some(merged.name.as_str()));
    }

    #[test]
    fn single_small_node_is_left_unpacked() {
        let mut plan = Plan::new();
        plan.open_node(Node::new("n1", "us-east1", "e2-standard-2", 2.0, 8.0, 0.067, false));
        let catalog = catalog();
        let cfg = PostprocessConfig::default();
        let mut rng = rand::rngs::StdRng::seed_from_u64(1);
        pack_small_nodes(&mut plan, &catalog, &cfg, &mut rng);
        assert_eq!(plan.nodes().count(), 1);
        assert_eq!(plan.node("n1").unwrap().machine_type, "e2-standard-2");
    }
}
