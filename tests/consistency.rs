mod common;

use rand::rngs::StdRng;
use rand::SeedableRng;

use nimbus_scheduler::model::Plan;
use nimbus_scheduler::rfsa;
use nimbus_scheduler::sa::{self, Mode, SaConfig};

use common::{pending_pod, test_catalog};

#[test]
fn repeated_cycles_over_the_same_pending_pods_converge_on_a_stable_node_count() {
    let catalog = test_catalog();
    let cfg = SaConfig {
        n_iter: 50,
        ..SaConfig::default()
    };

    let pods = vec![
        pending_pod("pod-a", 1.0, 2.0),
        pending_pod("pod-b", 1.0, 2.0),
        pending_pod("pod-c", 1.0, 2.0),
    ];

    // First cycle: place against an empty cluster.
    let mut rng = StdRng::seed_from_u64(1);
    let seed = rfsa::place(&Plan::new(), pods.clone(), &catalog);
    assert!(seed.still_pending.is_empty(), "all three pods should fit in one or two nodes");
    let (plan1, _) = sa::optimize(seed.plan, &[], Mode::Full, &catalog, &cfg, &mut rng);
    let nodes1 = plan1.nodes().count();

    // Second cycle: same pods, now already placed — nothing new to seat,
    // and the node count shouldn't grow just from re-running the cycle.
    let seed2 = rfsa::place(&plan1, vec![], &catalog);
    assert!(seed2.still_pending.is_empty());
    let (plan2, _) = sa::optimize(seed2.plan, &[], Mode::Full, &catalog, &cfg, &mut rng);
    let nodes2 = plan2.nodes().count();

    assert_eq!(nodes2, nodes1, "idle re-optimization should not open extra nodes");
}

#[test]
fn still_pending_pods_are_retried_on_the_next_cycle() {
    let catalog = test_catalog();

    // A pod too big for anything in the catalog stays pending rather than
    // silently vanishing, and is presented again on the next cycle.
    let huge = pending_pod("huge", 100.0, 100.0);
    let seed = rfsa::place(&Plan::new(), vec![huge.clone()], &catalog);
    assert_eq!(seed.still_pending.len(), 1);

    let seed_again = rfsa::place(&seed.plan, seed.still_pending, &catalog);
    assert_eq!(seed_again.still_pending.len(), 1);
    assert_eq!(seed_again.still_pending[0].full_name(), huge.full_name());
}
