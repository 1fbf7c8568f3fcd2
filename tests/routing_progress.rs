//! Routing over rings whose tables are filled from global knowledge.

use std::collections::HashMap;

use rand::rngs::StdRng;
use rand::SeedableRng;

use pastry_overlay::id::closeness_cmp;
use pastry_overlay::{Id, LeafSet, NodeHandle, RouteDecision, Router, RoutingTable};

const BASE_BITS: usize = 4;
const LEAF_SET_SIZE: usize = 16;

struct SyntheticNode {
    handle: NodeHandle,
    table: RoutingTable,
    leaf_set: LeafSet,
}

fn synthetic_ring(n: usize, seed: u64) -> HashMap<Id, SyntheticNode> {
    let mut rng = StdRng::seed_from_u64(seed);
    let handles: Vec<NodeHandle> = (0..n)
        .map(|i| NodeHandle::new(Id::random(&mut rng), format!("n{i}")))
        .collect();
    handles
        .iter()
        .map(|local| {
            let mut table = RoutingTable::new(local.clone(), BASE_BITS, 1);
            let mut leaf_set = LeafSet::new(local.clone(), LEAF_SET_SIZE);
            for other in &handles {
                if other.id() != local.id() {
                    table.put(other.clone());
                    leaf_set.put(other.clone());
                }
            }
            (
                local.id(),
                SyntheticNode {
                    handle: local.clone(),
                    table,
                    leaf_set,
                },
            )
        })
        .collect()
}

/// Shared-prefix depth of `a` with `target`, as a rank: lower is longer.
fn prefix_rank(a: &Id, target: &Id) -> i64 {
    a.index_of_msdd(target, BASE_BITS).map_or(-1, |d| d as i64)
}

/// Route `target` from `start`, checking progress at every hop. Returns the
/// node that delivered and the hop count.
fn route(ring: &mut HashMap<Id, SyntheticNode>, start: Id, target: Id) -> (Id, usize) {
    let mut current = start;
    let mut prev: Option<NodeHandle> = None;
    for hops in 0..64 {
        let node = ring.get_mut(&current).expect("node exists");
        let routed = Router::new(&mut node.table, &node.leaf_set).route(&target, prev.as_ref());
        match routed.decision {
            RouteDecision::Deliver => return (current, hops),
            RouteDecision::Drop { leased_to } => panic!("dropped at {current}: {leased_to} is dead"),
            RouteDecision::Forward { next_hop, .. } => {
                let next = next_hop.id();
                let closer = target.distance(&next) < target.distance(&current);
                let longer_prefix = prefix_rank(&next, &target) < prefix_rank(&current, &target);
                let neighbour = node.leaf_set.member(&next);
                assert!(
                    closer || longer_prefix || neighbour,
                    "hop {current} -> {next} made no progress toward {target}"
                );
                prev = Some(node.handle.clone());
                current = next;
            }
        }
    }
    panic!("route to {target} from {start} did not converge");
}

fn check_ring(n: usize, lookups: usize, max_hops: usize, seed: u64) {
    let mut ring = synthetic_ring(n, seed);
    let ids: Vec<Id> = ring.keys().copied().collect();
    let mut rng = StdRng::seed_from_u64(seed + 1);
    let mut total = 0;
    for i in 0..lookups {
        let target = Id::random(&mut rng);
        let start = ids[i % ids.len()];
        let root = ids
            .iter()
            .copied()
            .min_by(|a, b| closeness_cmp(&target, a, b))
            .expect("non-empty ring");
        let (delivered, hops) = route(&mut ring, start, target);
        assert_eq!(delivered, root, "lookup for {target} from {start}");
        assert!(hops <= max_hops, "{hops} hops for {target} in a ring of {n}");
        total += hops;
    }
    let mean = total as f64 / lookups as f64;
    assert!(mean <= max_hops as f64);
}

#[test]
fn eight_node_ring_routes_to_the_root() {
    check_ring(8, 200, 2, 11);
}

#[test]
fn sixty_four_node_ring_routes_to_the_root() {
    check_ring(64, 500, 6, 12);
}

#[test]
fn thousand_node_ring_routes_to_the_root() {
    check_ring(1000, 500, 8, 13);
}

#[test]
fn routing_to_a_member_delivers_at_that_member() {
    let mut ring = synthetic_ring(64, 14);
    let ids: Vec<Id> = ring.keys().copied().collect();
    for (i, target) in ids.iter().enumerate() {
        let start = ids[(i * 7 + 3) % ids.len()];
        let (delivered, _) = route(&mut ring, start, *target);
        assert_eq!(delivered, *target);
    }
}

#[test]
fn distance_is_symmetric() {
    let mut rng = StdRng::seed_from_u64(15);
    for _ in 0..1000 {
        let a = Id::random(&mut rng);
        let b = Id::random(&mut rng);
        assert_eq!(a.distance(&b), b.distance(&a));
    }
}
