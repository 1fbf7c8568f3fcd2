use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use pastry_overlay::{Id, LeafSet, Liveness, NodeHandle};

fn handle(i: usize, rng: &mut StdRng) -> NodeHandle {
    NodeHandle::new(Id::random(rng), format!("h{i}"))
}

fn ids(ls: &LeafSet) -> Vec<Id> {
    ls.members().map(NodeHandle::id).collect()
}

#[test]
fn halves_stay_bounded_under_churn() {
    let mut rng = StdRng::seed_from_u64(31);
    let local = handle(0, &mut rng);
    let mut ls = LeafSet::new(local, 8);
    let pool: Vec<NodeHandle> = (1..200).map(|i| handle(i, &mut rng)).collect();

    for _ in 0..2000 {
        let h = &pool[rng.gen_range(0..pool.len())];
        if rng.gen_bool(0.7) {
            ls.put(h.clone());
        } else {
            ls.remove(&h.id());
        }
        assert!(ls.cw_size() <= 4);
        assert!(ls.ccw_size() <= 4);
    }
}

#[test]
fn halves_are_sorted_by_circular_distance() {
    let mut rng = StdRng::seed_from_u64(32);
    let local = handle(0, &mut rng);
    let base = local.id();
    let mut ls = LeafSet::new(local, 12);
    for i in 1..100 {
        ls.put(handle(i, &mut rng));
    }
    for pair in 1..ls.cw_size() as i32 {
        let a = ls.get(pair).expect("cw member").id();
        let b = ls.get(pair + 1).expect("cw member").id();
        assert!(base.cw_distance(&a) < base.cw_distance(&b));
    }
    for pair in 1..ls.ccw_size() as i32 {
        let a = ls.get(-pair).expect("ccw member").id();
        let b = ls.get(-pair - 1).expect("ccw member").id();
        assert!(a.cw_distance(&base) < b.cw_distance(&base));
    }
}

#[test]
fn repeated_put_is_idempotent() {
    let mut rng = StdRng::seed_from_u64(33);
    let local = handle(0, &mut rng);
    let mut ls = LeafSet::new(local, 8);
    let peers: Vec<NodeHandle> = (1..20).map(|i| handle(i, &mut rng)).collect();
    for p in &peers {
        ls.put(p.clone());
    }
    let before = ids(&ls);
    for p in &peers {
        assert!(!ls.put(p.clone()));
    }
    assert_eq!(ids(&ls), before);
}

#[test]
fn most_similar_is_zero_for_the_local_id() {
    let mut rng = StdRng::seed_from_u64(34);
    let local = handle(0, &mut rng);
    let base = local.id();
    let mut ls = LeafSet::new(local, 8);
    for i in 1..30 {
        ls.put(handle(i, &mut rng));
    }
    assert_eq!(ls.most_similar(&base), 0);
    let first_cw = ls.get(1).expect("cw").id();
    assert_eq!(ls.most_similar(&first_cw), 1);
    assert_eq!(ls.get_index(&first_cw), Some(1));
}

#[test]
fn snapshot_rebuilds_the_same_leaf_set() {
    let mut rng = StdRng::seed_from_u64(35);
    let local = handle(0, &mut rng);
    let mut ls = LeafSet::new(local, 8);
    for i in 1..40 {
        ls.put(handle(i, &mut rng));
    }
    let rebuilt = LeafSet::from_snapshot(&ls.snapshot());
    assert_eq!(ids(&rebuilt), ids(&ls));
    assert_eq!(rebuilt.base().id(), ls.base().id());
}

#[test]
fn merge_reports_only_new_live_members() {
    let mut rng = StdRng::seed_from_u64(36);
    let a = handle(0, &mut rng);
    let b = handle(1, &mut rng);
    let mut remote = LeafSet::new(b.clone(), 8);
    let dead = handle(2, &mut rng);
    let live = handle(3, &mut rng);
    remote.put(dead.clone());
    remote.put(live.clone());
    dead.set_liveness(Liveness::Dead);

    let mut ls = LeafSet::new(a, 8);
    let inserted: Vec<Id> = ls
        .merge(&remote.snapshot(), &b)
        .iter()
        .map(NodeHandle::id)
        .collect();
    assert!(inserted.contains(&b.id()));
    assert!(inserted.contains(&live.id()));
    assert!(!inserted.contains(&dead.id()));
    assert!(ls.merge(&remote.snapshot(), &b).is_empty());
}
