#[path = "common/mod.rs"]
mod common;

use common::{test_config, TestRing};
use pastry_overlay::{get_nearest, Id, NodeHandle};

async fn proximity(ring: &TestRing, from: &str, to: &NodeHandle) -> u32 {
    let a = ring.registry.position(from).await.expect("registered");
    let b = ring.registry.position(to.address()).await.expect("registered");
    a.proximity(&b)
}

#[tokio::test]
async fn discovery_returns_measured_nodes_nearest_first() {
    let mut ring = TestRing::random(test_config(), 40, 51).await;
    let joiner = ring.spawn(Id::from_key(b"newcomer")).await.node.clone();
    let seed = ring.nodes[5].handle();

    let found = joiner.nearest_nodes(&seed).await;
    assert!(found.len() > 1);
    assert!(found.iter().all(|h| h.id() != joiner.id()));

    let mut last = 0;
    for h in &found {
        let p = proximity(&ring, joiner.local_handle().address(), h).await;
        assert!(p >= last, "results out of proximity order");
        last = p;
    }
    let seed_prox = proximity(&ring, joiner.local_handle().address(), &seed).await;
    let best = proximity(&ring, joiner.local_handle().address(), &found[0]).await;
    assert!(best <= seed_prox);
}

#[tokio::test]
async fn discovered_nodes_bootstrap_a_join() {
    let mut ring = TestRing::random(test_config(), 16, 52).await;
    let joiner = ring.spawn(Id::from_key(b"late")).await.node.clone();
    let seed = ring.nodes[0].handle();

    let bootstraps = joiner.nearest_nodes(&seed).await;
    joiner.join(&bootstraps).await.expect("join via nearest node");
    assert!(joiner.is_ready().await);
}

#[tokio::test]
async fn unreachable_seed_falls_back_to_itself() {
    let mut ring = TestRing::random(test_config(), 4, 53).await;
    let joiner = ring.spawn(Id::from_key(b"lonely")).await.node.clone();
    let seed = ring.nodes[1].handle();
    ring.registry.kill(&ring.nodes[1].address()).await;

    let found = get_nearest(
        joiner.network(),
        joiner.local_handle(),
        &seed,
        ring.config.num_rows(),
        None,
    )
    .await;
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].id(), seed.id());
}

#[tokio::test]
async fn limiting_rows_still_finds_candidates() {
    let mut ring = TestRing::random(test_config(), 30, 54).await;
    let joiner = ring.spawn(Id::from_key(b"limited")).await.node.clone();
    let seed = ring.nodes[3].handle();

    let found = get_nearest(
        joiner.network(),
        joiner.local_handle(),
        &seed,
        ring.config.num_rows(),
        Some(2),
    )
    .await;
    assert!(!found.is_empty());
    assert!(found.iter().any(|h| h.id() == seed.id()));
}

#[tokio::test]
async fn dead_candidates_are_skipped_not_fatal() {
    let mut ring = TestRing::random(test_config(), 16, 52).await;
    let joiner = ring.spawn(Id::from_key(b"survivor")).await.node.clone();
    let seed = ring.nodes[0].handle();
    let num_rows = ring.config.num_rows();

    let baseline = get_nearest(joiner.network(), joiner.local_handle(), &seed, num_rows, None).await;
    assert!(baseline.len() > 1);

    // One leaf-set member and one routing-table entry of the seed go down.
    let mut dead = vec![ring.nodes[0].node.leaf_set_ids().await[0]];
    if let Some(entry) = ring.nodes[0]
        .node
        .routing_table_ids()
        .await
        .into_iter()
        .find(|id| !dead.contains(id))
    {
        dead.push(entry);
    }
    for id in &dead {
        let address = ring.by_id(id).expect("ring member").address();
        ring.registry.kill(&address).await;
    }

    let found = get_nearest(joiner.network(), joiner.local_handle(), &seed, num_rows, None).await;
    assert!(found.len() > 1, "discovery collapsed to the seed");
    assert!(found.iter().any(|h| h.id() == seed.id()));
    assert!(found.iter().all(|h| !dead.contains(&h.id())));
    for h in &found {
        assert!(ring.registry.is_alive(h.address()).await);
    }
}
