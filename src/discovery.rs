//! Nearest-node discovery.
//!
//! Starting from any ring member, walk toward the member nearest to the local
//! node in the proximity space: first through the seed's leaf set, then up
//! the routing-table rows of successively nearer nodes, and finally around the
//! top row until no nearer node turns up. A joining node uses the result to
//! pick a bootstrap close to it, which keeps its routing table locality-aware.

use std::collections::{HashMap, HashSet};

use anyhow::anyhow;
use tracing::{debug, trace};

use crate::handle::NodeHandle;
use crate::id::Id;
use crate::node::{OverlayNetwork, PastryNode};

/// Proximity measurements taken during one discovery walk.
///
/// Each node is measured at most once per walk; the cache is dropped with it.
struct ProximityCache<'a, N: ?Sized> {
    network: &'a N,
    local: Id,
    measured: HashMap<Id, (NodeHandle, u32)>,
    unreachable: HashSet<Id>,
}

impl<'a, N: OverlayNetwork + ?Sized> ProximityCache<'a, N> {
    fn new(network: &'a N, local: Id) -> Self {
        Self {
            network,
            local,
            measured: HashMap::new(),
            unreachable: HashSet::new(),
        }
    }

    /// `None` when the node cannot be measured; it is then never tried again.
    async fn proximity(&mut self, handle: &NodeHandle) -> Option<u32> {
        let id = handle.id();
        if let Some((_, prox)) = self.measured.get(&id) {
            return Some(*prox);
        }
        if self.unreachable.contains(&id) {
            return None;
        }
        match self.network.proximity(handle).await {
            Ok(prox) => {
                self.measured.insert(id, (handle.clone(), prox));
                Some(prox)
            }
            Err(err) => {
                trace!(peer = %id, "skipping unreachable node: {err:#}");
                self.unreachable.insert(id);
                None
            }
        }
    }

    /// The nearest live node among `current` and `candidates`.
    ///
    /// A candidate at proximity 0 is the local node itself and never wins.
    /// Unreachable candidates are skipped.
    async fn closest_to_me<'h, I>(
        &mut self,
        current: &NodeHandle,
        candidates: I,
    ) -> anyhow::Result<NodeHandle>
    where
        I: IntoIterator<Item = &'h NodeHandle>,
    {
        let mut nearest = current.clone();
        let mut nearest_prox = self
            .proximity(current)
            .await
            .ok_or_else(|| anyhow!("{current} is unreachable"))?;
        for candidate in candidates {
            if candidate.id() == self.local || !candidate.is_alive() {
                continue;
            }
            let Some(prox) = self.proximity(candidate).await else {
                continue;
            };
            if prox > 0 && prox < nearest_prox && candidate.is_alive() {
                nearest = candidate.clone();
                nearest_prox = prox;
            }
        }
        Ok(nearest)
    }

    /// Every measured node except the local one, nearest first.
    fn into_sorted(self) -> Vec<NodeHandle> {
        let local = self.local;
        let mut all: Vec<(NodeHandle, u32)> = self
            .measured
            .into_values()
            .filter(|(h, _)| h.id() != local)
            .collect();
        all.sort_by(|(a, pa), (b, pb)| pa.cmp(pb).then_with(|| a.id().cmp(&b.id())));
        all.into_iter().map(|(h, _)| h).collect()
    }
}

/// Find the ring members nearest to `local`, starting from `seed`.
///
/// `num_rows` is the routing-table depth and `pns_rows` limits the walk to
/// that many of the highest rows. Returns every reachable node measured along
/// the way, nearest first. Nodes that cannot be measured are left out and the
/// walk goes on without them; only when the seed itself cannot be reached is
/// the seed returned alone.
pub async fn get_nearest<N: OverlayNetwork + ?Sized>(
    network: &N,
    local: &NodeHandle,
    seed: &NodeHandle,
    num_rows: usize,
    pns_rows: Option<usize>,
) -> Vec<NodeHandle> {
    let mut cache = ProximityCache::new(network, local.id());
    match walk(&mut cache, seed, num_rows, pns_rows).await {
        Ok(nearest) => {
            debug!(
                seed = %seed.id(),
                nearest = %nearest.id(),
                measured = cache.measured.len(),
                unreachable = cache.unreachable.len(),
                "nearest node discovery finished"
            );
            cache.into_sorted()
        }
        Err(err) => {
            debug!(seed = %seed.id(), "nearest node discovery failed: {err:#}");
            vec![seed.clone()]
        }
    }
}

/// Errors only when the seed cannot be queried. A row query that fails
/// further along ends the walk at the nearest node found so far.
async fn walk<N: OverlayNetwork + ?Sized>(
    cache: &mut ProximityCache<'_, N>,
    seed: &NodeHandle,
    num_rows: usize,
    pns_rows: Option<usize>,
) -> anyhow::Result<NodeHandle> {
    let leaf_set = cache.network.leaf_set(seed).await?;
    let mut nearest = cache
        .closest_to_me(seed, std::iter::once(leaf_set.base()).chain(leaf_set.members()))
        .await?;

    let first = pns_rows.map_or(0, |n| num_rows.saturating_sub(n));
    for row in first..num_rows {
        let entries = match cache.network.route_row(&nearest, row).await {
            Ok(entries) => entries,
            Err(err) => {
                debug!(row, peer = %nearest.id(), "row query failed, stopping walk: {err:#}");
                return Ok(nearest);
            }
        };
        nearest = cache.closest_to_me(&nearest, entries.handles()).await?;
        trace!(row, nearest = %nearest.id(), "discovery step");
    }

    let Some(top) = num_rows.checked_sub(1) else {
        return Ok(nearest);
    };
    loop {
        let previous = nearest.clone();
        let entries = match cache.network.route_row(&previous, top).await {
            Ok(entries) => entries,
            Err(err) => {
                debug!(peer = %previous.id(), "top row query failed, stopping walk: {err:#}");
                return Ok(previous);
            }
        };
        nearest = cache.closest_to_me(&previous, entries.handles()).await?;
        if nearest.id() == previous.id() {
            return Ok(nearest);
        }
    }
}

impl<N: OverlayNetwork> PastryNode<N> {
    /// Discover ring members near this node, starting from `seed`.
    ///
    /// The result is nearest first and suitable as a bootstrap list for
    /// [`join`](Self::join).
    pub async fn nearest_nodes(&self, seed: &NodeHandle) -> Vec<NodeHandle> {
        let found = get_nearest(
            self.network(),
            self.local_handle(),
            seed,
            self.config().num_rows(),
            self.config().pns_rows_to_use,
        )
        .await;
        let mut state = self.state.lock().await;
        found.into_iter().map(|h| state.coalesce(h)).collect()
    }
}
