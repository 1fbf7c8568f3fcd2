//! Per-hop routing decisions.
//!
//! [`Router::route`] looks at the local leaf set first and falls back to the
//! routing table. It returns what to do with the message and, separately, an
//! optional row repair for the previous hop. Nothing here sends anything: the
//! node performs the sends after releasing its state lock.

use tracing::{debug, info, trace};

use crate::handle::{Liveness, NodeHandle};
use crate::id::Id;
use crate::leaf_set::LeafSet;
use crate::protocol::BroadcastRouteRow;
use crate::routing_table::RoutingTable;

/// What to do with a message at this hop.
#[derive(Clone, Debug)]
pub enum RouteDecision {
    /// The local node is the root of the target.
    Deliver,
    /// Send the message on to `next_hop`.
    Forward {
        /// Chosen next hop.
        next_hop: NodeHandle,
        /// Whether the sender may re-resolve if the hop proves unreachable.
        reroute_if_suspected: bool,
    },
    /// Discard the message. The leaf-set member that should receive it is
    /// dead but may still hold a lease on the target.
    Drop {
        /// The dead member.
        leased_to: NodeHandle,
    },
}

/// A routing decision plus any repair it triggered.
#[derive(Clone, Debug)]
pub struct Routed {
    pub decision: RouteDecision,
    /// Row to send to the previous hop, which appears to lack it.
    pub repair: Option<(NodeHandle, BroadcastRouteRow)>,
}

/// Routing over one node's membership state.
pub struct Router<'a> {
    routing_table: &'a mut RoutingTable,
    leaf_set: &'a LeafSet,
}

impl<'a> Router<'a> {
    pub fn new(routing_table: &'a mut RoutingTable, leaf_set: &'a LeafSet) -> Self {
        Self {
            routing_table,
            leaf_set,
        }
    }

    /// Decide the next hop for a message to `target` that arrived from `prev`.
    pub fn route(&mut self, target: &Id, prev: Option<&NodeHandle>) -> Routed {
        let ls_pos = self.leaf_set.most_similar(target);

        let decision = if ls_pos == 0 {
            RouteDecision::Deliver
        } else if self.within_leaf_set(target, ls_pos) {
            match self.leaf_set_hop(ls_pos) {
                Ok(decision) => decision,
                Err(dropped) => return dropped,
            }
        } else {
            match self.table_hop(target, ls_pos) {
                Ok(decision) => decision,
                Err(dropped) => return dropped,
            }
        };

        let repair = self.check_route_table_hole(target, prev);
        Routed { decision, repair }
    }

    /// Returns true if the member at `ls_pos` is the root of `target`: either
    /// it is not at the edge of its half, or the target lies on the local side
    /// of the edge.
    fn within_leaf_set(&self, target: &Id, ls_pos: i32) -> bool {
        if self.leaf_set.overlaps() {
            return true;
        }
        let Some(edge) = self.leaf_set.get(ls_pos) else {
            return false;
        };
        let magnitude = ls_pos.unsigned_abs() as usize;
        if ls_pos > 0 {
            magnitude < self.leaf_set.cw_size() || !edge.id().clockwise(target)
        } else {
            magnitude < self.leaf_set.ccw_size() || edge.id().clockwise(target)
        }
    }

    fn leaf_set_hop(&mut self, ls_pos: i32) -> Result<RouteDecision, Routed> {
        let (next_hop, reroute) = self.best_from_leaf_set(ls_pos)?;
        self.routing_table.put(next_hop.clone());
        Ok(RouteDecision::Forward {
            next_hop,
            reroute_if_suspected: reroute,
        })
    }

    fn table_hop(&mut self, target: &Id, ls_pos: i32) -> Result<RouteDecision, Routed> {
        let primary = self
            .routing_table
            .get_best_entry(target)
            .and_then(|set| set.closest_node(Liveness::Alive));
        if let Some(next_hop) = primary {
            trace!(target = %target, next = %next_hop.id(), "routing table hop");
            return Ok(RouteDecision::Forward {
                next_hop,
                reroute_if_suspected: true,
            });
        }

        if let Some(set) = self.routing_table.get_best_entry_mut(target) {
            set.cull_dead();
        }

        match self.routing_table.best_alternate_route(Liveness::Alive, target) {
            Some(alternate) => {
                let edge_closer = self
                    .leaf_set
                    .get(ls_pos)
                    .map(|edge| edge.id().distance(target) < alternate.id().distance(target))
                    .unwrap_or(false);
                if edge_closer {
                    self.leaf_set_hop(ls_pos)
                } else {
                    trace!(target = %target, next = %alternate.id(), "alternate route");
                    Ok(RouteDecision::Forward {
                        next_hop: alternate,
                        reroute_if_suspected: true,
                    })
                }
            }
            None => self.leaf_set_hop(ls_pos),
        }
    }

    /// Pick a leaf-set hop near `ls_pos`, honouring leases.
    ///
    /// An alive member is used as is. A suspected one is replaced by the
    /// nearest non-suspected member between it and the local node, if any;
    /// rerouting stays enabled only when such a member exists. A dead member
    /// may still hold a lease, so the message is dropped.
    fn best_from_leaf_set(&self, ls_pos: i32) -> Result<(NodeHandle, bool), Routed> {
        let Some(handle) = self.leaf_set.get(ls_pos).cloned() else {
            return Ok((self.leaf_set.base().clone(), true));
        };
        match handle.liveness() {
            Liveness::Alive => Ok((handle, true)),
            Liveness::Suspected => {
                let step = if ls_pos > 0 { -1 } else { 1 };
                let mut i = ls_pos + step;
                while i != 0 {
                    if let Some(closer) = self.leaf_set.get(i) {
                        if closer.liveness() < Liveness::Suspected {
                            debug!(
                                suspected = %handle.id(),
                                instead = %closer.id(),
                                "avoiding suspected leaf set member"
                            );
                            return Ok((closer.clone(), true));
                        }
                    }
                    i += step;
                }
                Ok((handle, false))
            }
            Liveness::Dead => {
                info!(next = %handle.id(), "dropping message: next hop is dead but has lease");
                Err(Routed {
                    decision: RouteDecision::Drop { leased_to: handle },
                    repair: None,
                })
            }
        }
    }

    /// If the previous hop shares as long a prefix with the target as the
    /// local node does, it made no prefix progress and is probably missing
    /// the row we would have used. Best effort: the row is only a hint.
    fn check_route_table_hole(
        &self,
        target: &Id,
        prev: Option<&NodeHandle>,
    ) -> Option<(NodeHandle, BroadcastRouteRow)> {
        let prev = prev?;
        let local = self.leaf_set.base();
        if prev.id() == local.id() || self.leaf_set.overlaps() {
            return None;
        }
        if let Some(index) = self.leaf_set.get_index(&prev.id()) {
            let cw_edge = self.leaf_set.cw_size() as i32;
            let ccw_edge = -(self.leaf_set.ccw_size() as i32);
            if index != cw_edge && index != ccw_edge {
                return None;
            }
        }

        let base_bits = self.routing_table.base_bits();
        let diff = prev.id().index_of_msdd(target, base_bits)?;
        if local.id().index_of_msdd(target, base_bits) != Some(diff) || !prev.is_alive() {
            return None;
        }
        debug!(peer = %prev.id(), row = diff, "found hole in routing table of previous hop");
        Some((
            prev.clone(),
            BroadcastRouteRow {
                from: local.clone(),
                row: self.routing_table.get_row(diff),
            },
        ))
    }
}
