//! The leaf set: the nodes numerically nearest the local identifier.
//!
//! Two halves are kept, one per direction around the ring, each bounded by
//! `max_size / 2` and sorted by distance from the local node. Members are
//! addressed by a signed index: `0` is the local node, `i > 0` the `i`-th
//! clockwise neighbour and `i < 0` the `|i|`-th counterclockwise one.
//!
//! Every candidate is offered to both halves. In a ring with fewer than
//! `max_size` other nodes this places some handles in both halves at once,
//! which is exactly when [`LeafSet::overlaps`] reports true and the leaf set
//! covers the whole ring.

use std::cmp::Ordering;

use crate::error::{DecodeError, EncodeError};
use crate::handle::NodeHandle;
use crate::id::{closeness_cmp, Id, IdRange};
use crate::wire::{Decode, Encode, Reader, Writer};

/// Fixed-capacity set of ring neighbours.
#[derive(Clone, Debug)]
pub struct LeafSet {
    base: NodeHandle,
    cw: Vec<NodeHandle>,
    ccw: Vec<NodeHandle>,
    max_half: usize,
}

impl LeafSet {
    /// Create a leaf set for `base` holding up to `max_size` neighbours.
    pub fn new(base: NodeHandle, max_size: usize) -> Self {
        let max_half = (max_size / 2).max(1);
        Self {
            base,
            cw: Vec::with_capacity(max_half),
            ccw: Vec::with_capacity(max_half),
            max_half,
        }
    }

    /// The local node's handle.
    pub fn base(&self) -> &NodeHandle {
        &self.base
    }

    /// Capacity of both halves together.
    pub fn max_size(&self) -> usize {
        self.max_half * 2
    }

    pub fn cw_size(&self) -> usize {
        self.cw.len()
    }

    pub fn ccw_size(&self) -> usize {
        self.ccw.len()
    }

    /// Number of distinct neighbours.
    pub fn size(&self) -> usize {
        self.members().count()
    }

    pub fn is_empty(&self) -> bool {
        self.cw.is_empty() && self.ccw.is_empty()
    }

    /// Returns true when both halves are full.
    pub fn is_complete(&self) -> bool {
        self.cw.len() == self.max_half && self.ccw.len() == self.max_half
    }

    /// Offer `handle` to both halves. Returns true if either half changed.
    pub fn put(&mut self, handle: NodeHandle) -> bool {
        if handle.id() == self.base.id() {
            return false;
        }
        let base = self.base.id();
        let cw = insert_sorted(&mut self.cw, handle.clone(), self.max_half, |h| {
            base.cw_distance(&h.id())
        });
        let ccw = insert_sorted(&mut self.ccw, handle, self.max_half, |h| {
            h.id().cw_distance(&base)
        });
        cw || ccw
    }

    /// Remove the neighbour with identifier `id` from both halves.
    pub fn remove(&mut self, id: &Id) -> Option<NodeHandle> {
        let from_cw = take(&mut self.cw, id);
        let from_ccw = take(&mut self.ccw, id);
        from_cw.or(from_ccw)
    }

    /// Rebuild a leaf set from a snapshot, as seen by its base.
    pub fn from_snapshot(snapshot: &LeafSetSnapshot) -> Self {
        let mut ls = Self::new(snapshot.base.clone(), snapshot.max_size);
        for handle in snapshot.members() {
            ls.put(handle.clone());
        }
        ls
    }

    /// The neighbour with identifier `id`.
    pub fn find(&self, id: &Id) -> Option<&NodeHandle> {
        self.cw.iter().chain(self.ccw.iter()).find(|h| &h.id() == id)
    }

    /// Returns true if `id` is a neighbour.
    pub fn member(&self, id: &Id) -> bool {
        self.cw.iter().chain(self.ccw.iter()).any(|h| &h.id() == id)
    }

    /// Signed index of `id`, preferring the clockwise half. The local node is 0.
    pub fn get_index(&self, id: &Id) -> Option<i32> {
        if id == &self.base.id() {
            return Some(0);
        }
        if let Some(i) = self.cw.iter().position(|h| &h.id() == id) {
            return Some(i as i32 + 1);
        }
        self.ccw
            .iter()
            .position(|h| &h.id() == id)
            .map(|i| -(i as i32) - 1)
    }

    /// The handle at signed index `index`.
    pub fn get(&self, index: i32) -> Option<&NodeHandle> {
        match index.cmp(&0) {
            Ordering::Equal => Some(&self.base),
            Ordering::Greater => self.cw.get(index as usize - 1),
            Ordering::Less => self.ccw.get(index.unsigned_abs() as usize - 1),
        }
    }

    /// Signed index of the member (or local node) closest to `target`.
    pub fn most_similar(&self, target: &Id) -> i32 {
        let mut best_index = 0i32;
        let mut best_id = self.base.id();
        let candidates = self
            .cw
            .iter()
            .enumerate()
            .map(|(i, h)| (i as i32 + 1, h))
            .chain(self.ccw.iter().enumerate().map(|(i, h)| (-(i as i32) - 1, h)));
        for (index, handle) in candidates {
            if closeness_cmp(target, &handle.id(), &best_id) == Ordering::Less {
                best_index = index;
                best_id = handle.id();
            }
        }
        best_index
    }

    /// Returns true when the two halves wrap into each other.
    pub fn overlaps(&self) -> bool {
        match (self.cw.last(), self.ccw.last()) {
            (Some(cw_edge), Some(ccw_edge)) => {
                self.ccw.iter().any(|h| h.id() == cw_edge.id())
                    || self.cw.iter().any(|h| h.id() == ccw_edge.id())
            }
            _ => false,
        }
    }

    /// Distinct neighbours, clockwise half first.
    pub fn members(&self) -> impl Iterator<Item = &NodeHandle> {
        let cw = &self.cw;
        self.cw
            .iter()
            .chain(self.ccw.iter().filter(move |h| !cw.iter().any(|c| c.id() == h.id())))
    }

    /// Returns true if `target` lies between the farthest neighbours on each
    /// side, or the leaf set covers the whole ring.
    pub fn covers(&self, target: &Id) -> bool {
        if self.overlaps() {
            return true;
        }
        match (self.ccw.last(), self.cw.last()) {
            (Some(ccw_edge), Some(cw_edge)) => {
                target.is_between(&ccw_edge.id(), &cw_edge.id()) || *target == cw_edge.id()
            }
            _ => false,
        }
    }

    /// Up to `num` nodes nearest the local node, starting with the local node
    /// and alternating clockwise and counterclockwise.
    pub fn neighbor_set(&self, num: usize) -> Vec<NodeHandle> {
        let mut out = vec![self.base.clone()];
        let longest = self.cw.len().max(self.ccw.len());
        for i in 0..longest {
            for half in [&self.cw, &self.ccw] {
                if let Some(h) = half.get(i) {
                    if !out.iter().any(|o| o.id() == h.id()) {
                        out.push(h.clone());
                    }
                }
            }
        }
        out.truncate(num);
        out
    }

    /// The `max_rank` nodes closest to `key`, nearest first.
    ///
    /// Empty when `key` lies outside the span of the leaf set, since closer
    /// nodes may exist that this node does not know about.
    pub fn replica_set(&self, key: &Id, max_rank: usize) -> Vec<NodeHandle> {
        if !self.covers(key) && self.most_similar(key) != 0 {
            return Vec::new();
        }
        let mut all: Vec<NodeHandle> = std::iter::once(&self.base)
            .chain(self.members())
            .cloned()
            .collect();
        all.sort_by(|a, b| closeness_cmp(key, &a.id(), &b.id()));
        all.truncate(max_rank);
        all
    }

    /// Range of keys for which `handle` is among the `rank + 1` closest nodes.
    ///
    /// `None` when the leaf set does not reach far enough to tell.
    pub fn range(&self, handle: &NodeHandle, rank: usize) -> Option<IdRange> {
        if self.overlaps() {
            return self.ring_range(handle, rank);
        }
        let pos = self.get_index(&handle.id())?;
        let reach = rank as i32 + 1;
        let lower = self.get(pos - reach)?;
        let upper = self.get(pos + reach)?;
        Some(IdRange::new(
            lower.id().cw_midpoint(&handle.id()),
            handle.id().cw_midpoint(&upper.id()),
        ))
    }

    /// The part of [`range`](Self::range) gained on one side when moving from
    /// rank `rank - 1` to `rank`.
    pub fn range_directional(
        &self,
        handle: &NodeHandle,
        rank: usize,
        clockwise: bool,
    ) -> Option<IdRange> {
        let outer = self.range(handle, rank)?;
        if rank == 0 {
            return Some(outer);
        }
        let inner = match self.range(handle, rank - 1) {
            Some(inner) => inner,
            None => return Some(outer),
        };
        if outer.is_full() {
            return Some(outer);
        }
        Some(if clockwise {
            IdRange::new(inner.cw(), outer.cw())
        } else {
            IdRange::new(outer.ccw(), inner.ccw())
        })
    }

    /// Range computation for a leaf set that knows the whole ring.
    fn ring_range(&self, handle: &NodeHandle, rank: usize) -> Option<IdRange> {
        let base = self.base.id();
        let mut ring: Vec<NodeHandle> = std::iter::once(&self.base)
            .chain(self.members())
            .cloned()
            .collect();
        ring.sort_by_key(|h| base.cw_distance(&h.id()));
        let len = ring.len();
        let pos = ring.iter().position(|h| h.id() == handle.id())?;
        if rank + 1 >= len {
            return Some(IdRange::full());
        }
        let reach = rank + 1;
        let lower = &ring[(pos + len - reach % len) % len];
        let upper = &ring[(pos + reach) % len];
        Some(IdRange::new(
            lower.id().cw_midpoint(&handle.id()),
            handle.id().cw_midpoint(&upper.id()),
        ))
    }

    /// Copy of the current contents for the wire.
    pub fn snapshot(&self) -> LeafSetSnapshot {
        LeafSetSnapshot {
            max_size: self.max_size(),
            base: self.base.clone(),
            cw: self.cw.clone(),
            ccw: self.ccw.clone(),
        }
    }

    /// Insert `from`, the remote base and every live remote member.
    ///
    /// Returns the handles that were newly added.
    pub fn merge(&mut self, remote: &LeafSetSnapshot, from: &NodeHandle) -> Vec<NodeHandle> {
        let mut inserted = Vec::new();
        let candidates = std::iter::once(from)
            .chain(std::iter::once(&remote.base))
            .chain(remote.members());
        for handle in candidates {
            if !handle.is_alive() || self.member(&handle.id()) {
                continue;
            }
            if self.put(handle.clone()) {
                inserted.push(handle.clone());
            }
        }
        inserted
    }
}

/// Insert into a half sorted by `key`, evicting the farthest when full.
fn insert_sorted<K, F>(half: &mut Vec<NodeHandle>, handle: NodeHandle, max: usize, key: F) -> bool
where
    K: Ord,
    F: Fn(&NodeHandle) -> K,
{
    if half.iter().any(|h| h.id() == handle.id()) {
        return false;
    }
    let k = key(&handle);
    let at = half.iter().position(|h| key(h) > k).unwrap_or(half.len());
    if at >= max {
        return false;
    }
    half.insert(at, handle);
    half.truncate(max);
    true
}

fn take(half: &mut Vec<NodeHandle>, id: &Id) -> Option<NodeHandle> {
    let pos = half.iter().position(|h| &h.id() == id)?;
    Some(half.remove(pos))
}

/// A leaf set as carried by join replies and leaf-set broadcasts.
#[derive(Clone, Debug)]
pub struct LeafSetSnapshot {
    max_size: usize,
    base: NodeHandle,
    cw: Vec<NodeHandle>,
    ccw: Vec<NodeHandle>,
}

impl LeafSetSnapshot {
    /// The node whose leaf set this is.
    pub fn base(&self) -> &NodeHandle {
        &self.base
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn cw(&self) -> &[NodeHandle] {
        &self.cw
    }

    pub fn ccw(&self) -> &[NodeHandle] {
        &self.ccw
    }

    /// Distinct members excluding the base.
    pub fn members(&self) -> impl Iterator<Item = &NodeHandle> {
        let cw = &self.cw;
        self.cw
            .iter()
            .chain(self.ccw.iter().filter(move |h| !cw.iter().any(|c| c.id() == h.id())))
    }

    /// Returns true if `id` is the base or a member.
    pub fn contains(&self, id: &Id) -> bool {
        &self.base.id() == id || self.members().any(|h| &h.id() == id)
    }

    /// Every handle, base included, for coalescing after decode.
    pub(crate) fn handles_mut(&mut self) -> impl Iterator<Item = &mut NodeHandle> {
        std::iter::once(&mut self.base)
            .chain(self.cw.iter_mut())
            .chain(self.ccw.iter_mut())
    }
}

impl Encode for LeafSetSnapshot {
    fn encode(&self, writer: &mut Writer) -> Result<(), EncodeError> {
        let max_size = u16::try_from(self.max_size)
            .map_err(|_| EncodeError::CountTooLarge(self.max_size))?;
        writer.write_u16(max_size);
        writer.write_handle(&self.base)?;
        writer.write_handles(&self.cw)?;
        writer.write_handles(&self.ccw)
    }
}

impl Decode for LeafSetSnapshot {
    fn decode(reader: &mut Reader<'_>) -> Result<Self, DecodeError> {
        let max_size = reader.read_u16()? as usize;
        let base = reader.read_handle()?;
        let cw = reader.read_handles()?;
        let ccw = reader.read_handles()?;
        if cw.len() > max_size / 2 || ccw.len() > max_size / 2 {
            return Err(DecodeError::InvalidValue("leaf set half exceeds capacity"));
        }
        Ok(Self {
            max_size,
            base,
            cw,
            ccw,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(prefix: u8) -> NodeHandle {
        NodeHandle::new(Id::from_prefix(&[prefix]), format!("n{prefix:02x}"))
    }

    #[test]
    fn halves_are_sorted_by_distance() {
        let mut ls = LeafSet::new(handle(0x40), 4);
        for p in [0x60, 0x48, 0x30, 0x38, 0x50] {
            ls.put(handle(p));
        }
        let cw: Vec<_> = (1..=2).map(|i| ls.get(i).map(|h| h.id())).collect();
        assert_eq!(cw, vec![Some(handle(0x48).id()), Some(handle(0x50).id())]);
        let ccw: Vec<_> = (1..=2).map(|i| ls.get(-i).map(|h| h.id())).collect();
        assert_eq!(ccw, vec![Some(handle(0x38).id()), Some(handle(0x30).id())]);
        assert!(!ls.overlaps());
        assert!(ls.is_complete());
    }

    #[test]
    fn small_ring_overlaps() {
        let mut ls = LeafSet::new(handle(0x00), 4);
        ls.put(handle(0x80));
        assert_eq!(ls.size(), 1);
        assert_eq!(ls.cw_size(), 1);
        assert_eq!(ls.ccw_size(), 1);
        assert!(ls.overlaps());
        assert!(ls.covers(&Id::from_prefix(&[0xc0])));
    }

    #[test]
    fn most_similar_returns_signed_rank() {
        let mut ls = LeafSet::new(handle(0x40), 4);
        for p in [0x48, 0x50, 0x38, 0x30] {
            ls.put(handle(p));
        }
        assert_eq!(ls.most_similar(&Id::from_prefix(&[0x41])), 0);
        assert_eq!(ls.most_similar(&Id::from_prefix(&[0x4f])), 2);
        assert_eq!(ls.most_similar(&Id::from_prefix(&[0x37])), -1);
        assert_eq!(ls.most_similar(&Id::from_prefix(&[0x10])), -2);
    }

    #[test]
    fn ranges_are_bounded_by_midpoints() {
        let mut ls = LeafSet::new(handle(0x40), 4);
        for p in [0x48, 0x50, 0x38, 0x30] {
            ls.put(handle(p));
        }
        let range = ls.range(&handle(0x40), 0).expect("local range");
        assert_eq!(range.ccw(), Id::from_prefix(&[0x3c]));
        assert_eq!(range.cw(), Id::from_prefix(&[0x44]));

        let wider = ls.range(&handle(0x40), 1).expect("rank 1");
        assert_eq!(wider.ccw(), Id::from_prefix(&[0x38]));
        assert_eq!(wider.cw(), Id::from_prefix(&[0x48]));

        let cw_strip = ls
            .range_directional(&handle(0x40), 1, true)
            .expect("cw strip");
        assert_eq!(cw_strip.ccw(), Id::from_prefix(&[0x44]));
        assert_eq!(cw_strip.cw(), Id::from_prefix(&[0x48]));

        // the farthest member has no known neighbour beyond it
        assert!(ls.range(&handle(0x50), 0).is_none());
    }

    #[test]
    fn replica_set_is_nearest_first() {
        let mut ls = LeafSet::new(handle(0x40), 4);
        for p in [0x48, 0x50, 0x38, 0x30] {
            ls.put(handle(p));
        }
        let replicas = ls.replica_set(&Id::from_prefix(&[0x47]), 3);
        let ids: Vec<_> = replicas.iter().map(|h| h.id()).collect();
        assert_eq!(
            ids,
            vec![handle(0x48).id(), handle(0x40).id(), handle(0x50).id()]
        );
        assert!(ls.replica_set(&Id::from_prefix(&[0xc0]), 3).is_empty());
    }

    #[test]
    fn merge_skips_dead_members() {
        let mut remote = LeafSet::new(handle(0x50), 4);
        let dead = handle(0x58);
        remote.put(dead.clone());
        remote.put(handle(0x48));
        dead.set_liveness(crate::handle::Liveness::Dead);

        let mut ls = LeafSet::new(handle(0x40), 4);
        let inserted = ls.merge(&remote.snapshot(), &handle(0x50));
        let ids: Vec<_> = inserted.iter().map(|h| h.id()).collect();
        assert_eq!(ids, vec![handle(0x50).id(), handle(0x48).id()]);
        assert!(!ls.member(&dead.id()));
    }
}
