//! Node handles: identity plus a shared, observable liveness state.
//!
//! A [`NodeHandle`] is a cheap clone of a reference-counted record. The same
//! handle may sit in a routing table cell, in both halves of the leaf set and
//! in an in-flight message at once; every holder observes the same liveness
//! because the state lives in atomics inside the shared record. The transport
//! collaborator is the only writer of liveness and proximity.
//!
//! Equality and hashing use the identifier only. Two handles with the same
//! identifier but different transport addresses compare equal; use
//! [`NodeHandle::same_endpoint`] to tell them apart (identifier collisions).

use std::fmt;
use std::hash::{Hash, Hasher};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;

use lru::LruCache;

use crate::id::Id;

/// Proximity value meaning "not measured yet".
pub const PROXIMITY_UNKNOWN: u32 = u32::MAX;

/// Liveness of a remote node as seen by the local transport.
///
/// The ordering is meaningful: a liveness floor of [`Liveness::Suspected`]
/// admits alive and suspected handles.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Liveness {
    /// Recently heard from.
    Alive = 0,
    /// Missed recent probes; may be dead.
    Suspected = 1,
    /// Declared faulty.
    Dead = 2,
}

impl Liveness {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Liveness::Alive,
            1 => Liveness::Suspected,
            _ => Liveness::Dead,
        }
    }
}

struct HandleState {
    id: Id,
    address: String,
    liveness: AtomicU8,
    proximity: AtomicU32,
}

/// Reference to a (possibly remote) overlay node.
#[derive(Clone)]
pub struct NodeHandle {
    inner: Arc<HandleState>,
}

impl NodeHandle {
    /// Create an alive handle with unknown proximity.
    pub fn new(id: Id, address: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(HandleState {
                id,
                address: address.into(),
                liveness: AtomicU8::new(Liveness::Alive as u8),
                proximity: AtomicU32::new(PROXIMITY_UNKNOWN),
            }),
        }
    }

    /// The node's identifier.
    pub fn id(&self) -> Id {
        self.inner.id
    }

    /// Transport-opaque address.
    pub fn address(&self) -> &str {
        &self.inner.address
    }

    /// Current liveness as last written by the transport.
    pub fn liveness(&self) -> Liveness {
        Liveness::from_u8(self.inner.liveness.load(Ordering::Acquire))
    }

    /// Returns true unless the handle has been declared dead.
    pub fn is_alive(&self) -> bool {
        self.liveness() != Liveness::Dead
    }

    /// Record a new liveness state. Transport side only.
    pub fn set_liveness(&self, liveness: Liveness) {
        self.inner
            .liveness
            .store(liveness as u8, Ordering::Release);
    }

    /// Last measured proximity (lower is nearer), if any.
    pub fn proximity(&self) -> Option<u32> {
        match self.inner.proximity.load(Ordering::Acquire) {
            PROXIMITY_UNKNOWN => None,
            value => Some(value),
        }
    }

    /// Proximity used for ordering; unmeasured handles sort last.
    pub(crate) fn proximity_or_max(&self) -> u32 {
        self.inner.proximity.load(Ordering::Acquire)
    }

    /// Record a proximity measurement. Transport side only.
    pub fn set_proximity(&self, proximity: u32) {
        self.inner.proximity.store(proximity, Ordering::Release);
    }

    /// Returns true if both handles name the same identifier at the same
    /// transport address.
    pub fn same_endpoint(&self, other: &NodeHandle) -> bool {
        self.inner.id == other.inner.id && self.inner.address == other.inner.address
    }

    /// Returns true if both handles share the same underlying record.
    pub fn ptr_eq(&self, other: &NodeHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl PartialEq for NodeHandle {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for NodeHandle {}

impl Hash for NodeHandle {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.id.hash(state);
    }
}

impl fmt::Display for NodeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{} @ {}]", self.inner.id, self.inner.address)
    }
}

impl fmt::Debug for NodeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeHandle")
            .field("id", &self.inner.id)
            .field("address", &self.inner.address)
            .field("liveness", &self.liveness())
            .finish()
    }
}

/// Canonicalises handles decoded from the wire.
///
/// Every decode produces a fresh record; coalescing maps it back to the
/// node's existing record for the same endpoint so liveness updates are seen
/// everywhere. Entries are kept in an LRU so handles that are only ever seen
/// in passing do not accumulate. Handles held by the routing table or leaf
/// set are resolved by the node before it falls back to this cache, so
/// evicting one of those loses nothing.
pub struct HandleCache {
    cache: LruCache<Id, NodeHandle>,
}

impl HandleCache {
    /// Create a cache holding at most `capacity` handles.
    pub fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: LruCache::new(cap),
        }
    }

    /// Return the canonical handle for `handle`'s endpoint, registering
    /// `handle` as canonical when none is known.
    ///
    /// A cached handle with the same identifier but a different address is
    /// left alone and `handle` is returned as-is, so colliding nodes never
    /// share liveness state.
    pub fn coalesce(&mut self, handle: NodeHandle) -> NodeHandle {
        if let Some(existing) = self.cache.get(&handle.id()) {
            if existing.same_endpoint(&handle) {
                return existing.clone();
            }
            return handle;
        }
        self.cache.put(handle.id(), handle.clone());
        handle
    }

    /// Register `handle` as canonical for its identifier.
    pub fn insert(&mut self, handle: NodeHandle) {
        self.cache.put(handle.id(), handle);
    }

    /// Look up the canonical handle for `id`.
    pub fn get(&mut self, id: &Id) -> Option<NodeHandle> {
        self.cache.get(id).cloned()
    }

    /// Number of cached handles.
    pub fn len(&self) -> usize {
        self.cache.len()
    }

    /// Returns true if nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn liveness_is_shared_between_clones() {
        let handle = NodeHandle::new(Id::from_prefix(&[1]), "a");
        let clone = handle.clone();
        assert!(clone.is_alive());
        handle.set_liveness(Liveness::Dead);
        assert_eq!(clone.liveness(), Liveness::Dead);
        assert!(!clone.is_alive());
    }

    #[test]
    fn equality_uses_identifier_only() {
        let a = NodeHandle::new(Id::from_prefix(&[1]), "a");
        let b = NodeHandle::new(Id::from_prefix(&[1]), "b");
        assert_eq!(a, b);
        assert!(!a.same_endpoint(&b));
        assert!(!a.ptr_eq(&b));
    }

    #[test]
    fn cache_coalesces_same_endpoint_only() {
        let mut cache = HandleCache::new(4);
        let original = NodeHandle::new(Id::from_prefix(&[1]), "a");
        let canonical = cache.coalesce(original.clone());
        assert!(canonical.ptr_eq(&original));

        let decoded = NodeHandle::new(Id::from_prefix(&[1]), "a");
        assert!(cache.coalesce(decoded).ptr_eq(&original));

        let impostor = NodeHandle::new(Id::from_prefix(&[1]), "elsewhere");
        let returned = cache.coalesce(impostor.clone());
        assert!(returned.ptr_eq(&impostor));
        assert!(cache.get(&original.id()).expect("cached").ptr_eq(&original));
    }

    #[test]
    fn proximity_defaults_to_unknown() {
        let handle = NodeHandle::new(Id::ZERO, "z");
        assert_eq!(handle.proximity(), None);
        handle.set_proximity(12);
        assert_eq!(handle.proximity(), Some(12));
    }
}
