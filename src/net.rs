//! In-process network for running whole rings inside one process.
//!
//! [`DirectNetwork`] implements [`OverlayNetwork`] by handing each frame
//! straight to the destination node's [`receive`](PastryNode::receive). Nodes
//! are placed on a plane and proximity is their Euclidean distance, which
//! gives nearest-node discovery something to optimise. Nodes can be killed and
//! revived to exercise failure handling, and every frame sent is counted by
//! kind.
//!
//! Frames still go through the binary codec, and leaf-set and row queries are
//! encoded and decoded too, so each node ends up with its own handle records
//! exactly as it would over a socket.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use rand::Rng;
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tracing::{trace, warn};

use crate::config::OverlayConfig;
use crate::error::OverlayError;
use crate::handle::{Liveness, NodeHandle};
use crate::id::Id;
use crate::join::JoinState;
use crate::leaf_set::LeafSetSnapshot;
use crate::node::{OverlayNetwork, PastryNode};
use crate::protocol::OverlayMessage;
use crate::routing_table::RouteRow;
use crate::wire::{Decode, Encode};

/// A node running over the in-process network.
pub type DirectNode = PastryNode<DirectNetwork>;

/// Side length of the square nodes are placed in by [`Position::random`].
pub const PLANE_SIZE: f64 = 1000.0;

/// A point on the simulated plane.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

impl Position {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// A uniformly random point on the plane.
    pub fn random<R: Rng + ?Sized>(rng: &mut R) -> Self {
        Self {
            x: rng.gen_range(0.0..PLANE_SIZE),
            y: rng.gen_range(0.0..PLANE_SIZE),
        }
    }

    /// Proximity metric: Euclidean distance rounded up, at least 1 between
    /// distinct nodes.
    pub fn proximity(&self, other: &Position) -> u32 {
        let d = ((self.x - other.x).powi(2) + (self.y - other.y).powi(2)).sqrt();
        (d.ceil() as u32).max(1)
    }
}

struct Peer {
    node: Weak<DirectNode>,
    position: Position,
    alive: bool,
}

/// Shared directory of every node on one simulated network.
#[derive(Default)]
pub struct DirectRegistry {
    peers: RwLock<HashMap<String, Peer>>,
    sent: Mutex<HashMap<&'static str, u64>>,
}

impl DirectRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Create a node at `position` and register it. The node is idle; call
    /// [`create_ring`](PastryNode::create_ring) or [`join`](PastryNode::join).
    pub async fn add_node(
        self: &Arc<Self>,
        id: Id,
        address: impl Into<String>,
        position: Position,
        config: OverlayConfig,
    ) -> crate::error::Result<Arc<DirectNode>> {
        let address = address.into();
        let network = DirectNetwork {
            registry: self.clone(),
            address: address.clone(),
        };
        let node = Arc::new(PastryNode::new(id, address.clone(), config, network)?);
        let mut peers = self.peers.write().await;
        peers.insert(
            address,
            Peer {
                node: Arc::downgrade(&node),
                position,
                alive: true,
            },
        );
        Ok(node)
    }

    /// Make a node unreachable. Its state is kept so it can be revived.
    pub async fn kill(&self, address: &str) -> bool {
        self.set_alive(address, false).await
    }

    pub async fn revive(&self, address: &str) -> bool {
        self.set_alive(address, true).await
    }

    async fn set_alive(&self, address: &str, alive: bool) -> bool {
        let mut peers = self.peers.write().await;
        match peers.get_mut(address) {
            Some(peer) => {
                peer.alive = alive;
                true
            }
            None => false,
        }
    }

    pub async fn is_alive(&self, address: &str) -> bool {
        let peers = self.peers.read().await;
        peers.get(address).is_some_and(|p| p.alive)
    }

    pub async fn position(&self, address: &str) -> Option<Position> {
        let peers = self.peers.read().await;
        peers.get(address).map(|p| p.position)
    }

    /// The node registered at `address`, if it still exists.
    pub async fn node(&self, address: &str) -> Option<Arc<DirectNode>> {
        let peers = self.peers.read().await;
        peers.get(address).and_then(|p| p.node.upgrade())
    }

    /// Frames sent so far with the given kind name (see
    /// [`OverlayMessage::kind_name`]).
    pub async fn frames_sent(&self, kind: &str) -> u64 {
        let sent = self.sent.lock().await;
        sent.get(kind).copied().unwrap_or(0)
    }

    pub async fn total_frames_sent(&self) -> u64 {
        let sent = self.sent.lock().await;
        sent.values().sum()
    }

    pub async fn reset_counters(&self) {
        self.sent.lock().await.clear();
    }

    async fn count(&self, kind: &'static str) {
        let mut sent = self.sent.lock().await;
        *sent.entry(kind).or_insert(0) += 1;
    }

    /// A live, not destroyed node at `address`.
    async fn reachable(&self, address: &str) -> Option<Arc<DirectNode>> {
        let node = {
            let peers = self.peers.read().await;
            let peer = peers.get(address).filter(|p| p.alive)?;
            peer.node.upgrade()?
        };
        if node.join_state().await == JoinState::Destroyed {
            return None;
        }
        Some(node)
    }
}

/// One node's view of the in-process network.
#[derive(Clone)]
pub struct DirectNetwork {
    registry: Arc<DirectRegistry>,
    address: String,
}

impl DirectNetwork {
    pub fn registry(&self) -> &Arc<DirectRegistry> {
        &self.registry
    }

    /// Resolve `to`, marking it dead if it cannot be reached.
    async fn resolve(&self, to: &NodeHandle) -> Result<Arc<DirectNode>> {
        match self.registry.reachable(to.address()).await {
            Some(node) => Ok(node),
            None => {
                to.set_liveness(Liveness::Dead);
                Err(anyhow!("{to} is unreachable"))
            }
        }
    }
}

#[async_trait]
impl OverlayNetwork for DirectNetwork {
    async fn send(&self, to: &NodeHandle, frame: Vec<u8>) -> Result<()> {
        let kind = OverlayMessage::peek_kind(&frame).unwrap_or("unknown");
        self.registry.count(kind).await;
        let node = self.resolve(to).await?;
        trace!(from = %self.address, to = %to.address(), kind, bytes = frame.len(), "direct send");
        match node.receive(&frame).await {
            Ok(()) => {}
            Err(OverlayError::NotReady) => {
                to.set_liveness(Liveness::Dead);
                bail!("{to} has been destroyed");
            }
            Err(err) => {
                warn!(from = %self.address, to = %to.address(), kind, "peer failed to process frame: {err}");
            }
        }
        if to.liveness() != Liveness::Alive {
            to.set_liveness(Liveness::Alive);
        }
        Ok(())
    }

    async fn leaf_set(&self, of: &NodeHandle) -> Result<LeafSetSnapshot> {
        let node = self.resolve(of).await?;
        let bytes = node.leaf_set_snapshot().await.encode_to_vec()?;
        Ok(LeafSetSnapshot::decode_from_slice(&bytes)?)
    }

    async fn route_row(&self, of: &NodeHandle, row: usize) -> Result<RouteRow> {
        let node = self.resolve(of).await?;
        let bytes = node.route_row(row).await.encode_to_vec()?;
        Ok(RouteRow::decode_from_slice(&bytes)?)
    }

    async fn proximity(&self, to: &NodeHandle) -> Result<u32> {
        if to.address() == self.address {
            return Ok(0);
        }
        self.resolve(to).await?;
        let (from, at) = {
            let peers = self.registry.peers.read().await;
            let from = peers.get(&self.address).map(|p| p.position);
            let at = peers.get(to.address()).map(|p| p.position);
            (from, at)
        };
        let (Some(from), Some(at)) = (from, at) else {
            bail!("no position for {to}");
        };
        let proximity = from.proximity(&at);
        to.set_proximity(proximity);
        Ok(proximity)
    }
}
