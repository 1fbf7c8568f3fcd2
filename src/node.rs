//! The overlay node.
//!
//! A [`PastryNode`] owns one node's membership state (routing table, leaf set,
//! handle cache and join state) behind a single async mutex. Each incoming
//! frame takes the lock once, decides everything it needs on a consistent
//! view of that state, releases it, and only then talks to the network. The
//! node is generic over the transport so the same state machine runs over the
//! in-process [`DirectNetwork`](crate::net::DirectNetwork) or a real socket
//! layer.
//!
//! # Key Methods
//!
//! * [`create_ring`](PastryNode::create_ring) / [`join`](PastryNode::join) - become a ring member
//! * [`route`](PastryNode::route) - send an application message to the root of a key
//! * [`receive`](PastryNode::receive) - feed a frame that arrived from the transport
//! * [`leaf_set_snapshot`](PastryNode::leaf_set_snapshot) / [`route_row`](PastryNode::route_row) - answer remote state queries

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use iroh_blake3::Hasher;
use serde::Serialize;
use tokio::sync::{watch, Mutex, RwLock};
use tracing::{debug, trace, warn};

use crate::config::OverlayConfig;
use crate::error::{OverlayError, Result};
use crate::handle::{HandleCache, Liveness, NodeHandle};
use crate::id::{closeness_cmp, Id, IdRange};
use crate::join::JoinState;
use crate::leaf_set::{LeafSet, LeafSetSnapshot};
use crate::message::{AppMessage, RouteMessage};
use crate::protocol::{
    BroadcastLeafSet, BroadcastRouteRow, JoinRequest, LeafSetKind, OverlayMessage, JOIN_ADDRESS,
};
use crate::router::{RouteDecision, Router};
use crate::routing_table::{RouteRow, RoutingTable};
use crate::wire::{Decode, Encode};

// ─────────────────────────────────────────────────────────────────────────────
// Collaborator Traits
// ─────────────────────────────────────────────────────────────────────────────

/// Transport abstraction for overlay traffic.
///
/// Implementations own liveness and proximity: they are the only writers of
/// [`NodeHandle::set_liveness`] and [`NodeHandle::set_proximity`]. A failed
/// [`send`](Self::send) must have updated the handle's liveness before it
/// returns, so the node's next routing decision sees the failure.
#[async_trait]
pub trait OverlayNetwork: Send + Sync + 'static {
    /// Deliver an encoded [`OverlayMessage`] frame to `to`.
    async fn send(&self, to: &NodeHandle, frame: Vec<u8>) -> anyhow::Result<()>;

    /// Fetch the current leaf set of a remote node.
    async fn leaf_set(&self, of: &NodeHandle) -> anyhow::Result<LeafSetSnapshot>;

    /// Fetch one routing-table row of a remote node.
    async fn route_row(&self, of: &NodeHandle, row: usize) -> anyhow::Result<RouteRow>;

    /// Measure proximity to `to`; lower is nearer, 0 is the local node.
    async fn proximity(&self, to: &NodeHandle) -> anyhow::Result<u32>;
}

/// An application running on top of the overlay.
///
/// Upcalls run on the task that processed the frame, outside the node's
/// state lock; they must not block.
pub trait Application: Send + Sync + 'static {
    /// A message for `target` arrived at its root.
    fn deliver(&self, target: &Id, message: AppMessage);

    /// A message is about to be forwarded. Return false to swallow it. The
    /// message may be modified; changing its target re-routes it.
    fn forward(&self, message: &mut RouteMessage) -> bool {
        let _ = message;
        true
    }

    /// A node entered (`joined`) or left the local leaf set.
    fn leaf_set_changed(&self, handle: &NodeHandle, joined: bool) {
        let _ = (handle, joined);
    }
}

/// Derive a stable application address from a name.
///
/// Addresses are non-negative; negative values are reserved for the overlay.
pub fn application_address(name: &str) -> i32 {
    let mut hasher = Hasher::new();
    hasher.update(name.as_bytes());
    let digest = hasher.finalize();
    let bytes = digest.as_bytes();
    let raw = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    (raw & 0x7fff_ffff) as i32
}

// ─────────────────────────────────────────────────────────────────────────────
// Telemetry and Diagnostics
// ─────────────────────────────────────────────────────────────────────────────

/// Snapshot of a node's state for telemetry and debugging.
#[derive(Clone, Debug, Default, Serialize)]
pub struct TelemetrySnapshot {
    /// Full hex identifier.
    pub id: String,
    /// Join state name.
    pub join_state: &'static str,
    /// Clockwise leaf-set half size.
    pub leaf_set_cw: usize,
    /// Counterclockwise leaf-set half size.
    pub leaf_set_ccw: usize,
    /// Whether the leaf set covers the whole ring.
    pub leaf_set_overlaps: bool,
    /// Handles stored in the routing table.
    pub routing_table_entries: usize,
    /// Routing-table rows with at least one populated cell.
    pub routing_table_rows: usize,
    /// Messages delivered to local applications.
    pub delivered: u64,
    /// Messages forwarded to another node.
    pub forwarded: u64,
    /// Messages dropped to protect a lease.
    pub dropped: u64,
    /// Row repairs sent to previous hops.
    pub repairs_sent: u64,
    /// Next hops re-resolved after a failed send.
    pub reroutes: u64,
}

#[derive(Debug, Default)]
pub(crate) struct NodeStats {
    pub(crate) delivered: u64,
    pub(crate) forwarded: u64,
    pub(crate) dropped: u64,
    pub(crate) repairs_sent: u64,
    pub(crate) reroutes: u64,
}

// ─────────────────────────────────────────────────────────────────────────────
// Node State
// ─────────────────────────────────────────────────────────────────────────────

/// Everything guarded by the node's lock.
pub(crate) struct NodeState {
    pub(crate) local: NodeHandle,
    pub(crate) routing_table: RoutingTable,
    pub(crate) leaf_set: LeafSet,
    pub(crate) handles: HandleCache,
    pub(crate) join_state: JoinState,
    pub(crate) stats: NodeStats,
}

/// Handles that entered and left the leaf set during one operation.
#[derive(Default)]
pub(crate) struct LeafSetDelta {
    added: Vec<NodeHandle>,
    removed: Vec<NodeHandle>,
}

pub(crate) type Outbound = Vec<(NodeHandle, OverlayMessage)>;

impl NodeState {
    fn new(local: NodeHandle, config: &OverlayConfig) -> Self {
        let mut handles = HandleCache::new(config.handle_cache_capacity);
        handles.insert(local.clone());
        Self {
            routing_table: RoutingTable::new(
                local.clone(),
                config.base_bit_length as usize,
                config.route_set_max,
            ),
            leaf_set: LeafSet::new(local.clone(), config.leaf_set_size),
            handles,
            join_state: JoinState::Idle,
            stats: NodeStats::default(),
            local,
        }
    }

    /// Map a handle to this node's canonical record for the same endpoint.
    pub(crate) fn coalesce(&mut self, handle: NodeHandle) -> NodeHandle {
        if self.local.same_endpoint(&handle) {
            return self.local.clone();
        }
        let id = handle.id();
        if let Some(existing) = self.leaf_set.find(&id) {
            if existing.same_endpoint(&handle) {
                return existing.clone();
            }
        }
        if let Some(existing) = self.routing_table.find(&id) {
            if existing.same_endpoint(&handle) {
                return existing;
            }
        }
        self.handles.coalesce(handle)
    }

    fn coalesce_message(&mut self, message: &mut OverlayMessage) {
        for slot in message.handles_mut() {
            *slot = self.coalesce(slot.clone());
        }
    }

    /// Find the canonical handle for `id` among the known nodes.
    fn lookup(&mut self, id: &Id) -> Option<NodeHandle> {
        if let Some(h) = self.leaf_set.find(id) {
            return Some(h.clone());
        }
        self.routing_table
            .find(id)
            .or_else(|| self.handles.get(id))
    }

    pub(crate) fn leaf_members(&self) -> Vec<NodeHandle> {
        self.leaf_set.members().cloned().collect()
    }

    pub(crate) fn leaf_delta(&self, before: &[NodeHandle]) -> LeafSetDelta {
        let after = self.leaf_members();
        LeafSetDelta {
            added: after
                .iter()
                .filter(|h| !before.iter().any(|b| b.id() == h.id()))
                .cloned()
                .collect(),
            removed: before
                .iter()
                .filter(|b| !after.iter().any(|h| h.id() == b.id()))
                .cloned()
                .collect(),
        }
    }

    /// Insert a live handle into both membership structures.
    fn learn(&mut self, handle: &NodeHandle) {
        if handle.is_alive() && handle.id() != self.local.id() {
            self.routing_table.put(handle.clone());
            self.leaf_set.put(handle.clone());
        }
    }

    /// Merge a remote leaf set and work out the replies the broadcast calls for.
    pub(crate) fn apply_leaf_set(&mut self, bls: &BroadcastLeafSet) -> Outbound {
        let remote = &bls.leaf_set;
        self.leaf_set.merge(remote, &bls.from);
        for handle in std::iter::once(&bls.from)
            .chain(std::iter::once(remote.base()))
            .chain(remote.members())
        {
            if handle.is_alive() && handle.id() != self.local.id() {
                self.routing_table.put(handle.clone());
            }
        }

        let mut replies = Outbound::new();
        match bls.kind {
            LeafSetKind::JoinInitial => {
                let snapshot = self.leaf_set.snapshot();
                for member in self.leaf_set.members() {
                    replies.push((
                        member.clone(),
                        OverlayMessage::LeafSet(BroadcastLeafSet {
                            from: self.local.clone(),
                            leaf_set: snapshot.clone(),
                            kind: LeafSetKind::JoinAdvertise,
                            hop_count: 0,
                        }),
                    ));
                }
            }
            LeafSetKind::JoinAdvertise | LeafSetKind::Update => {
                if bls.from.id() != self.local.id() && self.remote_is_missing(remote) {
                    debug!(peer = %bls.from.id(), "sending leaf set correction");
                    replies.push((
                        bls.from.clone(),
                        OverlayMessage::LeafSet(BroadcastLeafSet {
                            from: self.local.clone(),
                            leaf_set: self.leaf_set.snapshot(),
                            kind: LeafSetKind::Correction,
                            hop_count: bls.hop_count.saturating_add(1),
                        }),
                    ));
                }
            }
            LeafSetKind::Correction => {}
        }
        replies
    }

    /// Returns true if merging our leaf set into `remote` would change it.
    fn remote_is_missing(&self, remote: &LeafSetSnapshot) -> bool {
        let mut theirs = LeafSet::from_snapshot(remote);
        !theirs.merge(&self.leaf_set.snapshot(), &self.local).is_empty()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Routing Steps
// ─────────────────────────────────────────────────────────────────────────────

/// What the node does with a route message after one decision.
pub(crate) enum Action {
    Deliver,
    Forward(NodeHandle),
    Reply(NodeHandle, Box<JoinRequest>),
    Drop,
}

pub(crate) struct Step {
    pub(crate) action: Action,
    pub(crate) repair: Option<(NodeHandle, BroadcastRouteRow)>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Pastry Node
// ─────────────────────────────────────────────────────────────────────────────

/// One member of a prefix-routing overlay ring.
pub struct PastryNode<N: OverlayNetwork> {
    pub(crate) local: NodeHandle,
    pub(crate) config: OverlayConfig,
    pub(crate) network: Arc<N>,
    pub(crate) state: Arc<Mutex<NodeState>>,
    apps: Arc<RwLock<HashMap<i32, Arc<dyn Application>>>>,
    pub(crate) join_watch: watch::Sender<JoinState>,
}

impl<N: OverlayNetwork> PastryNode<N> {
    /// Create a node with identifier `id` reachable at `address`.
    ///
    /// The node is idle until [`create_ring`](Self::create_ring) or
    /// [`join`](Self::join) succeeds.
    pub fn new(
        id: Id,
        address: impl Into<String>,
        config: OverlayConfig,
        network: N,
    ) -> Result<Self> {
        config.validate()?;
        let local = NodeHandle::new(id, address);
        local.set_proximity(0);
        let state = NodeState::new(local.clone(), &config);
        let (join_watch, _) = watch::channel(JoinState::Idle);
        Ok(Self {
            local,
            config,
            network: Arc::new(network),
            state: Arc::new(Mutex::new(state)),
            apps: Arc::new(RwLock::new(HashMap::new())),
            join_watch,
        })
    }

    /// The local node's handle.
    pub fn local_handle(&self) -> &NodeHandle {
        &self.local
    }

    pub fn id(&self) -> Id {
        self.local.id()
    }

    pub fn config(&self) -> &OverlayConfig {
        &self.config
    }

    pub fn network(&self) -> &N {
        &self.network
    }

    /// Register `app` to receive messages sent to `address`.
    pub async fn register_application(&self, address: i32, app: Arc<dyn Application>) {
        let mut apps = self.apps.write().await;
        apps.insert(address, app);
    }

    /// Route `message` to the root of `key`, for the application at `address`.
    ///
    /// `hint` pre-selects the first hop; it is used once and ignored if it is
    /// dead or the send fails.
    pub async fn route(
        &self,
        key: Id,
        address: i32,
        message: AppMessage,
        hint: Option<NodeHandle>,
    ) -> Result<()> {
        let mut msg = RouteMessage::new(key, address, message, self.config.route_message_version);
        self.originate(&mut msg, hint).await?;
        self.handle_route(msg).await
    }

    /// Send `message` to one specific node, for the application at `address`.
    pub async fn route_to_handle(
        &self,
        destination: NodeHandle,
        address: i32,
        message: AppMessage,
    ) -> Result<()> {
        let mut msg = RouteMessage::to_handle(
            destination.clone(),
            address,
            message,
            self.config.route_message_version,
        );
        self.originate(&mut msg, Some(destination)).await?;
        self.handle_route(msg).await
    }

    async fn originate(&self, msg: &mut RouteMessage, hint: Option<NodeHandle>) -> Result<()> {
        let mut state = self.state.lock().await;
        if !state.join_state.is_ready() {
            return Err(OverlayError::NotReady);
        }
        let hint = hint.map(|h| state.coalesce(h));
        msg.set_next_hop(hint);
        Ok(())
    }

    /// Process a frame received from the transport.
    pub async fn receive(&self, frame: &[u8]) -> Result<()> {
        let mut message = OverlayMessage::decode_from_slice(frame)?;
        {
            let mut state = self.state.lock().await;
            if state.join_state == JoinState::Destroyed {
                return Err(OverlayError::NotReady);
            }
            state.coalesce_message(&mut message);
        }
        trace!(node = %self.local.id(), kind = message.kind_name(), "received frame");
        match message {
            OverlayMessage::Route(msg) => self.handle_route(msg).await,
            OverlayMessage::JoinReply(req) => self.handle_join_reply(req).await,
            OverlayMessage::LeafSet(bls) => self.handle_leaf_set(bls).await,
            OverlayMessage::RouteRow(brr) => {
                self.handle_route_row(brr).await;
                Ok(())
            }
        }
    }

    /// Route a message hop by hop until it is delivered, forwarded or dropped.
    async fn handle_route(&self, mut msg: RouteMessage) -> Result<()> {
        let is_join = msg.aux_address() == JOIN_ADDRESS;
        let mut failures = 0u32;
        loop {
            let step = {
                let mut state = self.state.lock().await;
                self.route_step(&mut state, &mut msg, is_join)?
            };
            if let Some((to, brr)) = step.repair {
                self.spawn_send(to, OverlayMessage::RouteRow(brr));
            }

            let next_hop = match step.action {
                Action::Drop => return Ok(()),
                Action::Deliver => return self.deliver_local(msg).await,
                Action::Reply(joiner, req) => {
                    debug!(joiner = %joiner.id(), "accepting join request");
                    self.send_message(&joiner, OverlayMessage::JoinReply(*req))
                        .await;
                    return Ok(());
                }
                Action::Forward(next_hop) => next_hop,
            };

            if !is_join {
                let target = msg.target();
                if !self.forward_upcall(&mut msg).await {
                    trace!(target = %target, "application swallowed message");
                    return Ok(());
                }
                if msg.target() != target {
                    continue;
                }
            }

            msg.set_prev_node(self.local.clone());
            let frame = OverlayMessage::Route(msg.clone()).encode_to_vec()?;
            match self.network.send(&next_hop, frame).await {
                Ok(()) => {
                    self.state.lock().await.stats.forwarded += 1;
                    return Ok(());
                }
                Err(err) => {
                    failures += 1;
                    let reroute = msg.options().reroute_if_suspected;
                    if !reroute || failures > self.config.max_reroute_attempts {
                        warn!(
                            next = %next_hop.id(),
                            target = %msg.target(),
                            "giving up on message after failed send: {err:#}"
                        );
                        return Ok(());
                    }
                    debug!(next = %next_hop.id(), "send failed, rerouting: {err:#}");
                    self.state.lock().await.stats.reroutes += 1;
                }
            }
        }
    }

    /// One routing decision under the state lock.
    fn route_step(
        &self,
        state: &mut NodeState,
        msg: &mut RouteMessage,
        is_join: bool,
    ) -> Result<Step> {
        if !is_join {
            if let Some(prev) = msg.prev_node() {
                if prev.is_alive() && prev.id() != self.local.id() {
                    state.routing_table.put(prev.clone());
                }
            }
        }

        if let Some(hop) = msg.take_next_hop() {
            if hop.id() == self.local.id() {
                return Ok(Step {
                    action: Action::Deliver,
                    repair: None,
                });
            }
            if hop.is_alive() {
                return Ok(Step {
                    action: Action::Forward(hop),
                    repair: None,
                });
            }
        }

        let target = msg.target();
        let routed = Router::new(&mut state.routing_table, &state.leaf_set)
            .route(&target, msg.prev_node());
        if routed.repair.is_some() {
            state.stats.repairs_sent += 1;
        }
        let action = match routed.decision {
            RouteDecision::Drop { .. } => {
                state.stats.dropped += 1;
                Action::Drop
            }
            RouteDecision::Deliver if is_join => self.accept_join(state, msg)?,
            RouteDecision::Deliver => Action::Deliver,
            RouteDecision::Forward {
                next_hop,
                reroute_if_suspected,
            } => {
                msg.options_mut().reroute_if_suspected = reroute_if_suspected;
                if is_join {
                    self.harvest_rows(state, msg)?;
                }
                Action::Forward(next_hop)
            }
        };
        Ok(Step {
            action,
            repair: routed.repair,
        })
    }

    async fn deliver_local(&self, msg: RouteMessage) -> Result<()> {
        {
            let mut state = self.state.lock().await;
            if !state.join_state.is_ready() {
                debug!(target = %msg.target(), "dropping message: node not ready");
                return Ok(());
            }
            state.stats.delivered += 1;
        }
        let app = {
            let apps = self.apps.read().await;
            apps.get(&msg.aux_address()).cloned()
        };
        match app {
            Some(app) => {
                let message = msg.app_message()?;
                app.deliver(&msg.target(), message);
            }
            None => warn!(
                address = msg.aux_address(),
                target = %msg.target(),
                "no application registered for delivered message"
            ),
        }
        Ok(())
    }

    async fn forward_upcall(&self, msg: &mut RouteMessage) -> bool {
        let app = {
            let apps = self.apps.read().await;
            apps.get(&msg.aux_address()).cloned()
        };
        app.map(|app| app.forward(msg)).unwrap_or(true)
    }

    async fn handle_leaf_set(&self, bls: BroadcastLeafSet) -> Result<()> {
        let (delta, replies) = {
            let mut state = self.state.lock().await;
            let before = state.leaf_members();
            let replies = state.apply_leaf_set(&bls);
            (state.leaf_delta(&before), replies)
        };
        trace!(from = %bls.from.id(), kind = ?bls.kind, "applied leaf set broadcast");
        self.notify_leaf_set(delta).await;
        self.dispatch(replies).await;
        Ok(())
    }

    async fn handle_route_row(&self, brr: BroadcastRouteRow) {
        let mut state = self.state.lock().await;
        if brr.from.is_alive() && brr.from.id() != self.local.id() {
            state.routing_table.put(brr.from.clone());
        }
        for handle in brr.row.handles() {
            if handle.is_alive() && handle.id() != self.local.id() {
                state.routing_table.put(handle.clone());
            }
        }
        trace!(from = %brr.from.id(), row = brr.row.index(), "applied route row");
    }

    // ─────────────────────────────────────────────────────────────────────
    // Outbound
    // ─────────────────────────────────────────────────────────────────────

    /// Encode and send one message, logging failures.
    pub(crate) async fn send_message(&self, to: &NodeHandle, message: OverlayMessage) -> bool {
        let kind = message.kind_name();
        let frame = match message.encode_to_vec() {
            Ok(frame) => frame,
            Err(err) => {
                warn!(peer = %to.id(), kind, "failed to encode message: {err}");
                return false;
            }
        };
        match self.network.send(to, frame).await {
            Ok(()) => true,
            Err(err) => {
                debug!(peer = %to.id(), kind, "send failed: {err:#}");
                false
            }
        }
    }

    pub(crate) async fn dispatch(&self, outbound: Outbound) {
        for (to, message) in outbound {
            self.send_message(&to, message).await;
        }
    }

    /// Send in the background; used for best-effort repairs.
    fn spawn_send(&self, to: NodeHandle, message: OverlayMessage) {
        let network = self.network.clone();
        tokio::spawn(async move {
            let frame = match message.encode_to_vec() {
                Ok(frame) => frame,
                Err(err) => {
                    warn!(peer = %to.id(), "failed to encode repair: {err}");
                    return;
                }
            };
            if let Err(err) = network.send(&to, frame).await {
                debug!(peer = %to.id(), "repair send failed: {err:#}");
            }
        });
    }

    pub(crate) async fn notify_leaf_set(&self, delta: LeafSetDelta) {
        if delta.added.is_empty() && delta.removed.is_empty() {
            return;
        }
        let apps: Vec<Arc<dyn Application>> = {
            let apps = self.apps.read().await;
            apps.values().cloned().collect()
        };
        for app in &apps {
            for handle in &delta.added {
                app.leaf_set_changed(handle, true);
            }
            for handle in &delta.removed {
                app.leaf_set_changed(handle, false);
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Membership Maintenance
    // ─────────────────────────────────────────────────────────────────────

    /// Forget the node with identifier `id`, e.g. when its lease expires.
    pub async fn remove_handle(&self, id: &Id) -> bool {
        let (removed, delta) = {
            let mut state = self.state.lock().await;
            let before = state.leaf_members();
            let from_leaf_set = state.leaf_set.remove(id).is_some();
            let from_table = state.routing_table.remove(id).is_some();
            (from_leaf_set || from_table, state.leaf_delta(&before))
        };
        if removed {
            debug!(peer = %id, "removed handle");
        }
        self.notify_leaf_set(delta).await;
        removed
    }

    /// Record a liveness observation for a known node.
    ///
    /// Returns false if the node is unknown. Meant for the transport layer.
    pub async fn update_liveness(&self, id: &Id, liveness: Liveness) -> bool {
        let mut state = self.state.lock().await;
        match state.lookup(id) {
            Some(handle) => {
                handle.set_liveness(liveness);
                true
            }
            None => false,
        }
    }

    /// Insert a handle learned out of band into the membership structures.
    pub async fn observe_handle(&self, handle: NodeHandle) {
        let delta = {
            let mut state = self.state.lock().await;
            let before = state.leaf_members();
            let handle = state.coalesce(handle);
            state.learn(&handle);
            state.leaf_delta(&before)
        };
        self.notify_leaf_set(delta).await;
    }

    // ─────────────────────────────────────────────────────────────────────
    // Local Queries
    // ─────────────────────────────────────────────────────────────────────

    /// Returns true once the node has joined a ring.
    pub async fn is_ready(&self) -> bool {
        self.state.lock().await.join_state.is_ready()
    }

    pub async fn join_state(&self) -> JoinState {
        self.state.lock().await.join_state.clone()
    }

    /// Watch join state transitions.
    pub fn subscribe(&self) -> watch::Receiver<JoinState> {
        self.join_watch.subscribe()
    }

    /// Up to `num` live nodes the local node knows that are closest to `key`,
    /// nearest first. The local node is included when it qualifies.
    pub async fn local_lookup(&self, key: &Id, num: usize) -> Vec<NodeHandle> {
        let state = self.state.lock().await;
        let mut candidates: Vec<NodeHandle> = std::iter::once(&self.local)
            .chain(state.leaf_set.members())
            .chain(state.routing_table.handles())
            .filter(|h| h.is_alive())
            .cloned()
            .collect();
        candidates.sort_by(|a, b| closeness_cmp(key, &a.id(), &b.id()));
        candidates.dedup_by(|a, b| a.id() == b.id());
        candidates.truncate(num);
        candidates
    }

    /// The local node and up to `num - 1` leaf-set neighbours, nearest first.
    pub async fn neighbor_set(&self, num: usize) -> Vec<NodeHandle> {
        self.state.lock().await.leaf_set.neighbor_set(num)
    }

    /// The `max_rank` nodes that should hold replicas of `key`.
    pub async fn replica_set(&self, key: &Id, max_rank: usize) -> Vec<NodeHandle> {
        self.state.lock().await.leaf_set.replica_set(key, max_rank)
    }

    /// Keys for which `handle` is among the `rank + 1` closest nodes, or only
    /// the strip on one side when `clockwise` is given.
    pub async fn range(
        &self,
        handle: &NodeHandle,
        rank: usize,
        clockwise: Option<bool>,
    ) -> Option<IdRange> {
        let state = self.state.lock().await;
        match clockwise {
            None => state.leaf_set.range(handle, rank),
            Some(cw) => state.leaf_set.range_directional(handle, rank, cw),
        }
    }

    /// Current leaf set, as served to remote queries.
    pub async fn leaf_set_snapshot(&self) -> LeafSetSnapshot {
        self.state.lock().await.leaf_set.snapshot()
    }

    /// One routing-table row, as served to remote queries.
    pub async fn route_row(&self, row: usize) -> RouteRow {
        self.state.lock().await.routing_table.get_row(row)
    }

    /// Ids of every handle in the routing table.
    pub async fn routing_table_ids(&self) -> Vec<Id> {
        let state = self.state.lock().await;
        state.routing_table.handles().map(NodeHandle::id).collect()
    }

    /// Ids of the leaf set members, clockwise half first.
    pub async fn leaf_set_ids(&self) -> Vec<Id> {
        let state = self.state.lock().await;
        state.leaf_set.members().map(NodeHandle::id).collect()
    }

    /// Capture current state for telemetry and debugging.
    pub async fn telemetry_snapshot(&self) -> TelemetrySnapshot {
        let state = self.state.lock().await;
        TelemetrySnapshot {
            id: self.local.id().to_hex(),
            join_state: state.join_state.name(),
            leaf_set_cw: state.leaf_set.cw_size(),
            leaf_set_ccw: state.leaf_set.ccw_size(),
            leaf_set_overlaps: state.leaf_set.overlaps(),
            routing_table_entries: state.routing_table.size(),
            routing_table_rows: state
                .routing_table
                .row_occupancy()
                .iter()
                .filter(|n| **n > 0)
                .count(),
            delivered: state.stats.delivered,
            forwarded: state.stats.forwarded,
            dropped: state.stats.dropped,
            repairs_sent: state.stats.repairs_sent,
            reroutes: state.stats.reroutes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn application_addresses_are_stable_and_non_negative() {
        let a = application_address("kv-store");
        assert_eq!(a, application_address("kv-store"));
        assert!(a >= 0);
        assert_ne!(a, application_address("chat"));
    }
}
