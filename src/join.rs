//! Ring membership: creating a ring, joining one, and leaving it.
//!
//! A joining node routes a [`JoinRequest`] toward its own identifier through
//! a bootstrap node. Every node on the path pushes the routing-table rows the
//! joiner shares with it; the node where the request terminates adds its own
//! rows, attaches its leaf set, and replies directly. The joiner then seeds its
//! tables from the reply, announces itself to the nodes it learned about, and
//! becomes ready.

use tokio::time::sleep;
use tracing::{debug, info, trace, warn};

use crate::error::{JoinError, OverlayError, Result};
use crate::handle::NodeHandle;
use crate::message::{AppMessage, RouteMessage, PRIORITY_HIGH};
use crate::node::{Action, NodeState, OverlayNetwork, Outbound, PastryNode};
use crate::protocol::{
    BroadcastLeafSet, BroadcastRouteRow, JoinRequest, LeafSetKind, OverlayMessage, JOIN_ADDRESS,
};

/// Lifecycle of a node's ring membership.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum JoinState {
    /// Not yet part of a ring.
    Idle,
    /// A join request is outstanding.
    Requesting {
        /// 1-based attempt number.
        attempt: u32,
    },
    /// Member of a ring; routes and delivers messages.
    Ready,
    /// The join failed for good.
    Failed(JoinError),
    /// The node was shut down.
    Destroyed,
}

impl JoinState {
    pub fn is_ready(&self) -> bool {
        matches!(self, JoinState::Ready)
    }

    /// Short name for logs and telemetry.
    pub fn name(&self) -> &'static str {
        match self {
            JoinState::Idle => "idle",
            JoinState::Requesting { .. } => "requesting",
            JoinState::Ready => "ready",
            JoinState::Failed(_) => "failed",
            JoinState::Destroyed => "destroyed",
        }
    }
}

impl<N: OverlayNetwork> PastryNode<N> {
    /// Start a new ring with the local node as its only member.
    pub async fn create_ring(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        match state.join_state {
            JoinState::Ready => return Err(JoinError::AlreadyJoined.into()),
            JoinState::Destroyed => return Err(JoinError::Destroyed.into()),
            _ => {}
        }
        self.publish(&mut state, JoinState::Ready);
        info!(node = %self.local.id(), "created ring");
        Ok(())
    }

    /// Join the ring reachable through `bootstraps`.
    ///
    /// Each attempt sends one join request through the next live bootstrap
    /// and waits up to the configured timeout for an accepted reply. Resolves
    /// once the node is ready or the join has failed for good.
    pub async fn join(&self, bootstraps: &[NodeHandle]) -> Result<()> {
        let candidates: Vec<NodeHandle> = {
            let mut state = self.state.lock().await;
            match state.join_state {
                JoinState::Ready => return Err(JoinError::AlreadyJoined.into()),
                JoinState::Destroyed => return Err(JoinError::Destroyed.into()),
                _ => {}
            }
            bootstraps
                .iter()
                .filter(|b| !b.same_endpoint(&self.local))
                .map(|b| state.coalesce(b.clone()))
                .collect()
        };

        let mut watch = self.join_watch.subscribe();
        let attempts = self.config.join_attempts.max(1);
        for attempt in 1..=attempts {
            let live: Vec<&NodeHandle> = candidates.iter().filter(|b| b.is_alive()).collect();
            if live.is_empty() {
                return Err(self.fail_join(JoinError::NoLiveBootstrap).await);
            }
            let bootstrap = live[(attempt as usize - 1) % live.len()].clone();

            {
                let mut state = self.state.lock().await;
                match &state.join_state {
                    JoinState::Destroyed => return Err(JoinError::Destroyed.into()),
                    JoinState::Ready => return Ok(()),
                    _ => {}
                }
                self.publish(&mut state, JoinState::Requesting { attempt });
            }

            let request = JoinRequest::new(self.local.clone(), self.config.base_bit_length);
            let payload = AppMessage::from_payload(&request)?.with_priority(PRIORITY_HIGH);
            let mut msg = RouteMessage::new(
                self.local.id(),
                JOIN_ADDRESS,
                payload,
                self.config.route_message_version,
            );
            msg.options_mut().reroute_if_suspected = false;
            msg.set_prev_node(self.local.clone());

            info!(
                node = %self.local.id(),
                bootstrap = %bootstrap.id(),
                attempt,
                "sending join request"
            );
            if !self
                .send_message(&bootstrap, OverlayMessage::Route(msg))
                .await
            {
                continue;
            }

            let deadline = sleep(self.config.join_timeout());
            tokio::pin!(deadline);
            loop {
                let current = watch.borrow_and_update().clone();
                match current {
                    JoinState::Ready => return Ok(()),
                    JoinState::Failed(err) => return Err(err.into()),
                    JoinState::Destroyed => return Err(JoinError::Destroyed.into()),
                    JoinState::Idle | JoinState::Requesting { .. } => {}
                }
                tokio::select! {
                    _ = &mut deadline => break,
                    changed = watch.changed() => {
                        if changed.is_err() {
                            return Err(JoinError::Destroyed.into());
                        }
                    }
                }
            }
            debug!(node = %self.local.id(), attempt, "join attempt timed out");
        }

        Err(self.fail_join(JoinError::Timeout { attempts }).await)
    }

    /// Shut the node down. Further frames are rejected and a pending join
    /// resolves with [`JoinError::Destroyed`].
    pub async fn destroy(&self) {
        let mut state = self.state.lock().await;
        self.publish(&mut state, JoinState::Destroyed);
        info!(node = %self.local.id(), "node destroyed");
    }

    pub(crate) fn publish(&self, state: &mut NodeState, next: JoinState) {
        trace!(node = %self.local.id(), from = state.join_state.name(), to = next.name(), "join state");
        state.join_state = next.clone();
        self.join_watch.send_replace(next);
    }

    async fn fail_join(&self, err: JoinError) -> OverlayError {
        warn!(node = %self.local.id(), "join failed: {err}");
        let mut state = self.state.lock().await;
        if state.join_state != JoinState::Destroyed {
            self.publish(&mut state, JoinState::Failed(err.clone()));
        }
        err.into()
    }

    /// Push the rows this node shares with the joiner into a passing request.
    pub(crate) fn harvest_rows(&self, state: &mut NodeState, msg: &mut RouteMessage) -> Result<()> {
        let mut request: JoinRequest = msg.decode_payload()?;
        self.push_shared_rows(state, &mut request);
        msg.set_app_message(AppMessage::from_payload(&request)?.with_priority(PRIORITY_HIGH));
        Ok(())
    }

    /// Add rows `last_row - 1` down to the MSDD with the joiner, inclusive.
    fn push_shared_rows(&self, state: &NodeState, request: &mut JoinRequest) {
        let joiner = request.joiner().id();
        let base_bits = state.routing_table.base_bits();
        let Some(msdd) = self.local.id().index_of_msdd(&joiner, base_bits) else {
            return;
        };
        let top = request.last_row();
        for row in (msdd..top).rev() {
            request.push_row(state.routing_table.get_row(row));
        }
        trace!(joiner = %joiner, rows = top.saturating_sub(msdd), "harvested rows into join request");
    }

    /// Accept a join request that terminated here, if this node is a member.
    ///
    /// The accepting node harvests its own rows too before attaching its leaf
    /// set.
    pub(crate) fn accept_join(&self, state: &mut NodeState, msg: &RouteMessage) -> Result<Action> {
        let mut request: JoinRequest = msg.decode_payload()?;
        if request.is_accepted() {
            return Ok(Action::Drop);
        }
        let joiner = state.coalesce(request.joiner().clone());
        if joiner.same_endpoint(&self.local) {
            debug!("own join request returned, dropping");
            return Ok(Action::Drop);
        }
        if !state.join_state.is_ready() {
            info!(joiner = %joiner.id(), "dropping join request: node not ready");
            return Ok(Action::Drop);
        }
        self.push_shared_rows(state, &mut request);
        request.accept_join(self.local.clone(), state.leaf_set.snapshot());
        Ok(Action::Reply(joiner, Box::new(request)))
    }

    /// Complete the join from an accepted reply.
    pub(crate) async fn handle_join_reply(&self, request: JoinRequest) -> Result<()> {
        let (delta, outbound) = {
            let mut state = self.state.lock().await;
            if !matches!(state.join_state, JoinState::Requesting { .. }) {
                debug!(state = state.join_state.name(), "ignoring join reply");
                return Ok(());
            }
            let Some(accepter) = request.join_handle().cloned() else {
                debug!("ignoring join reply that was never accepted");
                return Ok(());
            };
            if !request.is_accepted() {
                return Ok(());
            }

            if accepter.id() == self.local.id() && !accepter.same_endpoint(&self.local) {
                let err = JoinError::IdCollision {
                    local: self.local.id(),
                    existing: accepter.address().to_string(),
                };
                warn!(node = %self.local.id(), "join failed: {err}");
                self.publish(&mut state, JoinState::Failed(err));
                return Ok(());
            }
            if !accepter.is_alive() {
                debug!(accepter = %accepter.id(), "join reply from a faulty node");
                return Ok(());
            }

            let before = state.leaf_members();
            state.routing_table.put(accepter.clone());
            let mut outbound = self.broadcast_rows(&mut state, &request);
            if let Some(leaf_set) = request.leaf_set() {
                outbound.extend(state.apply_leaf_set(&BroadcastLeafSet {
                    from: accepter.clone(),
                    leaf_set: leaf_set.clone(),
                    kind: LeafSetKind::JoinInitial,
                    hop_count: 0,
                }));
            }
            self.publish(&mut state, JoinState::Ready);
            info!(
                node = %self.local.id(),
                accepter = %accepter.id(),
                leaf_set = state.leaf_set.size(),
                routing_table = state.routing_table.size(),
                "joined ring"
            );
            (state.leaf_delta(&before), outbound)
        };
        self.notify_leaf_set(delta).await;
        self.dispatch(outbound).await;
        Ok(())
    }

    /// Install the harvested rows locally and announce each row to the
    /// nearest live node of every one of its cells.
    fn broadcast_rows(&self, state: &mut NodeState, request: &JoinRequest) -> Outbound {
        for row in request.rows() {
            for handle in row.handles() {
                if handle.is_alive() && handle.id() != self.local.id() {
                    state.routing_table.put(handle.clone());
                }
            }
        }

        let mut outbound = Outbound::new();
        for row in request.rows() {
            for cell in row.cells() {
                let nearest = cell
                    .iter()
                    .filter(|h| h.is_alive() && h.id() != self.local.id())
                    .min_by_key(|h| h.proximity_or_max());
                if let Some(to) = nearest {
                    outbound.push((
                        to.clone(),
                        OverlayMessage::RouteRow(BroadcastRouteRow {
                            from: self.local.clone(),
                            row: row.clone(),
                        }),
                    ));
                }
            }
        }
        outbound
    }
}
