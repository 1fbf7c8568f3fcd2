#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use pastry_overlay::id::closeness_cmp;
use pastry_overlay::message::PayloadCodec;
use pastry_overlay::wire::{Reader, Writer};
use pastry_overlay::{
    AppMessage, Application, DecodeError, DirectNode, DirectRegistry, EncodeError, Id, NodeHandle,
    OverlayConfig, Position, RouteMessage,
};

/// Application address used by every test node.
pub const TEST_APP: i32 = 7;

/// Small test payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ping(pub u32);

impl PayloadCodec for Ping {
    const TYPE: u16 = 42;

    fn encode_body(&self, writer: &mut Writer) -> Result<(), EncodeError> {
        writer.write_u32(self.0);
        Ok(())
    }

    fn decode_body(reader: &mut Reader<'_>) -> Result<Self, DecodeError> {
        Ok(Ping(reader.read_u32()?))
    }
}

pub fn ping(n: u32) -> AppMessage {
    AppMessage::from_payload(&Ping(n)).expect("encode ping")
}

/// Records every upcall it receives.
#[derive(Default)]
pub struct Recorder {
    delivered: Mutex<Vec<(Id, u32)>>,
    forwarded: Mutex<Vec<Id>>,
    leaf_events: Mutex<Vec<(Id, bool)>>,
    veto: Mutex<bool>,
}

impl Recorder {
    pub fn delivered(&self) -> Vec<(Id, u32)> {
        self.delivered.lock().unwrap().clone()
    }

    pub fn forwarded(&self) -> Vec<Id> {
        self.forwarded.lock().unwrap().clone()
    }

    pub fn leaf_events(&self) -> Vec<(Id, bool)> {
        self.leaf_events.lock().unwrap().clone()
    }

    pub fn set_veto(&self, veto: bool) {
        *self.veto.lock().unwrap() = veto;
    }
}

impl Application for Recorder {
    fn deliver(&self, target: &Id, message: AppMessage) {
        let Ping(n) = message.decode_as::<Ping>().expect("ping payload");
        self.delivered.lock().unwrap().push((*target, n));
    }

    fn forward(&self, message: &mut RouteMessage) -> bool {
        self.forwarded.lock().unwrap().push(message.target());
        !*self.veto.lock().unwrap()
    }

    fn leaf_set_changed(&self, handle: &NodeHandle, joined: bool) {
        self.leaf_events.lock().unwrap().push((handle.id(), joined));
    }
}

pub fn make_node_id(index: u32) -> Id {
    let mut bytes = [0u8; 20];
    bytes[..4].copy_from_slice(&index.to_be_bytes());
    Id::from_bytes(bytes)
}

pub fn make_handle(index: u32) -> NodeHandle {
    NodeHandle::new(make_node_id(index), format!("node-{index}"))
}

/// A config sized for small rings with fast join timeouts.
pub fn test_config() -> OverlayConfig {
    OverlayConfig {
        base_bit_length: 4,
        leaf_set_size: 8,
        join_timeout_ms: 200,
        join_attempts: 2,
        ..OverlayConfig::default()
    }
}

pub struct TestNode {
    pub node: Arc<DirectNode>,
    pub app: Arc<Recorder>,
}

impl TestNode {
    pub fn id(&self) -> Id {
        self.node.id()
    }

    pub fn handle(&self) -> NodeHandle {
        self.node.local_handle().clone()
    }

    pub fn address(&self) -> String {
        self.node.local_handle().address().to_string()
    }
}

/// A ring of nodes on one in-process network.
pub struct TestRing {
    pub registry: Arc<DirectRegistry>,
    pub nodes: Vec<TestNode>,
    pub config: OverlayConfig,
    rng: StdRng,
}

impl TestRing {
    pub fn new(config: OverlayConfig, seed: u64) -> Self {
        Self {
            registry: DirectRegistry::new(),
            nodes: Vec::new(),
            config,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Register an idle node with a recording application.
    pub async fn spawn(&mut self, id: Id) -> &TestNode {
        let index = self.nodes.len();
        let position = Position::random(&mut self.rng);
        let node = self
            .registry
            .add_node(id, format!("node-{index}"), position, self.config.clone())
            .await
            .expect("valid config");
        let app = Arc::new(Recorder::default());
        node.register_application(TEST_APP, app.clone()).await;
        self.nodes.push(TestNode { node, app });
        self.nodes.last().expect("just pushed")
    }

    /// Build a ring by joining every id through a random existing member.
    pub async fn build(config: OverlayConfig, ids: &[Id], seed: u64) -> Self {
        let mut ring = Self::new(config, seed);
        for (i, id) in ids.iter().enumerate() {
            let bootstrap = if i == 0 {
                None
            } else {
                let pick = ring.rng.gen_range(0..ring.nodes.len());
                Some(ring.nodes[pick].handle())
            };
            let node = ring.spawn(*id).await.node.clone();
            match bootstrap {
                None => node.create_ring().await.expect("create ring"),
                Some(b) => node.join(&[b]).await.expect("join"),
            }
        }
        ring
    }

    /// Build a ring of `n` random identifiers.
    pub async fn random(config: OverlayConfig, n: usize, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed ^ 0x5eed);
        let ids: Vec<Id> = (0..n).map(|_| Id::random(&mut rng)).collect();
        Self::build(config, &ids, seed).await
    }

    pub fn by_id(&self, id: &Id) -> Option<&TestNode> {
        self.nodes.iter().find(|n| n.id() == *id)
    }

    /// The live node whose identifier is closest to `key`.
    pub async fn root_of(&self, key: &Id) -> Id {
        let mut live = Vec::new();
        for n in &self.nodes {
            if self.registry.is_alive(&n.address()).await {
                live.push(n.id());
            }
        }
        live.into_iter()
            .min_by(|a, b| closeness_cmp(key, a, b))
            .expect("at least one live node")
    }

    /// Nodes whose recorder saw a delivery of ping `n`.
    pub fn delivered_at(&self, n: u32) -> Vec<Id> {
        self.nodes
            .iter()
            .filter(|t| t.app.delivered().iter().any(|(_, m)| *m == n))
            .map(TestNode::id)
            .collect()
    }

    pub fn random_key(&mut self) -> Id {
        Id::random(&mut self.rng)
    }

    pub fn random_index(&mut self) -> usize {
        self.rng.gen_range(0..self.nodes.len())
    }
}
