//! Ring simulator for the pastry overlay.
//!
//! Builds a ring over the in-process network using the real join protocol,
//! routes random lookups from random nodes, checks that every lookup reaches
//! the live node numerically closest to its key, and prints a JSON report.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin pastry-sim -- --nodes 200 --lookups 2000
//! RUST_LOG=pastry_overlay=debug cargo run --bin pastry-sim -- --nodes 20
//! ```

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{info, level_filters::LevelFilter, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use pastry_overlay::id::closeness_cmp;
use pastry_overlay::message::PayloadCodec;
use pastry_overlay::wire::{Reader, Writer};
use pastry_overlay::{
    application_address, AppMessage, Application, DecodeError, DirectNode, DirectRegistry,
    EncodeError, Id, OverlayConfig, Position,
};

#[derive(Parser)]
#[command(name = "pastry-sim")]
#[command(about = "Build a simulated ring and check that lookups reach the right node")]
struct Cli {
    /// Number of nodes in the ring.
    #[arg(long, default_value_t = 100)]
    nodes: usize,

    /// Number of random lookups to route.
    #[arg(long, default_value_t = 1000)]
    lookups: usize,

    /// Seed for identifiers, placement and lookups.
    #[arg(long, default_value_t = 1)]
    seed: u64,

    /// JSON configuration file; defaults are used when absent.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the digit width in bits.
    #[arg(long)]
    base_bits: Option<u8>,

    /// Override the leaf set capacity.
    #[arg(long)]
    leaf_set_size: Option<usize>,

    /// Join through the nearest node found by proximity discovery instead of
    /// a random member.
    #[arg(long)]
    nearest_bootstrap: bool,

    /// Kill this many random nodes after the ring is built.
    #[arg(long, default_value_t = 0)]
    kill: usize,
}

/// Payload routed by each lookup.
struct Probe {
    seq: u32,
}

impl PayloadCodec for Probe {
    const TYPE: u16 = 1;

    fn encode_body(&self, writer: &mut Writer) -> Result<(), EncodeError> {
        writer.write_u32(self.seq);
        Ok(())
    }

    fn decode_body(reader: &mut Reader<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            seq: reader.read_u32()?,
        })
    }
}

/// Reports which node each probe was delivered to.
struct ProbeApp {
    node: Id,
    deliveries: mpsc::UnboundedSender<(u32, Id)>,
}

impl Application for ProbeApp {
    fn deliver(&self, _target: &Id, message: AppMessage) {
        match message.decode_as::<Probe>() {
            Ok(probe) => {
                let _ = self.deliveries.send((probe.seq, self.node));
            }
            Err(err) => warn!(node = %self.node, "undecodable probe: {err}"),
        }
    }
}

#[derive(Default, Serialize)]
struct Report {
    nodes: usize,
    killed: usize,
    lookups: usize,
    delivered_to_root: usize,
    misrouted: usize,
    undelivered: usize,
    mean_hops: f64,
    max_hops: u64,
    hop_histogram: BTreeMap<u64, usize>,
    mean_leaf_set: f64,
    mean_routing_table_entries: f64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::WARN.into())
                .from_env_lossy(),
        )
        .init();

    let cli = Cli::parse();
    if cli.nodes == 0 {
        bail!("a ring needs at least one node");
    }
    if cli.kill >= cli.nodes {
        bail!("cannot kill {} of {} nodes", cli.kill, cli.nodes);
    }

    let mut config = match &cli.config {
        Some(path) => OverlayConfig::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => OverlayConfig::default(),
    };
    if let Some(b) = cli.base_bits {
        config.base_bit_length = b;
    }
    if let Some(size) = cli.leaf_set_size {
        config.leaf_set_size = size;
    }
    config.validate()?;

    let mut rng = StdRng::seed_from_u64(cli.seed);
    let registry = DirectRegistry::new();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let address = application_address("pastry-sim/probe");

    let mut nodes: Vec<Arc<DirectNode>> = Vec::with_capacity(cli.nodes);
    for index in 0..cli.nodes {
        let id = Id::random(&mut rng);
        let node = registry
            .add_node(id, format!("sim-{index}"), Position::random(&mut rng), config.clone())
            .await?;
        node.register_application(
            address,
            Arc::new(ProbeApp {
                node: id,
                deliveries: tx.clone(),
            }),
        )
        .await;

        match nodes.choose(&mut rng) {
            None => node.create_ring().await?,
            Some(seed) => {
                let seed = seed.local_handle().clone();
                let bootstraps = if cli.nearest_bootstrap {
                    node.nearest_nodes(&seed).await
                } else {
                    vec![seed]
                };
                node.join(&bootstraps)
                    .await
                    .with_context(|| format!("node {index} failed to join"))?;
            }
        }
        nodes.push(node);
    }
    info!(nodes = nodes.len(), "ring built");

    let mut report = Report {
        nodes: nodes.len(),
        killed: cli.kill,
        lookups: cli.lookups,
        ..Report::default()
    };
    let mut leaf_total = 0usize;
    let mut table_total = 0usize;
    for node in &nodes {
        let snapshot = node.telemetry_snapshot().await;
        leaf_total += node.leaf_set_ids().await.len();
        table_total += snapshot.routing_table_entries;
    }
    report.mean_leaf_set = leaf_total as f64 / nodes.len() as f64;
    report.mean_routing_table_entries = table_total as f64 / nodes.len() as f64;

    nodes.shuffle(&mut rng);
    let live = nodes.split_off(cli.kill);
    for dead in &nodes {
        registry.kill(dead.local_handle().address()).await;
    }

    let mut total_hops = 0u64;
    for seq in 0..cli.lookups {
        let seq = seq as u32;
        let key = Id::random(&mut rng);
        let Some(source) = live.choose(&mut rng) else {
            break;
        };
        let root = live
            .iter()
            .map(|n| n.id())
            .min_by(|a, b| closeness_cmp(&key, a, b))
            .context("no live nodes")?;

        let before = registry.frames_sent("route").await;
        let message = AppMessage::from_payload(&Probe { seq })?;
        source.route(key, address, message, None).await?;
        let hops = registry.frames_sent("route").await - before;

        match rx.try_recv() {
            Ok((delivered_seq, at)) if delivered_seq == seq && at == root => {
                report.delivered_to_root += 1;
            }
            Ok((_, at)) => {
                warn!(key = %key, root = %root, delivered = %at, "lookup reached the wrong node");
                report.misrouted += 1;
            }
            Err(_) => {
                warn!(key = %key, root = %root, "lookup was not delivered");
                report.undelivered += 1;
            }
        }
        total_hops += hops;
        report.max_hops = report.max_hops.max(hops);
        *report.hop_histogram.entry(hops).or_insert(0) += 1;
    }
    if cli.lookups > 0 {
        report.mean_hops = total_hops as f64 / cli.lookups as f64;
    }

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
