//! # Pastry overlay
//!
//! This crate implements a prefix-routing peer-to-peer overlay in the style of
//! Pastry. Nodes take 160-bit identifiers on a ring; each keeps a routing table
//! indexed by shared identifier prefix and a leaf set of its numerically
//! nearest neighbours, and together they route any key to the live node whose
//! identifier is closest to it in a logarithmic number of hops.
//!
//! The crate is split into modules that can be reused independently:
//!
//! - [`id`]: the circular identifier space, digits and ranges.
//! - [`handle`]: shared node handles with transport-owned liveness.
//! - [`routing_table`] and [`leaf_set`]: the two membership structures.
//! - [`router`]: the per-message next-hop decision and routing-table repair.
//! - [`message`], [`protocol`] and [`wire`]: the binary wire formats.
//! - [`node`] and [`join`]: the [`PastryNode`] state machine and ring membership.
//! - [`discovery`]: proximity-aware bootstrap selection.
//! - [`net`]: an in-process [`OverlayNetwork`] for simulations and tests.
//! - [`framing`]: length-prefixed frames for stream transports.
//!
//! ## Getting started
//!
//! A node needs a transport implementing [`OverlayNetwork`]. The in-process
//! [`DirectNetwork`] is enough to build a ring:
//!
//! ```no_run
//! use pastry_overlay::{DirectRegistry, Id, OverlayConfig, Position};
//!
//! # async fn demo() -> pastry_overlay::Result<()> {
//! let registry = DirectRegistry::new();
//! let config = OverlayConfig::default();
//!
//! let first = registry
//!     .add_node(Id::from_key(b"first"), "first", Position::new(0.0, 0.0), config.clone())
//!     .await?;
//! first.create_ring().await?;
//!
//! let second = registry
//!     .add_node(Id::from_key(b"second"), "second", Position::new(5.0, 5.0), config)
//!     .await?;
//! second.join(&[first.local_handle().clone()]).await?;
//! assert!(second.is_ready().await);
//! # Ok(())
//! # }
//! ```
//!
//! The binary in `src/main.rs` builds a larger ring this way and checks that
//! lookups reach the right node.

pub mod config;
pub mod discovery;
pub mod error;
pub mod framing;
pub mod handle;
pub mod id;
pub mod join;
pub mod leaf_set;
pub mod message;
pub mod net;
pub mod node;
pub mod protocol;
pub mod router;
pub mod routing_table;
pub mod wire;

pub use config::OverlayConfig;
pub use discovery::get_nearest;
pub use error::{ConfigError, DecodeError, EncodeError, JoinError, OverlayError, Result};
pub use handle::{Liveness, NodeHandle};
pub use id::{Id, IdRange, ID_BITS};
pub use join::JoinState;
pub use leaf_set::{LeafSet, LeafSetSnapshot};
pub use message::{AppMessage, PayloadCodec, RouteMessage, SendOptions};
pub use net::{DirectNetwork, DirectNode, DirectRegistry, Position};
pub use node::{application_address, Application, OverlayNetwork, PastryNode, TelemetrySnapshot};
pub use router::{RouteDecision, Router};
pub use routing_table::{RouteRow, RouteSet, RoutingTable};
