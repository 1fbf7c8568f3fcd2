//! Overlay protocol message definitions.
//!
//! Everything a node sends to another node is an [`OverlayMessage`] frame: a
//! one-byte kind tag followed by the encoded message. Route messages carry
//! application traffic and the routed half of the join protocol; the other
//! kinds are point-to-point maintenance messages.

use crate::error::{DecodeError, EncodeError};
use crate::handle::NodeHandle;
use crate::id::ID_BITS;
use crate::leaf_set::LeafSetSnapshot;
use crate::message::{PayloadCodec, RouteMessage};
use crate::routing_table::RouteRow;
use crate::wire::{Decode, Encode, Reader, Writer};

/// Application address reserved for the join protocol.
pub const JOIN_ADDRESS: i32 = -1;

/// Application addresses at or below this value are reserved for the overlay.
pub const RESERVED_ADDRESS_MAX: i32 = -1;

// ─────────────────────────────────────────────────────────────────────────────
// Join Request
// ─────────────────────────────────────────────────────────────────────────────

/// A join request routed toward the joining node's own identifier.
///
/// Nodes along the path push routing-table rows into it; the node where it
/// terminates accepts it by attaching its handle and leaf set, and sends it
/// straight back to the joiner.
#[derive(Clone, Debug)]
pub struct JoinRequest {
    handle: NodeHandle,
    base_bits: u8,
    accepted: bool,
    join_handle: Option<NodeHandle>,
    leaf_set: Option<LeafSetSnapshot>,
    rows: Vec<Option<RouteRow>>,
    last_row: usize,
}

impl JoinRequest {
    /// A fresh request for `handle` joining with `base_bits`-bit digits.
    pub fn new(handle: NodeHandle, base_bits: u8) -> Self {
        let num_rows = ID_BITS / base_bits.max(1) as usize;
        Self {
            handle,
            base_bits,
            accepted: false,
            join_handle: None,
            leaf_set: None,
            rows: vec![None; num_rows],
            last_row: num_rows,
        }
    }

    /// The joining node.
    pub fn joiner(&self) -> &NodeHandle {
        &self.handle
    }

    pub fn base_bits(&self) -> u8 {
        self.base_bits
    }

    pub fn num_rows(&self) -> usize {
        self.rows.len()
    }

    /// Lowest row index harvested so far; equals `num_rows` before any.
    pub fn last_row(&self) -> usize {
        self.last_row
    }

    /// Record the next lower row.
    pub fn push_row(&mut self, row: RouteRow) {
        if self.last_row == 0 {
            return;
        }
        self.last_row -= 1;
        self.rows[self.last_row] = Some(row);
    }

    /// Harvested rows, top row first.
    pub fn rows(&self) -> impl Iterator<Item = &RouteRow> {
        self.rows[self.last_row..].iter().rev().flatten()
    }

    pub fn is_accepted(&self) -> bool {
        self.accepted
    }

    /// Accept the request on behalf of `handle`, whose leaf set is attached.
    pub fn accept_join(&mut self, handle: NodeHandle, leaf_set: LeafSetSnapshot) {
        self.accepted = true;
        self.join_handle = Some(handle);
        self.leaf_set = Some(leaf_set);
    }

    /// The node that accepted the request.
    pub fn join_handle(&self) -> Option<&NodeHandle> {
        self.join_handle.as_ref()
    }

    /// The accepting node's leaf set.
    pub fn leaf_set(&self) -> Option<&LeafSetSnapshot> {
        self.leaf_set.as_ref()
    }

    pub(crate) fn handles_mut(&mut self) -> Vec<&mut NodeHandle> {
        let mut out: Vec<&mut NodeHandle> = vec![&mut self.handle];
        out.extend(self.join_handle.iter_mut());
        if let Some(ls) = self.leaf_set.as_mut() {
            out.extend(ls.handles_mut());
        }
        for row in self.rows.iter_mut().flatten() {
            out.extend(row.handles_mut());
        }
        out
    }
}

impl Encode for JoinRequest {
    fn encode(&self, writer: &mut Writer) -> Result<(), EncodeError> {
        writer.write_u8(self.base_bits);
        writer.write_bool(self.accepted);
        writer.write_handle(&self.handle)?;
        writer.write_bool(self.join_handle.is_some());
        if let Some(handle) = &self.join_handle {
            writer.write_handle(handle)?;
        }
        writer.write_bool(self.leaf_set.is_some());
        if let Some(ls) = &self.leaf_set {
            ls.encode(writer)?;
        }
        writer.write_u8(self.rows.len() as u8);
        writer.write_u8(self.last_row as u8);
        for row in &self.rows[self.last_row..] {
            writer.write_bool(row.is_some());
            if let Some(row) = row {
                row.encode(writer)?;
            }
        }
        Ok(())
    }
}

impl Decode for JoinRequest {
    fn decode(reader: &mut Reader<'_>) -> Result<Self, DecodeError> {
        let base_bits = reader.read_u8()?;
        if base_bits == 0 || base_bits > 8 || ID_BITS % base_bits as usize != 0 {
            return Err(DecodeError::InvalidValue("base bit length"));
        }
        let accepted = reader.read_bool()?;
        let handle = reader.read_handle()?;
        let join_handle = if reader.read_bool()? {
            Some(reader.read_handle()?)
        } else {
            None
        };
        let leaf_set = if reader.read_bool()? {
            Some(LeafSetSnapshot::decode(reader)?)
        } else {
            None
        };
        let num_rows = reader.read_u8()? as usize;
        if num_rows != ID_BITS / base_bits as usize {
            return Err(DecodeError::InvalidValue("join request row count"));
        }
        let last_row = reader.read_u8()? as usize;
        if last_row > num_rows {
            return Err(DecodeError::InvalidValue("join request last row"));
        }
        let mut rows = vec![None; num_rows];
        for slot in rows.iter_mut().skip(last_row) {
            if reader.read_bool()? {
                *slot = Some(RouteRow::decode(reader)?);
            }
        }
        Ok(Self {
            handle,
            base_bits,
            accepted,
            join_handle,
            leaf_set,
            rows,
            last_row,
        })
    }
}

impl PayloadCodec for JoinRequest {
    const TYPE: u16 = 1;

    fn encode_body(&self, writer: &mut Writer) -> Result<(), EncodeError> {
        self.encode(writer)
    }

    fn decode_body(reader: &mut Reader<'_>) -> Result<Self, DecodeError> {
        Self::decode(reader)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Maintenance Broadcasts
// ─────────────────────────────────────────────────────────────────────────────

/// Why a leaf set is being broadcast.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum LeafSetKind {
    /// The accepting node's leaf set, applied by a joiner to itself.
    JoinInitial = 0,
    /// A new node announcing itself to its leaf set.
    JoinAdvertise = 1,
    /// Reply to an advertisement that was missing members.
    Correction = 2,
    /// Periodic exchange.
    Update = 3,
}

impl TryFrom<u8> for LeafSetKind {
    type Error = DecodeError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::JoinInitial),
            1 => Ok(Self::JoinAdvertise),
            2 => Ok(Self::Correction),
            3 => Ok(Self::Update),
            _ => Err(DecodeError::InvalidValue("leaf set broadcast kind")),
        }
    }
}

/// A node's leaf set sent to one of its neighbours.
#[derive(Clone, Debug)]
pub struct BroadcastLeafSet {
    /// The sender.
    pub from: NodeHandle,
    /// The sender's leaf set.
    pub leaf_set: LeafSetSnapshot,
    /// Why it was sent.
    pub kind: LeafSetKind,
    /// Number of times this broadcast has been relayed.
    pub hop_count: u8,
}

impl Encode for BroadcastLeafSet {
    fn encode(&self, writer: &mut Writer) -> Result<(), EncodeError> {
        writer.write_handle(&self.from)?;
        writer.write_u8(self.kind as u8);
        writer.write_u8(self.hop_count);
        self.leaf_set.encode(writer)
    }
}

impl Decode for BroadcastLeafSet {
    fn decode(reader: &mut Reader<'_>) -> Result<Self, DecodeError> {
        let from = reader.read_handle()?;
        let kind = LeafSetKind::try_from(reader.read_u8()?)?;
        let hop_count = reader.read_u8()?;
        let leaf_set = LeafSetSnapshot::decode(reader)?;
        Ok(Self {
            from,
            leaf_set,
            kind,
            hop_count,
        })
    }
}

/// One routing-table row sent to a peer that appears to be missing it.
#[derive(Clone, Debug)]
pub struct BroadcastRouteRow {
    /// The sender.
    pub from: NodeHandle,
    /// The row.
    pub row: RouteRow,
}

impl Encode for BroadcastRouteRow {
    fn encode(&self, writer: &mut Writer) -> Result<(), EncodeError> {
        writer.write_handle(&self.from)?;
        self.row.encode(writer)
    }
}

impl Decode for BroadcastRouteRow {
    fn decode(reader: &mut Reader<'_>) -> Result<Self, DecodeError> {
        let from = reader.read_handle()?;
        let row = RouteRow::decode(reader)?;
        Ok(Self { from, row })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Frames
// ─────────────────────────────────────────────────────────────────────────────

const KIND_ROUTE: u8 = 0;
const KIND_JOIN_REPLY: u8 = 1;
const KIND_LEAF_SET: u8 = 2;
const KIND_ROUTE_ROW: u8 = 3;

/// A frame exchanged between two overlay nodes.
#[derive(Clone, Debug)]
pub enum OverlayMessage {
    /// Routed traffic, one hop at a time.
    Route(RouteMessage),
    /// An accepted join request, sent directly to the joiner.
    JoinReply(JoinRequest),
    /// Leaf-set maintenance.
    LeafSet(BroadcastLeafSet),
    /// Routing-table repair.
    RouteRow(BroadcastRouteRow),
}

impl OverlayMessage {
    /// Short name for logs and counters.
    pub fn kind_name(&self) -> &'static str {
        match self {
            OverlayMessage::Route(_) => "route",
            OverlayMessage::JoinReply(_) => "join_reply",
            OverlayMessage::LeafSet(_) => "leaf_set",
            OverlayMessage::RouteRow(_) => "route_row",
        }
    }

    /// The kind name of an encoded frame, without decoding it.
    pub fn peek_kind(frame: &[u8]) -> Option<&'static str> {
        match frame.first()? {
            &KIND_ROUTE => Some("route"),
            &KIND_JOIN_REPLY => Some("join_reply"),
            &KIND_LEAF_SET => Some("leaf_set"),
            &KIND_ROUTE_ROW => Some("route_row"),
            _ => None,
        }
    }

    /// Every handle carried by the frame, for coalescing after decode.
    pub(crate) fn handles_mut(&mut self) -> Vec<&mut NodeHandle> {
        match self {
            OverlayMessage::Route(msg) => msg.handles_mut().collect(),
            OverlayMessage::JoinReply(req) => req.handles_mut(),
            OverlayMessage::LeafSet(bls) => {
                let mut out: Vec<&mut NodeHandle> = vec![&mut bls.from];
                out.extend(bls.leaf_set.handles_mut());
                out
            }
            OverlayMessage::RouteRow(brr) => {
                let mut out: Vec<&mut NodeHandle> = vec![&mut brr.from];
                out.extend(brr.row.handles_mut());
                out
            }
        }
    }
}

impl Encode for OverlayMessage {
    fn encode(&self, writer: &mut Writer) -> Result<(), EncodeError> {
        match self {
            OverlayMessage::Route(msg) => {
                writer.write_u8(KIND_ROUTE);
                msg.encode(writer)
            }
            OverlayMessage::JoinReply(req) => {
                writer.write_u8(KIND_JOIN_REPLY);
                req.encode(writer)
            }
            OverlayMessage::LeafSet(bls) => {
                writer.write_u8(KIND_LEAF_SET);
                bls.encode(writer)
            }
            OverlayMessage::RouteRow(brr) => {
                writer.write_u8(KIND_ROUTE_ROW);
                brr.encode(writer)
            }
        }
    }
}

impl Decode for OverlayMessage {
    fn decode(reader: &mut Reader<'_>) -> Result<Self, DecodeError> {
        match reader.read_u8()? {
            KIND_ROUTE => Ok(OverlayMessage::Route(RouteMessage::decode(reader)?)),
            KIND_JOIN_REPLY => Ok(OverlayMessage::JoinReply(JoinRequest::decode(reader)?)),
            KIND_LEAF_SET => Ok(OverlayMessage::LeafSet(BroadcastLeafSet::decode(reader)?)),
            KIND_ROUTE_ROW => Ok(OverlayMessage::RouteRow(BroadcastRouteRow::decode(reader)?)),
            other => Err(DecodeError::UnknownMessageKind(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::Id;
    use crate::leaf_set::LeafSet;

    fn handle(prefix: u8) -> NodeHandle {
        NodeHandle::new(Id::from_prefix(&[prefix]), format!("n{prefix:02x}"))
    }

    #[test]
    fn join_request_rows_fill_from_the_top() {
        let mut req = JoinRequest::new(handle(0x80), 4);
        assert_eq!(req.num_rows(), 40);
        assert_eq!(req.last_row(), 40);
        req.push_row(RouteRow::new(39, vec![vec![handle(0x10)]]));
        req.push_row(RouteRow::new(38, Vec::new()));
        assert_eq!(req.last_row(), 38);
        let indices: Vec<_> = req.rows().map(RouteRow::index).collect();
        assert_eq!(indices, vec![39, 38]);
    }

    #[test]
    fn accepted_join_survives_the_wire() {
        let mut req = JoinRequest::new(handle(0x80), 4);
        req.push_row(RouteRow::new(39, vec![Vec::new(), vec![handle(0x10)]]));
        let mut ls = LeafSet::new(handle(0x00), 4);
        ls.put(handle(0x40));
        req.accept_join(handle(0x00), ls.snapshot());

        let frame = OverlayMessage::JoinReply(req)
            .encode_to_vec()
            .expect("encodes");
        let OverlayMessage::JoinReply(decoded) =
            OverlayMessage::decode_from_slice(&frame).expect("decodes")
        else {
            panic!("wrong frame kind");
        };
        assert!(decoded.is_accepted());
        assert_eq!(decoded.join_handle().map(|h| h.id()), Some(handle(0x00).id()));
        assert_eq!(decoded.last_row(), 39);
        assert_eq!(decoded.rows().next().map(|r| r.handles().count()), Some(1));
        let leaf_set = decoded.leaf_set().expect("leaf set attached");
        assert!(leaf_set.contains(&handle(0x40).id()));
    }

    #[test]
    fn unknown_frame_kind_is_an_error() {
        assert_eq!(
            OverlayMessage::decode_from_slice(&[9]).unwrap_err(),
            DecodeError::UnknownMessageKind(9)
        );
        assert_eq!(OverlayMessage::peek_kind(&[2, 0]), Some("leaf_set"));
    }
}
