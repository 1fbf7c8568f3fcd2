//! Error types for the overlay.
//!
//! Per-message routing problems never surface here: they are resolved by the
//! router's fallback chain or end in a deliberate drop. What remains are the
//! structural failures a node's owner has to act on.

use thiserror::Error;

use crate::id::Id;

/// Failure to decode bytes received from the wire.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// The buffer ended before the structure was complete.
    #[error("unexpected end of buffer")]
    UnexpectedEof,

    /// A route message carried a version this node does not speak.
    #[error("unknown route message version {0}")]
    UnknownVersion(u8),

    /// A frame carried an unknown message kind tag.
    #[error("unknown message kind {0}")]
    UnknownMessageKind(u8),

    /// A payload was decoded with a decoder for a different type tag.
    #[error("payload type {found} does not match expected type {expected}")]
    UnknownPayloadType {
        /// Type tag the decoder handles.
        expected: u16,
        /// Type tag found in the payload.
        found: u16,
    },

    /// A transport address was not valid UTF-8.
    #[error("transport address is not valid utf-8")]
    InvalidAddress,

    /// A field held a value outside its domain.
    #[error("invalid value: {0}")]
    InvalidValue(&'static str),

    /// Bytes were left over after a complete structure was decoded.
    #[error("{0} trailing bytes after message")]
    TrailingBytes(usize),
}

/// Failure to encode a message for the wire.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EncodeError {
    /// Route messages always carry the previous hop on the wire.
    #[error("route message has no previous hop")]
    MissingPreviousHop,

    /// A transport address does not fit its u16 length prefix.
    #[error("transport address of {0} bytes is too long")]
    AddressTooLong(usize),

    /// A count does not fit its u16 prefix.
    #[error("count {0} does not fit a u16 prefix")]
    CountTooLarge(usize),
}

/// Fatal outcome of the join protocol.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JoinError {
    /// None of the supplied bootstrap handles is alive.
    #[error("cannot join ring: all bootstrap handles are faulty")]
    NoLiveBootstrap,

    /// A live node already owns this identifier.
    #[error("identifier collision: {local} is already owned by {existing}")]
    IdCollision {
        /// The identifier the local node tried to join with.
        local: Id,
        /// Transport address of the node already holding it.
        existing: String,
    },

    /// No accepted join reply arrived in time.
    #[error("join timed out after {attempts} attempts")]
    Timeout {
        /// Number of join requests sent.
        attempts: u32,
    },

    /// The node was destroyed while the join was in progress.
    #[error("node destroyed during join")]
    Destroyed,

    /// The node is already a ring member.
    #[error("node has already joined a ring")]
    AlreadyJoined,
}

/// Invalid overlay configuration.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Digit width must be between 1 and 8 bits and divide the identifier width.
    #[error("base bit length {0} must be in 1..=8 and divide 160")]
    BaseBitLength(u8),

    /// Leaf set capacity must be an even number the wire format can carry.
    #[error("leaf set size {0} must be even and between 2 and 65534")]
    LeafSetSize(usize),

    /// Each routing table cell must hold at least one candidate.
    #[error("route set capacity must be at least 1")]
    RouteSetMax,

    /// Only wire versions 0 and 1 exist.
    #[error("route message version {0} is not supported")]
    RouteMessageVersion(u8),

    /// The configuration file could not be parsed.
    #[error("invalid configuration: {0}")]
    Parse(String),
}

/// Failure to parse an identifier from hex.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParseIdError {
    /// Not valid hex.
    #[error("invalid hex identifier: {0}")]
    Hex(#[from] hex::FromHexError),

    /// Wrong number of bytes.
    #[error("identifier must be 20 bytes, got {0}")]
    Length(usize),
}

/// Errors surfaced by a [`PastryNode`](crate::node::PastryNode) to its owner.
#[derive(Error, Debug)]
pub enum OverlayError {
    /// Join protocol failure.
    #[error(transparent)]
    Join(#[from] JoinError),

    /// Wire decoding failure.
    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// Wire encoding failure.
    #[error(transparent)]
    Encode(#[from] EncodeError),

    /// Configuration rejected.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The operation needs a node that has joined the ring.
    #[error("node is not ready")]
    NotReady,

    /// The transport collaborator reported a failure.
    #[error(transparent)]
    Transport(#[from] anyhow::Error),
}

/// Result type alias for overlay operations.
pub type Result<T> = std::result::Result<T, OverlayError>;
