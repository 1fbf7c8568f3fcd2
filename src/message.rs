//! Route messages and the application payloads they carry.
//!
//! Wire layout of a [`RouteMessage`] (big-endian):
//!
//! ```text
//! version:u8  aux_address:i32
//! v0: target:id
//! v1: has_destination:u8 ( destination:handle | target:id )
//! prev_node:handle
//! has_sender:u8  priority:i8  type:u16  [sender:handle]  body...
//! ```
//!
//! Only the routing fields, the sender flag and the priority are parsed when a
//! message arrives. The rest of the payload is kept as received and copied
//! verbatim when the message is forwarded, so intermediate hops never pay for
//! application deserialization.

use crate::error::{DecodeError, EncodeError};
use crate::handle::NodeHandle;
use crate::id::Id;
use crate::wire::{Decode, Encode, Reader, Writer};

/// Highest delivery priority; used for overlay maintenance traffic.
pub const PRIORITY_MAX: i8 = -15;
/// Priority used for join traffic.
pub const PRIORITY_HIGH: i8 = -10;
/// Default application priority.
pub const PRIORITY_MEDIUM: i8 = 0;
/// Background traffic.
pub const PRIORITY_LOW: i8 = 10;

/// Per-message delivery options.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SendOptions {
    /// Re-resolve the next hop if the chosen one turns out to be suspected
    /// or unreachable.
    pub reroute_if_suspected: bool,
}

impl Default for SendOptions {
    fn default() -> Self {
        Self {
            reroute_if_suspected: true,
        }
    }
}

/// A typed application message body.
///
/// Implementors pick a type tag unique within their application address.
pub trait PayloadCodec: Sized {
    /// Type tag written ahead of the body.
    const TYPE: u16;

    /// Append the body.
    fn encode_body(&self, writer: &mut Writer) -> Result<(), EncodeError>;

    /// Read the body. The reader spans exactly the body bytes.
    fn decode_body(reader: &mut Reader<'_>) -> Result<Self, DecodeError>;
}

/// A decoded application message.
#[derive(Clone, Debug)]
pub struct AppMessage {
    msg_type: u16,
    priority: i8,
    sender: Option<NodeHandle>,
    body: Vec<u8>,
}

impl AppMessage {
    /// A message of type `msg_type` at default priority with no sender.
    pub fn new(msg_type: u16, body: Vec<u8>) -> Self {
        Self {
            msg_type,
            priority: PRIORITY_MEDIUM,
            sender: None,
            body,
        }
    }

    /// Encode `payload` as the body of a new message.
    pub fn from_payload<T: PayloadCodec>(payload: &T) -> Result<Self, EncodeError> {
        let mut writer = Writer::new();
        payload.encode_body(&mut writer)?;
        Ok(Self::new(T::TYPE, writer.into_inner()))
    }

    pub fn with_priority(mut self, priority: i8) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_sender(mut self, sender: NodeHandle) -> Self {
        self.sender = Some(sender);
        self
    }

    pub fn msg_type(&self) -> u16 {
        self.msg_type
    }

    pub fn priority(&self) -> i8 {
        self.priority
    }

    pub fn sender(&self) -> Option<&NodeHandle> {
        self.sender.as_ref()
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Decode the body as `T`, checking the type tag first.
    pub fn decode_as<T: PayloadCodec>(&self) -> Result<T, DecodeError> {
        if self.msg_type != T::TYPE {
            return Err(DecodeError::UnknownPayloadType {
                expected: T::TYPE,
                found: self.msg_type,
            });
        }
        let mut reader = Reader::new(&self.body);
        let value = T::decode_body(&mut reader)?;
        reader.finish()?;
        Ok(value)
    }
}

impl Encode for AppMessage {
    fn encode(&self, writer: &mut Writer) -> Result<(), EncodeError> {
        writer.write_bool(self.sender.is_some());
        writer.write_i8(self.priority);
        writer.write_u16(self.msg_type);
        if let Some(sender) = &self.sender {
            writer.write_handle(sender)?;
        }
        writer.write_bytes(&self.body);
        Ok(())
    }
}

impl Decode for AppMessage {
    fn decode(reader: &mut Reader<'_>) -> Result<Self, DecodeError> {
        let has_sender = reader.read_bool()?;
        let priority = reader.read_i8()?;
        let msg_type = reader.read_u16()?;
        let sender = if has_sender {
            Some(reader.read_handle()?)
        } else {
            None
        };
        let body = reader.take_rest().to_vec();
        Ok(Self {
            msg_type,
            priority,
            sender,
            body,
        })
    }
}

/// Payload of a route message: either built locally or held as received.
#[derive(Clone, Debug)]
enum Payload {
    Decoded(AppMessage),
    Serialized { priority: i8, bytes: Vec<u8> },
}

/// An application message in flight toward the root of `target`.
#[derive(Clone, Debug)]
pub struct RouteMessage {
    version: u8,
    aux_address: i32,
    target: Id,
    destination: Option<NodeHandle>,
    prev_node: Option<NodeHandle>,
    next_hop: Option<NodeHandle>,
    options: SendOptions,
    payload: Payload,
}

impl RouteMessage {
    /// Route `message` to the root of `target`, for the application at
    /// `aux_address`.
    pub fn new(target: Id, aux_address: i32, message: AppMessage, version: u8) -> Self {
        Self {
            version,
            aux_address,
            target,
            destination: None,
            prev_node: None,
            next_hop: None,
            options: SendOptions::default(),
            payload: Payload::Decoded(message),
        }
    }

    /// Route `message` to a specific node.
    pub fn to_handle(
        destination: NodeHandle,
        aux_address: i32,
        message: AppMessage,
        version: u8,
    ) -> Self {
        let mut msg = Self::new(destination.id(), aux_address, message, version);
        msg.destination = Some(destination);
        msg
    }

    pub fn version(&self) -> u8 {
        self.version
    }

    /// Address of the application the message is for.
    pub fn aux_address(&self) -> i32 {
        self.aux_address
    }

    /// The identifier being routed to.
    pub fn target(&self) -> Id {
        self.target
    }

    /// Redirect the message to a new key.
    pub fn set_target(&mut self, target: Id) {
        self.target = target;
        self.destination = None;
    }

    pub fn destination(&self) -> Option<&NodeHandle> {
        self.destination.as_ref()
    }

    pub fn prev_node(&self) -> Option<&NodeHandle> {
        self.prev_node.as_ref()
    }

    pub fn set_prev_node(&mut self, prev: NodeHandle) {
        self.prev_node = Some(prev);
    }

    pub fn next_hop(&self) -> Option<&NodeHandle> {
        self.next_hop.as_ref()
    }

    pub fn set_next_hop(&mut self, hop: Option<NodeHandle>) {
        self.next_hop = hop;
    }

    /// Consume the pre-resolved next hop. It is cleared so the message is
    /// never dispatched to it twice.
    pub fn take_next_hop(&mut self) -> Option<NodeHandle> {
        self.next_hop.take()
    }

    pub fn options(&self) -> SendOptions {
        self.options
    }

    pub fn options_mut(&mut self) -> &mut SendOptions {
        &mut self.options
    }

    /// Delivery priority, readable without decoding the payload.
    pub fn priority(&self) -> i8 {
        match &self.payload {
            Payload::Decoded(msg) => msg.priority,
            Payload::Serialized { priority, .. } => *priority,
        }
    }

    /// Returns true if the payload has not been decoded.
    pub fn is_serialized(&self) -> bool {
        matches!(self.payload, Payload::Serialized { .. })
    }

    /// Decode the application message.
    pub fn app_message(&self) -> Result<AppMessage, DecodeError> {
        match &self.payload {
            Payload::Decoded(msg) => Ok(msg.clone()),
            Payload::Serialized { bytes, .. } => AppMessage::decode_from_slice(bytes),
        }
    }

    /// Decode the application message body as `T`.
    pub fn decode_payload<T: PayloadCodec>(&self) -> Result<T, DecodeError> {
        self.app_message()?.decode_as::<T>()
    }

    /// Replace the payload.
    pub fn set_app_message(&mut self, message: AppMessage) {
        self.payload = Payload::Decoded(message);
    }

    /// Handles carried on the wire, for coalescing after decode.
    pub(crate) fn handles_mut(&mut self) -> impl Iterator<Item = &mut NodeHandle> {
        self.destination.iter_mut().chain(self.prev_node.iter_mut())
    }
}

impl Encode for RouteMessage {
    fn encode(&self, writer: &mut Writer) -> Result<(), EncodeError> {
        let prev = self
            .prev_node
            .as_ref()
            .ok_or(EncodeError::MissingPreviousHop)?;
        writer.write_u8(self.version);
        writer.write_i32(self.aux_address);
        match (self.version, &self.destination) {
            (0, _) | (_, None) => {
                if self.version != 0 {
                    writer.write_bool(false);
                }
                writer.write_id(&self.target);
            }
            (_, Some(destination)) => {
                writer.write_bool(true);
                writer.write_handle(destination)?;
            }
        }
        writer.write_handle(prev)?;
        match &self.payload {
            Payload::Decoded(msg) => msg.encode(writer),
            Payload::Serialized { bytes, .. } => {
                writer.write_bytes(bytes);
                Ok(())
            }
        }
    }
}

impl Decode for RouteMessage {
    fn decode(reader: &mut Reader<'_>) -> Result<Self, DecodeError> {
        let version = reader.read_u8()?;
        let aux_address = reader.read_i32()?;
        let (target, destination) = match version {
            0 => (reader.read_id()?, None),
            1 => {
                if reader.read_bool()? {
                    let handle = reader.read_handle()?;
                    (handle.id(), Some(handle))
                } else {
                    (reader.read_id()?, None)
                }
            }
            other => return Err(DecodeError::UnknownVersion(other)),
        };
        let prev_node = reader.read_handle()?;
        let bytes = reader.take_rest();
        let mut header = Reader::new(bytes);
        header.read_bool()?;
        let priority = header.read_i8()?;
        Ok(Self {
            version,
            aux_address,
            target,
            destination,
            prev_node: Some(prev_node),
            next_hop: None,
            options: SendOptions::default(),
            payload: Payload::Serialized {
                priority,
                bytes: bytes.to_vec(),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Greeting(String);

    impl PayloadCodec for Greeting {
        const TYPE: u16 = 7;

        fn encode_body(&self, writer: &mut Writer) -> Result<(), EncodeError> {
            writer.write_bytes(self.0.as_bytes());
            Ok(())
        }

        fn decode_body(reader: &mut Reader<'_>) -> Result<Self, DecodeError> {
            let raw = reader.take_rest();
            String::from_utf8(raw.to_vec())
                .map(Greeting)
                .map_err(|_| DecodeError::InvalidValue("greeting"))
        }
    }

    fn prev() -> NodeHandle {
        NodeHandle::new(Id::from_prefix(&[0x11]), "prev")
    }

    #[test]
    fn version_zero_carries_bare_identifier() {
        let mut msg = RouteMessage::new(
            Id::from_prefix(&[0x42]),
            3,
            AppMessage::new(1, vec![9, 9]),
            0,
        );
        msg.set_prev_node(prev());
        let bytes = msg.encode_to_vec().expect("encodes");
        assert_eq!(bytes[0], 0);
        assert_eq!(&bytes[1..5], &3i32.to_be_bytes());
        assert_eq!(bytes[5], 0x42);

        let decoded = RouteMessage::decode_from_slice(&bytes).expect("decodes");
        assert_eq!(decoded.target(), Id::from_prefix(&[0x42]));
        assert!(decoded.destination().is_none());
        assert!(decoded.is_serialized());
        assert_eq!(decoded.app_message().expect("payload").body(), &[9, 9]);
    }

    #[test]
    fn payload_decodes_lazily_with_type_check() {
        let body = AppMessage::from_payload(&Greeting("hi".into()))
            .expect("encodes")
            .with_priority(PRIORITY_LOW)
            .with_sender(prev());
        let mut msg = RouteMessage::new(Id::ZERO, 1, body, 1);
        msg.set_prev_node(prev());
        let bytes = msg.encode_to_vec().expect("encodes");

        let decoded = RouteMessage::decode_from_slice(&bytes).expect("decodes");
        assert_eq!(decoded.priority(), PRIORITY_LOW);
        assert_eq!(decoded.decode_payload::<Greeting>().expect("typed").0, "hi");

        let wrong = AppMessage::new(8, Vec::new());
        assert_eq!(
            wrong.decode_as::<Greeting>().unwrap_err(),
            DecodeError::UnknownPayloadType {
                expected: 7,
                found: 8
            }
        );
    }

    #[test]
    fn unknown_version_is_rejected() {
        let mut bytes = vec![2u8];
        bytes.extend_from_slice(&[0; 64]);
        assert_eq!(
            RouteMessage::decode_from_slice(&bytes).unwrap_err(),
            DecodeError::UnknownVersion(2)
        );
    }

    #[test]
    fn encoding_requires_previous_hop() {
        let msg = RouteMessage::new(Id::ZERO, 0, AppMessage::new(0, Vec::new()), 1);
        assert_eq!(
            msg.encode_to_vec().unwrap_err(),
            EncodeError::MissingPreviousHop
        );
    }

    #[test]
    fn next_hop_is_consumed_once() {
        let mut msg = RouteMessage::new(Id::ZERO, 0, AppMessage::new(0, Vec::new()), 1);
        msg.set_next_hop(Some(prev()));
        assert!(msg.take_next_hop().is_some());
        assert!(msg.take_next_hop().is_none());
    }
}
