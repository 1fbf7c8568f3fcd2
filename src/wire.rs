//! Cursor-based binary encoding shared by every wire structure.
//!
//! All integers are big-endian. Identifiers are written as their 20 raw bytes;
//! node handles as `id (20) || addr_len (u16) || addr (utf-8)`. Liveness and
//! proximity are local observations and never travel on the wire.

use crate::error::{DecodeError, EncodeError};
use crate::handle::NodeHandle;
use crate::id::{Id, ID_BYTES};

/// Types that can be written to the wire.
pub trait Encode {
    /// Append the encoding of `self` to `writer`.
    fn encode(&self, writer: &mut Writer) -> Result<(), EncodeError>;

    /// Encode into a fresh buffer.
    fn encode_to_vec(&self) -> Result<Vec<u8>, EncodeError> {
        let mut writer = Writer::new();
        self.encode(&mut writer)?;
        Ok(writer.into_inner())
    }
}

/// Types that can be read from the wire.
pub trait Decode: Sized {
    /// Read one value from `reader`.
    fn decode(reader: &mut Reader<'_>) -> Result<Self, DecodeError>;

    /// Decode a value that must span the whole slice.
    fn decode_from_slice(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut reader = Reader::new(bytes);
        let value = Self::decode(&mut reader)?;
        reader.finish()?;
        Ok(value)
    }
}

/// Growable output buffer.
#[derive(Debug, Default)]
pub struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    /// Create an empty writer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes written so far.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Returns true if nothing has been written.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Consume the writer and return its bytes.
    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }

    pub fn write_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    pub fn write_i8(&mut self, value: i8) {
        self.buf.push(value as u8);
    }

    pub fn write_bool(&mut self, value: bool) {
        self.buf.push(u8::from(value));
    }

    pub fn write_u16(&mut self, value: u16) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    pub fn write_u32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    pub fn write_i32(&mut self, value: i32) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn write_id(&mut self, id: &Id) {
        self.buf.extend_from_slice(id.as_bytes());
    }

    /// Write a node handle.
    pub fn write_handle(&mut self, handle: &NodeHandle) -> Result<(), EncodeError> {
        let address = handle.address().as_bytes();
        let len = u16::try_from(address.len())
            .map_err(|_| EncodeError::AddressTooLong(address.len()))?;
        self.write_id(&handle.id());
        self.write_u16(len);
        self.write_bytes(address);
        Ok(())
    }

    /// Write a u16 count followed by each handle.
    pub fn write_handles<'a, I>(&mut self, handles: I) -> Result<(), EncodeError>
    where
        I: IntoIterator<Item = &'a NodeHandle>,
        I::IntoIter: ExactSizeIterator,
    {
        let iter = handles.into_iter();
        let count = iter.len();
        let count = u16::try_from(count).map_err(|_| EncodeError::CountTooLarge(count))?;
        self.write_u16(count);
        for handle in iter {
            self.write_handle(handle)?;
        }
        Ok(())
    }
}

/// Zero-copy reader over a byte slice.
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    /// Create a reader positioned at the start of `buf`.
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Number of unread bytes.
    pub fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.pos)
    }

    /// Current offset.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// All unread bytes, consuming them.
    pub fn take_rest(&mut self) -> &'a [u8] {
        let rest = &self.buf[self.pos..];
        self.pos = self.buf.len();
        rest
    }

    /// Fail if any bytes remain unread.
    pub fn finish(&self) -> Result<(), DecodeError> {
        match self.remaining() {
            0 => Ok(()),
            n => Err(DecodeError::TrailingBytes(n)),
        }
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        if self.remaining() < len {
            return Err(DecodeError::UnexpectedEof);
        }
        let slice = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    pub fn read_u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.read_bytes(1)?[0])
    }

    pub fn read_i8(&mut self) -> Result<i8, DecodeError> {
        Ok(self.read_u8()? as i8)
    }

    pub fn read_bool(&mut self) -> Result<bool, DecodeError> {
        match self.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(DecodeError::InvalidValue("boolean")),
        }
    }

    pub fn read_u16(&mut self) -> Result<u16, DecodeError> {
        let bytes = self.read_bytes(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    pub fn read_u32(&mut self) -> Result<u32, DecodeError> {
        let bytes = self.read_bytes(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn read_i32(&mut self) -> Result<i32, DecodeError> {
        Ok(self.read_u32()? as i32)
    }

    pub fn read_id(&mut self) -> Result<Id, DecodeError> {
        let bytes = self.read_bytes(ID_BYTES)?;
        let mut id = [0u8; ID_BYTES];
        id.copy_from_slice(bytes);
        Ok(Id::from_bytes(id))
    }

    /// Read a node handle. The result is a fresh record; callers coalesce it.
    pub fn read_handle(&mut self) -> Result<NodeHandle, DecodeError> {
        let id = self.read_id()?;
        let len = self.read_u16()? as usize;
        let raw = self.read_bytes(len)?;
        let address = std::str::from_utf8(raw).map_err(|_| DecodeError::InvalidAddress)?;
        Ok(NodeHandle::new(id, address))
    }

    /// Read a u16 count followed by that many handles.
    pub fn read_handles(&mut self) -> Result<Vec<NodeHandle>, DecodeError> {
        let count = self.read_u16()? as usize;
        let mut handles = Vec::with_capacity(count.min(self.remaining() / ID_BYTES));
        for _ in 0..count {
            handles.push(self.read_handle()?);
        }
        Ok(handles)
    }
}

impl Encode for Id {
    fn encode(&self, writer: &mut Writer) -> Result<(), EncodeError> {
        writer.write_id(self);
        Ok(())
    }
}

impl Decode for Id {
    fn decode(reader: &mut Reader<'_>) -> Result<Self, DecodeError> {
        reader.read_id()
    }
}

impl Encode for NodeHandle {
    fn encode(&self, writer: &mut Writer) -> Result<(), EncodeError> {
        writer.write_handle(self)
    }
}

impl Decode for NodeHandle {
    fn decode(reader: &mut Reader<'_>) -> Result<Self, DecodeError> {
        reader.read_handle()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handle_layout_is_id_then_length_prefixed_address() {
        let handle = NodeHandle::new(Id::from_prefix(&[0xaa]), "node-1");
        let bytes = handle.encode_to_vec().expect("encodes");
        assert_eq!(bytes.len(), ID_BYTES + 2 + 6);
        assert_eq!(bytes[0], 0xaa);
        assert_eq!(&bytes[ID_BYTES..ID_BYTES + 2], &[0, 6]);
        assert_eq!(&bytes[ID_BYTES + 2..], b"node-1");

        let decoded = NodeHandle::decode_from_slice(&bytes).expect("decodes");
        assert!(decoded.same_endpoint(&handle));
    }

    #[test]
    fn truncated_input_is_an_error() {
        let handle = NodeHandle::new(Id::from_prefix(&[0xaa]), "node-1");
        let bytes = handle.encode_to_vec().expect("encodes");
        let err = NodeHandle::decode_from_slice(&bytes[..bytes.len() - 1]).unwrap_err();
        assert_eq!(err, DecodeError::UnexpectedEof);
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let mut bytes = Id::ZERO.encode_to_vec().expect("encodes");
        bytes.push(0);
        assert_eq!(
            Id::decode_from_slice(&bytes).unwrap_err(),
            DecodeError::TrailingBytes(1)
        );
    }

    #[test]
    fn booleans_must_be_zero_or_one() {
        let mut reader = Reader::new(&[2]);
        assert_eq!(
            reader.read_bool().unwrap_err(),
            DecodeError::InvalidValue("boolean")
        );
    }

    #[test]
    fn oversized_addresses_fail_to_encode() {
        let handle = NodeHandle::new(Id::ZERO, "x".repeat(70_000));
        assert_eq!(
            handle.encode_to_vec().unwrap_err(),
            EncodeError::AddressTooLong(70_000)
        );
    }

    #[test]
    fn handle_lists_longer_than_a_u16_fail_to_encode() {
        let handles: Vec<NodeHandle> = (0..70_000u32)
            .map(|_| NodeHandle::new(Id::ZERO, "h"))
            .collect();
        let mut writer = Writer::new();
        assert_eq!(
            writer.write_handles(&handles).unwrap_err(),
            EncodeError::CountTooLarge(70_000)
        );
    }
}
