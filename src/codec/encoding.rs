//! Encode/decode capabilities for wire records
//!
//! A type implements `Encodable`, `Decodable`, or both. Directions a message
//! does not support are simply missing impls, so misuse fails to compile.

use super::buffer::{CodecError, WireBuffer};

/// Serialize into a `WireBuffer`
pub trait Encodable {
    fn encode(&self, buf: &mut WireBuffer);

    /// Serialize into a fresh byte vector
    fn to_wire_bytes(&self) -> Vec<u8> {
        let mut buf = WireBuffer::with_capacity(64);
        self.encode(&mut buf);
        buf.into_bytes()
    }
}

/// Deserialize from a `WireBuffer`, advancing its cursor
pub trait Decodable: Sized {
    fn decode(buf: &mut WireBuffer) -> Result<Self, CodecError>;

    fn from_wire_bytes(bytes: &[u8]) -> Result<Self, CodecError> {
        let mut buf = WireBuffer::wrap(bytes.to_vec());
        Self::decode(&mut buf)
    }
}

impl Encodable for [u8; 32] {
    fn encode(&self, buf: &mut WireBuffer) {
        buf.put_bytes(self);
    }
}

impl Decodable for [u8; 32] {
    fn decode(buf: &mut WireBuffer) -> Result<Self, CodecError> {
        let bytes = buf.get_bytes(32)?;
        let mut out = [0u8; 32];
        out.copy_from_slice(&bytes);
        Ok(out)
    }
}

impl Encodable for u32 {
    fn encode(&self, buf: &mut WireBuffer) {
        buf.put_u32(*self);
    }
}

impl Decodable for u32 {
    fn decode(buf: &mut WireBuffer) -> Result<Self, CodecError> {
        buf.get_u32()
    }
}
