//! Byte-cursor buffer for the Bitcoin wire format
//!
//! A `WireBuffer` is either allocated with a capacity (for writing) or wraps
//! existing bytes (for reading). It keeps a single cursor shared by reads and
//! writes, a switchable byte order, and grows automatically on writes.

use super::encoding::{Decodable, Encodable};
use thiserror::Error;

/// Largest value encoded as a single varint byte
pub const VARINT_MAX_SINGLE_BYTE: u64 = 0xFC;

const VARINT_PREFIX_U16: u8 = 0xFD;
const VARINT_PREFIX_U32: u8 = 0xFE;
const VARINT_PREFIX_U64: u8 = 0xFF;

/// Wire codec errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("Unexpected end of data: needed {needed} bytes, {remaining} remaining")]
    UnexpectedEnd { needed: usize, remaining: usize },
    #[error("Declared length {0} exceeds the remaining data")]
    LengthOverflow(u64),
}

/// Byte order applied to multi-byte integers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Endianness {
    #[default]
    Little,
    Big,
}

/// Growable byte buffer with a cursor
#[derive(Debug, Clone, Default)]
pub struct WireBuffer {
    data: Vec<u8>,
    position: usize,
    endianness: Endianness,
}

macro_rules! primitive_accessors {
    ($get:ident, $put:ident, $ty:ty, $size:expr) => {
        pub fn $get(&mut self) -> Result<$ty, CodecError> {
            let bytes = self.take::<{ $size }>()?;
            Ok(match self.endianness {
                Endianness::Little => <$ty>::from_le_bytes(bytes),
                Endianness::Big => <$ty>::from_be_bytes(bytes),
            })
        }

        pub fn $put(&mut self, value: $ty) {
            let bytes = match self.endianness {
                Endianness::Little => value.to_le_bytes(),
                Endianness::Big => value.to_be_bytes(),
            };
            self.put_bytes(&bytes);
        }
    };
}

impl WireBuffer {
    /// Allocate an empty buffer for writing
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: vec![0u8; capacity],
            position: 0,
            endianness: Endianness::default(),
        }
    }

    /// Wrap existing bytes for reading; the cursor starts at 0
    pub fn wrap(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            data: bytes.into(),
            position: 0,
            endianness: Endianness::default(),
        }
    }

    pub fn endianness(&self) -> Endianness {
        self.endianness
    }

    pub fn set_endianness(&mut self, endianness: Endianness) {
        self.endianness = endianness;
    }

    /// Run `f` under `endianness`, restoring the previous byte order afterwards
    pub fn with_endianness<R>(
        &mut self,
        endianness: Endianness,
        f: impl FnOnce(&mut Self) -> R,
    ) -> R {
        let previous = self.endianness;
        self.endianness = endianness;
        let result = f(self);
        self.endianness = previous;
        result
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn set_position(&mut self, position: usize) {
        self.position = position;
    }

    /// Bytes left between the cursor and the end of the backing storage
    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.position)
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Raw bytes in `start..end`, if that range lies inside the buffer
    pub fn slice(&self, start: usize, end: usize) -> Option<&[u8]> {
        self.data.get(start..end)
    }

    /// Bytes written so far (everything before the cursor)
    pub fn to_bytes(&self) -> Vec<u8> {
        self.data[..self.position.min(self.data.len())].to_vec()
    }

    /// Consume the buffer, keeping only the bytes written so far
    pub fn into_bytes(mut self) -> Vec<u8> {
        let end = self.position.min(self.data.len());
        self.data.truncate(end);
        self.data
    }

    pub fn skip(&mut self, count: usize) -> Result<(), CodecError> {
        self.check_remaining(count)?;
        self.position += count;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Primitives
    // -------------------------------------------------------------------------

    pub fn get_u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take::<1>()?[0])
    }

    pub fn put_u8(&mut self, value: u8) {
        self.put_bytes(&[value]);
    }

    pub fn get_i8(&mut self) -> Result<i8, CodecError> {
        Ok(self.get_u8()? as i8)
    }

    pub fn put_i8(&mut self, value: i8) {
        self.put_u8(value as u8);
    }

    primitive_accessors!(get_u16, put_u16, u16, 2);
    primitive_accessors!(get_i32, put_i32, i32, 4);
    primitive_accessors!(get_u32, put_u32, u32, 4);
    primitive_accessors!(get_i64, put_i64, i64, 8);
    primitive_accessors!(get_u64, put_u64, u64, 8);

    /// Any non-zero byte reads as `true`
    pub fn get_bool(&mut self) -> Result<bool, CodecError> {
        Ok(self.get_u8()? != 0)
    }

    pub fn put_bool(&mut self, value: bool) {
        self.put_u8(u8::from(value));
    }

    // -------------------------------------------------------------------------
    // Varints
    // -------------------------------------------------------------------------

    /// Read a varint; its payload is little-endian whatever the current byte order
    pub fn get_varint(&mut self) -> Result<u64, CodecError> {
        let prefix = self.get_u8()?;
        self.with_endianness(Endianness::Little, |buf| match prefix {
            VARINT_PREFIX_U16 => buf.get_u16().map(u64::from),
            VARINT_PREFIX_U32 => buf.get_u32().map(u64::from),
            VARINT_PREFIX_U64 => buf.get_u64(),
            single => Ok(u64::from(single)),
        })
    }

    pub fn put_varint(&mut self, value: u64) {
        self.with_endianness(Endianness::Little, |buf| {
            if value <= VARINT_MAX_SINGLE_BYTE {
                buf.put_u8(value as u8);
            } else if value <= u64::from(u16::MAX) {
                buf.put_u8(VARINT_PREFIX_U16);
                buf.put_u16(value as u16);
            } else if value <= u64::from(u32::MAX) {
                buf.put_u8(VARINT_PREFIX_U32);
                buf.put_u32(value as u32);
            } else {
                buf.put_u8(VARINT_PREFIX_U64);
                buf.put_u64(value);
            }
        });
    }

    /// Read a varint used as a byte or element count.
    ///
    /// Every counted item occupies at least one byte, so a count larger than
    /// the remaining data can never be satisfied and is rejected up front.
    pub fn get_length(&mut self) -> Result<usize, CodecError> {
        let length = self.get_varint()?;
        match usize::try_from(length) {
            Ok(n) if n <= self.remaining() => Ok(n),
            _ => Err(CodecError::LengthOverflow(length)),
        }
    }

    // -------------------------------------------------------------------------
    // Byte ranges and strings
    // -------------------------------------------------------------------------

    pub fn get_bytes(&mut self, count: usize) -> Result<Vec<u8>, CodecError> {
        self.check_remaining(count)?;
        let bytes = self.data[self.position..self.position + count].to_vec();
        self.position += count;
        Ok(bytes)
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) {
        self.ensure_capacity(bytes.len());
        self.data[self.position..self.position + bytes.len()].copy_from_slice(bytes);
        self.position += bytes.len();
    }

    /// Varint length followed by that many bytes
    pub fn get_var_bytes(&mut self) -> Result<Vec<u8>, CodecError> {
        let length = self.get_length()?;
        self.get_bytes(length)
    }

    pub fn put_var_bytes(&mut self, bytes: &[u8]) {
        self.put_varint(bytes.len() as u64);
        self.put_bytes(bytes);
    }

    pub fn get_var_string(&mut self) -> Result<String, CodecError> {
        let bytes = self.get_var_bytes()?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    pub fn put_var_string(&mut self, value: &str) {
        self.put_var_bytes(value.as_bytes());
    }

    /// Fixed-width string field, terminated by the first NUL byte
    pub fn get_string(&mut self, width: usize) -> Result<String, CodecError> {
        let bytes = self.get_bytes(width)?;
        let end = bytes.iter().position(|&b| b == 0).unwrap_or(width);
        Ok(String::from_utf8_lossy(&bytes[..end]).into_owned())
    }

    /// Write `value` into a fixed-width field, truncating or zero-padding it
    pub fn put_string(&mut self, value: &str, width: usize) {
        let mut field = vec![0u8; width];
        let bytes = value.as_bytes();
        let len = bytes.len().min(width);
        field[..len].copy_from_slice(&bytes[..len]);
        self.put_bytes(&field);
    }

    // -------------------------------------------------------------------------
    // Records and vectors
    // -------------------------------------------------------------------------

    pub fn get_data<T: Decodable>(&mut self) -> Result<T, CodecError> {
        T::decode(self)
    }

    pub fn put_data<T: Encodable + ?Sized>(&mut self, value: &T) {
        value.encode(self);
    }

    /// Varint count followed by `count` records
    pub fn get_vector<T: Decodable>(&mut self) -> Result<Vec<T>, CodecError> {
        let count = self.get_length()?;
        let mut items = Vec::with_capacity(count);
        for _ in 0..count {
            items.push(T::decode(self)?);
        }
        Ok(items)
    }

    pub fn put_vector<T: Encodable>(&mut self, items: &[T]) {
        self.put_varint(items.len() as u64);
        for item in items {
            item.encode(self);
        }
    }

    // Private helpers

    fn take<const N: usize>(&mut self) -> Result<[u8; N], CodecError> {
        self.check_remaining(N)?;
        let mut bytes = [0u8; N];
        bytes.copy_from_slice(&self.data[self.position..self.position + N]);
        self.position += N;
        Ok(bytes)
    }

    fn check_remaining(&self, needed: usize) -> Result<(), CodecError> {
        let remaining = self.remaining();
        if needed > remaining {
            return Err(CodecError::UnexpectedEnd { needed, remaining });
        }
        Ok(())
    }

    fn ensure_capacity(&mut self, size: usize) {
        if self.remaining() < size {
            let new_len = (self.data.len() * 2).max(size * 2).max(self.position + size);
            self.data.resize(new_len, 0);
        }
    }
}

/// Number of bytes `put_varint` uses for `value`
pub fn varint_len(value: u64) -> usize {
    if value <= VARINT_MAX_SINGLE_BYTE {
        1
    } else if value <= u64::from(u16::MAX) {
        3
    } else if value <= u64::from(u32::MAX) {
        5
    } else {
        9
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_growth() {
        let mut buf = WireBuffer::with_capacity(2);
        buf.set_endianness(Endianness::Big);
        buf.put_i8(1);
        buf.put_i8(2);
        buf.put_i64(9);
        assert!(buf.capacity() >= 10);

        buf.set_position(0);
        assert_eq!(buf.get_i8().unwrap(), 1);
        assert_eq!(buf.get_i8().unwrap(), 2);
        assert_eq!(buf.get_i64().unwrap(), 9);
    }

    #[test]
    fn test_growth_preserves_endianness() {
        let mut buf = WireBuffer::with_capacity(1);
        buf.set_endianness(Endianness::Big);
        buf.put_u32(0x0102_0304);
        assert_eq!(buf.endianness(), Endianness::Big);
        assert_eq!(buf.to_bytes(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_unsigned_extremes() {
        let mut buf = WireBuffer::with_capacity(100);
        buf.put_u16(u16::MAX);
        buf.put_u32(i32::MAX as u32 + 2);
        buf.put_u64(i64::MAX as u64 + 10);

        buf.set_position(0);
        assert_eq!(buf.get_u16().unwrap(), u16::MAX);
        assert_eq!(buf.get_u32().unwrap(), 2_147_483_649);
        assert_eq!(buf.get_u64().unwrap(), 9_223_372_036_854_775_817);
    }

    #[test]
    fn test_fixed_string() {
        let mut buf = WireBuffer::with_capacity(100);
        buf.put_string("Satoshi Nakamoto", 7);
        buf.put_string("ping", 12);
        assert_eq!(buf.position(), 19);

        buf.set_position(0);
        assert_eq!(buf.get_string(7).unwrap(), "Satoshi");
        assert_eq!(buf.get_string(12).unwrap(), "ping");
    }

    #[test]
    fn test_booleans() {
        let mut buf = WireBuffer::with_capacity(2);
        buf.put_bool(true);
        buf.put_bool(false);

        buf.set_position(0);
        assert!(buf.get_bool().unwrap());
        assert!(!buf.get_bool().unwrap());
    }

    #[test]
    fn test_varint_thresholds() {
        let cases: [(u64, usize); 9] = [
            (0, 1),
            (0xFC, 1),
            (0xFD, 3),
            (0xFFFF, 3),
            (0x1_0000, 5),
            (0xFFFF_FFFF, 5),
            (0x1_0000_0000, 9),
            (u64::MAX - 1, 9),
            (u64::MAX, 9),
        ];

        for (value, len) in cases {
            let mut buf = WireBuffer::with_capacity(0);
            buf.put_varint(value);
            assert_eq!(buf.position(), len, "length of {:#x}", value);
            assert_eq!(varint_len(value), len);

            let mut reader = WireBuffer::wrap(buf.into_bytes());
            assert_eq!(reader.get_varint().unwrap(), value);
            assert_eq!(reader.remaining(), 0);
        }
    }

    #[test]
    fn test_varint_prefix_bytes() {
        let mut buf = WireBuffer::with_capacity(16);
        buf.put_varint(0x1234);
        buf.put_varint(0x1234_5678);
        assert_eq!(
            buf.to_bytes(),
            vec![0xFD, 0x34, 0x12, 0xFE, 0x78, 0x56, 0x34, 0x12]
        );
    }

    #[test]
    fn test_varint_ignores_big_endian_mode() {
        let mut buf = WireBuffer::with_capacity(4);
        buf.set_endianness(Endianness::Big);
        buf.put_varint(0x0102);
        assert_eq!(buf.to_bytes(), vec![0xFD, 0x02, 0x01]);
        assert_eq!(buf.endianness(), Endianness::Big);
    }

    #[test]
    fn test_endianness_scoping() {
        let mut buf = WireBuffer::with_capacity(8);
        buf.put_u16(0x0102);
        buf.with_endianness(Endianness::Big, |b| b.put_u16(0x0304));
        buf.put_u16(0x0506);
        assert_eq!(buf.endianness(), Endianness::Little);
        assert_eq!(buf.to_bytes(), vec![0x02, 0x01, 0x03, 0x04, 0x06, 0x05]);

        let mut reader = WireBuffer::wrap(buf.into_bytes());
        reader.set_endianness(Endianness::Big);
        let first = reader.with_endianness(Endianness::Little, |b| b.get_u16().unwrap());
        let second = reader.get_u16().unwrap();
        let third = reader.with_endianness(Endianness::Little, |b| b.get_u16().unwrap());
        assert_eq!((first, second, third), (0x0102, 0x0304, 0x0506));
        assert_eq!(reader.endianness(), Endianness::Big);
    }

    #[test]
    fn test_read_past_end() {
        let mut buf = WireBuffer::wrap(vec![1, 2, 3]);
        let err = buf.get_u32().unwrap_err();
        assert_eq!(
            err,
            CodecError::UnexpectedEnd {
                needed: 4,
                remaining: 3
            }
        );
    }

    #[test]
    fn test_length_larger_than_data() {
        // Claims 0x10000 bytes but carries two
        let mut buf = WireBuffer::wrap(vec![0xFE, 0x00, 0x00, 0x01, 0x00, 0xAA, 0xBB]);
        assert_eq!(
            buf.get_var_bytes().unwrap_err(),
            CodecError::LengthOverflow(0x10000)
        );
    }

    #[test]
    fn test_var_string() {
        let mut buf = WireBuffer::with_capacity(0);
        buf.put_var_string("/Satoshi:25.0.0/");
        let bytes = buf.into_bytes();
        assert_eq!(bytes[0], 16);

        let mut reader = WireBuffer::wrap(bytes);
        assert_eq!(reader.get_var_string().unwrap(), "/Satoshi:25.0.0/");
    }
}
