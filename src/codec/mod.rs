//! Wire codec
//!
//! Low-level byte handling shared by every protocol record:
//! - Cursor-based buffer with switchable byte order
//! - Variable-length integers
//! - Length-prefixed bytes, strings and vectors

pub mod buffer;
pub mod encoding;

pub use buffer::{varint_len, CodecError, Endianness, WireBuffer, VARINT_MAX_SINGLE_BYTE};
pub use encoding::{Decodable, Encodable};
