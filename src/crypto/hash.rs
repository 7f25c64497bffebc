//! Hashing utilities for the Bitcoin wire format
//!
//! Transaction ids, block hashes and merkle nodes are double SHA-256 digests.
//! They travel in little-endian "wire" order and are displayed byte-reversed.

use crate::codec::{CodecError, Decodable, Encodable, WireBuffer};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Computes SHA-256 hash of the input data
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Computes double SHA-256 hash (SHA-256 of SHA-256)
pub fn double_sha256(data: &[u8]) -> [u8; 32] {
    sha256(&sha256(data))
}

/// First four bytes of the double SHA-256, as used in message headers
pub fn checksum(data: &[u8]) -> [u8; 4] {
    let digest = double_sha256(data);
    [digest[0], digest[1], digest[2], digest[3]]
}

/// A 32-byte digest kept in wire order
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Sha256Hash([u8; 32]);

impl Sha256Hash {
    pub const ZERO: Sha256Hash = Sha256Hash([0u8; 32]);

    /// Wrap bytes that are already in wire order
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Double SHA-256 of `data`
    pub fn hash(data: &[u8]) -> Self {
        Self(double_sha256(data))
    }

    /// Hash of two child nodes concatenated, as in a merkle tree
    pub fn hash_pair(left: &Sha256Hash, right: &Sha256Hash) -> Self {
        let mut data = [0u8; 64];
        data[..32].copy_from_slice(&left.0);
        data[32..].copy_from_slice(&right.0);
        Self::hash(&data)
    }

    /// Parse a display-order (byte-reversed) hex string
    pub fn from_hex(hex_str: &str) -> Result<Self, hex::FromHexError> {
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(hex_str, &mut bytes)?;
        bytes.reverse();
        Ok(Self(bytes))
    }

    /// Display-order hex, as shown by block explorers
    pub fn to_hex(&self) -> String {
        let mut reversed = self.0;
        reversed.reverse();
        hex::encode(reversed)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Copy with the byte order flipped
    pub fn reversed(&self) -> Self {
        let mut bytes = self.0;
        bytes.reverse();
        Self(bytes)
    }
}

impl fmt::Display for Sha256Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Sha256Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Sha256Hash({})", self.to_hex())
    }
}

impl Encodable for Sha256Hash {
    fn encode(&self, buf: &mut WireBuffer) {
        buf.put_bytes(&self.0);
    }
}

impl Decodable for Sha256Hash {
    fn decode(buf: &mut WireBuffer) -> Result<Self, CodecError> {
        <[u8; 32]>::decode(buf).map(Self)
    }
}
