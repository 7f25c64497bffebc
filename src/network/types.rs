//! Records embedded in protocol messages

use crate::codec::{CodecError, Decodable, Encodable, Endianness, WireBuffer};
use crate::crypto::Sha256Hash;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use super::params::ServiceFlags;

// =============================================================================
// Network address
// =============================================================================

/// Peer address as carried in `version` (no timestamp prefix)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetAddress {
    pub services: ServiceFlags,
    pub ip: Ipv6Addr,
    pub port: u16,
}

impl NetAddress {
    pub fn new(addr: SocketAddr, services: ServiceFlags) -> Self {
        let ip = match addr.ip() {
            IpAddr::V4(v4) => v4.to_ipv6_mapped(),
            IpAddr::V6(v6) => v6,
        };
        Self {
            services,
            ip,
            port: addr.port(),
        }
    }

    /// `0.0.0.0:0`, used when the local address is unknown
    pub fn unspecified(services: ServiceFlags) -> Self {
        Self::new(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)), services)
    }

    pub fn socket_addr(&self) -> SocketAddr {
        match self.ip.to_ipv4_mapped() {
            Some(v4) => SocketAddr::from((v4, self.port)),
            None => SocketAddr::from((self.ip, self.port)),
        }
    }
}

impl Encodable for NetAddress {
    fn encode(&self, buf: &mut WireBuffer) {
        buf.with_endianness(Endianness::Little, |buf| {
            buf.put_u64(self.services.bits());
            buf.put_bytes(&self.ip.octets());
            // Port is the one big-endian field of the protocol
            buf.with_endianness(Endianness::Big, |buf| buf.put_u16(self.port));
        });
    }
}

impl Decodable for NetAddress {
    fn decode(buf: &mut WireBuffer) -> Result<Self, CodecError> {
        buf.with_endianness(Endianness::Little, |buf| {
            let services = ServiceFlags::from_bits_retain(buf.get_u64()?);
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&buf.get_bytes(16)?);
            let port = buf.with_endianness(Endianness::Big, |buf| buf.get_u16())?;
            Ok(Self {
                services,
                ip: Ipv6Addr::from(octets),
                port,
            })
        })
    }
}

// =============================================================================
// Inventory
// =============================================================================

/// Kind of object an inventory vector refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InventoryType {
    Error,
    Tx,
    Block,
    FilteredBlock,
    /// Any type this engine does not act on (witness, compact blocks, ...)
    Other(u32),
}

impl InventoryType {
    pub fn as_u32(self) -> u32 {
        match self {
            InventoryType::Error => 0,
            InventoryType::Tx => 1,
            InventoryType::Block => 2,
            InventoryType::FilteredBlock => 3,
            InventoryType::Other(value) => value,
        }
    }
}

impl From<u32> for InventoryType {
    fn from(value: u32) -> Self {
        match value {
            0 => InventoryType::Error,
            1 => InventoryType::Tx,
            2 => InventoryType::Block,
            3 => InventoryType::FilteredBlock,
            other => InventoryType::Other(other),
        }
    }
}

/// (type, hash) pair advertising or requesting an object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InventoryVector {
    pub inv_type: InventoryType,
    pub hash: Sha256Hash,
}

impl InventoryVector {
    pub fn new(inv_type: InventoryType, hash: Sha256Hash) -> Self {
        Self { inv_type, hash }
    }
}

impl Encodable for InventoryVector {
    fn encode(&self, buf: &mut WireBuffer) {
        buf.with_endianness(Endianness::Little, |buf| {
            buf.put_u32(self.inv_type.as_u32());
            buf.put_data(&self.hash);
        });
    }
}

impl Decodable for InventoryVector {
    fn decode(buf: &mut WireBuffer) -> Result<Self, CodecError> {
        buf.with_endianness(Endianness::Little, |buf| {
            let inv_type = InventoryType::from(buf.get_u32()?);
            let hash = buf.get_data()?;
            Ok(Self { inv_type, hash })
        })
    }
}

// =============================================================================
// Transaction components
// =============================================================================

/// Reference to an output of a previous transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OutPoint {
    pub hash: Sha256Hash,
    pub index: u32,
}

impl OutPoint {
    /// Coinbase inputs spend the null outpoint
    pub fn is_null(&self) -> bool {
        self.hash == Sha256Hash::ZERO && self.index == u32::MAX
    }
}

impl Encodable for OutPoint {
    fn encode(&self, buf: &mut WireBuffer) {
        buf.put_data(&self.hash);
        buf.put_u32(self.index);
    }
}

impl Decodable for OutPoint {
    fn decode(buf: &mut WireBuffer) -> Result<Self, CodecError> {
        Ok(Self {
            hash: buf.get_data()?,
            index: buf.get_u32()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxIn {
    pub previous_output: OutPoint,
    pub signature_script: Vec<u8>,
    pub sequence: u32,
}

impl Encodable for TxIn {
    fn encode(&self, buf: &mut WireBuffer) {
        buf.put_data(&self.previous_output);
        buf.put_var_bytes(&self.signature_script);
        buf.put_u32(self.sequence);
    }
}

impl Decodable for TxIn {
    fn decode(buf: &mut WireBuffer) -> Result<Self, CodecError> {
        Ok(Self {
            previous_output: buf.get_data()?,
            signature_script: buf.get_var_bytes()?,
            sequence: buf.get_u32()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxOut {
    /// Amount in satoshis
    pub value: i64,
    pub pk_script: Vec<u8>,
}

impl Encodable for TxOut {
    fn encode(&self, buf: &mut WireBuffer) {
        buf.put_i64(self.value);
        buf.put_var_bytes(&self.pk_script);
    }
}

impl Decodable for TxOut {
    fn decode(buf: &mut WireBuffer) -> Result<Self, CodecError> {
        Ok(Self {
            value: buf.get_i64()?,
            pk_script: buf.get_var_bytes()?,
        })
    }
}

// =============================================================================
// Block header
// =============================================================================

/// Serialized size of a block header
pub const BLOCK_HEADER_SIZE: usize = 80;

/// Header shared by `block` and `merkleblock`
#[derive(Clone, PartialEq, Eq)]
pub struct BlockHeader {
    pub version: i32,
    pub prev_block: Sha256Hash,
    pub merkle_root: Sha256Hash,
    pub timestamp: u32,
    pub bits: u32,
    pub nonce: u32,
    /// Double SHA-256 of the 80 bytes this header was decoded from
    hash: Sha256Hash,
}

impl BlockHeader {
    pub fn hash(&self) -> Sha256Hash {
        self.hash
    }

    pub fn time(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_opt(i64::from(self.timestamp), 0).single()
    }
}

impl fmt::Debug for BlockHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockHeader")
            .field("hash", &self.hash)
            .field("version", &self.version)
            .field("prev_block", &self.prev_block)
            .field("merkle_root", &self.merkle_root)
            .field("timestamp", &self.timestamp)
            .field("bits", &format_args!("{:#010x}", self.bits))
            .field("nonce", &self.nonce)
            .finish()
    }
}

impl Decodable for BlockHeader {
    fn decode(buf: &mut WireBuffer) -> Result<Self, CodecError> {
        buf.with_endianness(Endianness::Little, |buf| {
            let start = buf.position();
            let version = buf.get_i32()?;
            let prev_block = buf.get_data()?;
            let merkle_root = buf.get_data()?;
            let timestamp = buf.get_u32()?;
            let bits = buf.get_u32()?;
            let nonce = buf.get_u32()?;
            let raw = buf
                .slice(start, buf.position())
                .ok_or(CodecError::UnexpectedEnd {
                    needed: BLOCK_HEADER_SIZE,
                    remaining: 0,
                })?;

            Ok(Self {
                version,
                prev_block,
                merkle_root,
                timestamp,
                bits,
                nonce,
                hash: Sha256Hash::hash(raw),
            })
        })
    }
}
