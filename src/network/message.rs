//! Protocol message types
//!
//! Each message implements `Encodable`, `Decodable` or both, depending on the
//! directions this engine uses it in. Inbound payloads are turned into a
//! `Message` through a static command table.

use crate::codec::{CodecError, Decodable, Encodable, Endianness, WireBuffer};
use crate::crypto::{MerkleError, PartialMerkleTree, Sha256Hash};
use crate::filter::{BloomFilter, BloomFlags};
use std::fmt;

use super::params::ServiceFlags;
use super::types::{BlockHeader, InventoryVector, NetAddress, TxIn, TxOut};

/// Protocol version this engine speaks
pub const PROTOCOL_VERSION: i32 = 70015;

/// Peers below this version do not expect a `verack`
pub const MIN_VERACK_VERSION: i32 = 209;

/// First version whose `version` message carries the relay flag
pub const RELAY_FLAG_VERSION: i32 = 70001;

/// A message with a wire command name
pub trait ProtocolMessage {
    const COMMAND: &'static str;
}

// =============================================================================
// Handshake
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Version {
    pub version: i32,
    pub services: ServiceFlags,
    pub timestamp: i64,
    pub addr_recv: NetAddress,
    pub addr_from: NetAddress,
    pub nonce: u64,
    pub user_agent: String,
    pub start_height: i32,
    pub relay: bool,
}

impl Version {
    /// Outbound version with the current time and a random nonce
    pub fn new(
        version: i32,
        addr_recv: NetAddress,
        user_agent: impl Into<String>,
        start_height: i32,
        relay: bool,
    ) -> Self {
        Self {
            version,
            services: ServiceFlags::empty(),
            timestamp: chrono::Utc::now().timestamp(),
            addr_recv,
            addr_from: NetAddress::unspecified(ServiceFlags::empty()),
            nonce: rand::random(),
            user_agent: user_agent.into(),
            start_height,
            relay,
        }
    }
}

impl ProtocolMessage for Version {
    const COMMAND: &'static str = "version";
}

impl Encodable for Version {
    fn encode(&self, buf: &mut WireBuffer) {
        buf.with_endianness(Endianness::Little, |buf| {
            buf.put_i32(self.version);
            buf.put_u64(self.services.bits());
            buf.put_i64(self.timestamp);
            buf.put_data(&self.addr_recv);
            buf.put_data(&self.addr_from);
            buf.put_u64(self.nonce);
            buf.put_var_string(&self.user_agent);
            buf.put_i32(self.start_height);
            if self.version > RELAY_FLAG_VERSION {
                buf.put_bool(self.relay);
            }
        });
    }
}

impl Decodable for Version {
    fn decode(buf: &mut WireBuffer) -> Result<Self, CodecError> {
        buf.with_endianness(Endianness::Little, |buf| {
            let version = buf.get_i32()?;
            let services = ServiceFlags::from_bits_retain(buf.get_u64()?);
            let timestamp = buf.get_i64()?;
            let addr_recv = buf.get_data()?;
            let addr_from = buf.get_data()?;
            let nonce = buf.get_u64()?;
            let user_agent = buf.get_var_string()?;
            let start_height = if version >= MIN_VERACK_VERSION {
                buf.get_i32()?
            } else {
                -1
            };
            // Some peers omit the flag even when their version implies it
            let relay = if version > RELAY_FLAG_VERSION && buf.remaining() > 0 {
                buf.get_bool()?
            } else {
                true
            };

            Ok(Self {
                version,
                services,
                timestamp,
                addr_recv,
                addr_from,
                nonce,
                user_agent,
                start_height,
                relay,
            })
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Verack;

impl ProtocolMessage for Verack {
    const COMMAND: &'static str = "verack";
}

impl Encodable for Verack {
    fn encode(&self, _buf: &mut WireBuffer) {}
}

impl Decodable for Verack {
    fn decode(_buf: &mut WireBuffer) -> Result<Self, CodecError> {
        Ok(Verack)
    }
}

// =============================================================================
// Keep-alive
// =============================================================================

/// `ping`; peers older than BIP 31 send no nonce
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ping {
    pub nonce: Option<u64>,
}

impl ProtocolMessage for Ping {
    const COMMAND: &'static str = "ping";
}

impl Encodable for Ping {
    fn encode(&self, buf: &mut WireBuffer) {
        if let Some(nonce) = self.nonce {
            buf.with_endianness(Endianness::Little, |buf| buf.put_u64(nonce));
        }
    }
}

impl Decodable for Ping {
    fn decode(buf: &mut WireBuffer) -> Result<Self, CodecError> {
        let nonce = if buf.remaining() > 0 {
            Some(buf.with_endianness(Endianness::Little, |buf| buf.get_u64())?)
        } else {
            None
        };
        Ok(Self { nonce })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pong {
    pub nonce: u64,
}

impl ProtocolMessage for Pong {
    const COMMAND: &'static str = "pong";
}

impl Encodable for Pong {
    fn encode(&self, buf: &mut WireBuffer) {
        buf.with_endianness(Endianness::Little, |buf| buf.put_u64(self.nonce));
    }
}

// =============================================================================
// Inventory
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inv {
    pub inventory: Vec<InventoryVector>,
}

impl ProtocolMessage for Inv {
    const COMMAND: &'static str = "inv";
}

impl Decodable for Inv {
    fn decode(buf: &mut WireBuffer) -> Result<Self, CodecError> {
        Ok(Self {
            inventory: buf.get_vector()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetData {
    pub inventory: Vec<InventoryVector>,
}

impl ProtocolMessage for GetData {
    const COMMAND: &'static str = "getdata";
}

impl Encodable for GetData {
    fn encode(&self, buf: &mut WireBuffer) {
        buf.put_vector(&self.inventory);
    }
}

// =============================================================================
// Filtering
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterLoad {
    pub filter: Vec<u8>,
    pub num_hash_funcs: u32,
    pub tweak: u32,
    pub flags: BloomFlags,
}

impl FilterLoad {
    pub fn from_filter(filter: &BloomFilter, flags: BloomFlags) -> Self {
        Self {
            filter: filter.as_bytes().to_vec(),
            num_hash_funcs: filter.num_hash_funcs(),
            tweak: filter.tweak(),
            flags,
        }
    }
}

impl ProtocolMessage for FilterLoad {
    const COMMAND: &'static str = "filterload";
}

impl Encodable for FilterLoad {
    fn encode(&self, buf: &mut WireBuffer) {
        buf.with_endianness(Endianness::Little, |buf| {
            buf.put_var_bytes(&self.filter);
            buf.put_u32(self.num_hash_funcs);
            buf.put_u32(self.tweak);
            buf.put_u8(self.flags.as_u8());
        });
    }
}

// =============================================================================
// Transactions
// =============================================================================

#[derive(Clone, PartialEq, Eq)]
pub struct Tx {
    pub version: i32,
    pub inputs: Vec<TxIn>,
    pub outputs: Vec<TxOut>,
    pub lock_time: u32,
    txid: Sha256Hash,
}

impl Tx {
    pub fn new(version: i32, inputs: Vec<TxIn>, outputs: Vec<TxOut>, lock_time: u32) -> Self {
        let mut tx = Self {
            version,
            inputs,
            outputs,
            lock_time,
            txid: Sha256Hash::ZERO,
        };
        tx.txid = Sha256Hash::hash(&tx.to_wire_bytes());
        tx
    }

    /// Double SHA-256 of the serialized transaction, in wire order
    pub fn txid(&self) -> Sha256Hash {
        self.txid
    }

    /// Sum of output values in satoshis
    pub fn total_output(&self) -> i64 {
        self.outputs.iter().map(|out| out.value).sum()
    }

    pub fn is_coinbase(&self) -> bool {
        self.inputs.len() == 1 && self.inputs[0].previous_output.is_null()
    }
}

impl fmt::Debug for Tx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tx")
            .field("txid", &self.txid)
            .field("version", &self.version)
            .field("inputs", &self.inputs.len())
            .field("outputs", &self.outputs.len())
            .field("lock_time", &self.lock_time)
            .finish()
    }
}

impl ProtocolMessage for Tx {
    const COMMAND: &'static str = "tx";
}

impl Encodable for Tx {
    fn encode(&self, buf: &mut WireBuffer) {
        buf.with_endianness(Endianness::Little, |buf| {
            buf.put_i32(self.version);
            buf.put_vector(&self.inputs);
            buf.put_vector(&self.outputs);
            buf.put_u32(self.lock_time);
        });
    }
}

impl Decodable for Tx {
    fn decode(buf: &mut WireBuffer) -> Result<Self, CodecError> {
        buf.with_endianness(Endianness::Little, |buf| {
            let start = buf.position();
            let version = buf.get_i32()?;
            let inputs = buf.get_vector()?;
            let outputs = buf.get_vector()?;
            let lock_time = buf.get_u32()?;
            // Identity is over the consumed bytes, not a re-serialization
            let txid = buf
                .slice(start, buf.position())
                .map(Sha256Hash::hash)
                .unwrap_or_default();

            Ok(Self {
                version,
                inputs,
                outputs,
                lock_time,
                txid,
            })
        })
    }
}

// =============================================================================
// Blocks
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Tx>,
}

impl Block {
    pub fn hash(&self) -> Sha256Hash {
        self.header.hash()
    }
}

impl ProtocolMessage for Block {
    const COMMAND: &'static str = "block";
}

impl Decodable for Block {
    fn decode(buf: &mut WireBuffer) -> Result<Self, CodecError> {
        Ok(Self {
            header: buf.get_data()?,
            transactions: buf.get_vector()?,
        })
    }
}

/// Block header plus a partial merkle tree proving the matched transactions
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MerkleBlock {
    pub header: BlockHeader,
    pub total_transactions: u32,
    pub hashes: Vec<Sha256Hash>,
    pub flags: Vec<u8>,
}

impl MerkleBlock {
    pub fn hash(&self) -> Sha256Hash {
        self.header.hash()
    }

    /// Rebuild the proof and check it against the header's merkle root
    pub fn verify(&self) -> Result<PartialMerkleTree, MerkleError> {
        let tree = PartialMerkleTree::from_flag_bytes(
            self.hashes.clone(),
            self.total_transactions,
            &self.flags,
        )?;
        tree.verify_root(&self.header.merkle_root)?;
        Ok(tree)
    }
}

impl ProtocolMessage for MerkleBlock {
    const COMMAND: &'static str = "merkleblock";
}

impl Decodable for MerkleBlock {
    fn decode(buf: &mut WireBuffer) -> Result<Self, CodecError> {
        let header: BlockHeader = buf.get_data()?;
        buf.with_endianness(Endianness::Little, |buf| {
            Ok(Self {
                header,
                total_transactions: buf.get_u32()?,
                hashes: buf.get_vector()?,
                flags: buf.get_var_bytes()?,
            })
        })
    }
}

/// A `merkleblock` whose proof has been verified
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilteredBlock {
    pub header: BlockHeader,
    pub total_transactions: u32,
    /// Transactions proven to be in the block, in wire order
    pub matched_tx_ids: Vec<Sha256Hash>,
}

impl FilteredBlock {
    pub fn hash(&self) -> Sha256Hash {
        self.header.hash()
    }
}

impl TryFrom<MerkleBlock> for FilteredBlock {
    type Error = MerkleError;

    fn try_from(block: MerkleBlock) -> Result<Self, Self::Error> {
        let tree = block.verify()?;
        Ok(Self {
            header: block.header,
            total_transactions: block.total_transactions,
            matched_tx_ids: tree.matched_tx_ids().to_vec(),
        })
    }
}

// =============================================================================
// Inbound dispatch
// =============================================================================

/// Any message this engine accepts from a peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Version(Version),
    Verack,
    Ping(Ping),
    Inv(Inv),
    Tx(Tx),
    Block(Block),
    MerkleBlock(MerkleBlock),
}

type DecodeFn = fn(&mut WireBuffer) -> Result<Message, CodecError>;

/// Command name to decoder
static DECODERS: &[(&str, DecodeFn)] = &[
    (Version::COMMAND, decode_version),
    (Verack::COMMAND, decode_verack),
    (Ping::COMMAND, decode_ping),
    (Inv::COMMAND, decode_inv),
    (Tx::COMMAND, decode_tx),
    (Block::COMMAND, decode_block),
    (MerkleBlock::COMMAND, decode_merkle_block),
];

fn decode_version(buf: &mut WireBuffer) -> Result<Message, CodecError> {
    Version::decode(buf).map(Message::Version)
}

fn decode_verack(buf: &mut WireBuffer) -> Result<Message, CodecError> {
    Verack::decode(buf).map(|_| Message::Verack)
}

fn decode_ping(buf: &mut WireBuffer) -> Result<Message, CodecError> {
    Ping::decode(buf).map(Message::Ping)
}

fn decode_inv(buf: &mut WireBuffer) -> Result<Message, CodecError> {
    Inv::decode(buf).map(Message::Inv)
}

fn decode_tx(buf: &mut WireBuffer) -> Result<Message, CodecError> {
    Tx::decode(buf).map(Message::Tx)
}

fn decode_block(buf: &mut WireBuffer) -> Result<Message, CodecError> {
    Block::decode(buf).map(Message::Block)
}

fn decode_merkle_block(buf: &mut WireBuffer) -> Result<Message, CodecError> {
    MerkleBlock::decode(buf).map(Message::MerkleBlock)
}

impl Message {
    /// Decode a payload by command name; `Ok(None)` for commands without a decoder
    pub fn decode(command: &str, payload: &[u8]) -> Result<Option<Message>, CodecError> {
        let Some((_, decode)) = DECODERS.iter().find(|(name, _)| *name == command) else {
            return Ok(None);
        };
        let mut buf = WireBuffer::wrap(payload.to_vec());
        decode(&mut buf).map(Some)
    }

    /// Whether a decoder exists for `command`
    pub fn is_known(command: &str) -> bool {
        DECODERS.iter().any(|(name, _)| *name == command)
    }

    pub fn command(&self) -> &'static str {
        match self {
            Message::Version(_) => Version::COMMAND,
            Message::Verack => Verack::COMMAND,
            Message::Ping(_) => Ping::COMMAND,
            Message::Inv(_) => Inv::COMMAND,
            Message::Tx(_) => Tx::COMMAND,
            Message::Block(_) => Block::COMMAND,
            Message::MerkleBlock(_) => MerkleBlock::COMMAND,
        }
    }
}

/// An outbound command with its serialized payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    pub command: String,
    pub payload: Vec<u8>,
}

impl RawMessage {
    pub fn new(command: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            command: command.into(),
            payload,
        }
    }

    pub fn from_message<M: ProtocolMessage + Encodable>(message: &M) -> Self {
        Self::new(M::COMMAND, message.to_wire_bytes())
    }
}
