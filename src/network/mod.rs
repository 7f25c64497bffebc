//! Peer-to-peer protocol engine
//!
//! Speaks the Bitcoin wire protocol to a single peer.
//!
//! # Features
//! - Network parameters and service bits
//! - Message types with a static command registry
//! - tokio-util framing with checksum verification
//! - Version/verack handshake and keep-alive
//! - Bloom filter installation and filtered block delivery
//! - Isolated listener dispatch

pub mod codec;
pub mod config;
pub mod connection;
pub mod listener;
pub mod message;
pub mod params;
pub mod types;

pub use codec::{FramingError, MessageCodec, COMMAND_SIZE, HEADER_SIZE, MAX_PAYLOAD_SIZE};
pub use config::{ConfigError, ConnectionConfig};
pub use connection::{Connection, ConnectionError, ConnectionState};
pub use listener::{
    BlockCallback, BlockEvent, ConnectionCallback, ConnectionEvent, ListenerId, ListenerRegistry,
    ListenerResult, TransactionCallback,
};
pub use message::{
    Block, FilterLoad, FilteredBlock, GetData, Inv, MerkleBlock, Message, Ping, Pong,
    ProtocolMessage, RawMessage, Tx, Verack, Version, MIN_VERACK_VERSION, PROTOCOL_VERSION,
    RELAY_FLAG_VERSION,
};
pub use params::{NetworkParameters, ServiceFlags};
pub use types::{
    BlockHeader, InventoryType, InventoryVector, NetAddress, OutPoint, TxIn, TxOut,
    BLOCK_HEADER_SIZE,
};
