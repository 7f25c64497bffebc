//! btc-listener: a Bitcoin peer-to-peer protocol engine in Rust
//!
//! This crate connects to a single Bitcoin node and listens for traffic:
//! - Wire codec for the little-endian, varint-prefixed record format
//! - Message framing with magic and checksum verification
//! - Version/verack handshake, ping/pong and inventory requests
//! - BIP 37 bloom filters built from watched addresses
//! - Partial merkle tree verification of filtered blocks
//! - Listener callbacks for connection events, transactions and blocks
//!
//! # Example
//!
//! ```no_run
//! use btc_listener::network::{Connection, NetworkParameters};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let connection = Connection::for_network(NetworkParameters::Testnet3);
//! connection.set_filter_list(vec!["mxq6Fg4ygVU8tdHRvUifPzQFsQJX4XEamF".to_string()])?;
//!
//! connection.on_transaction(|tx, _| {
//!     println!("tx {} pays {} sat", tx.txid(), tx.total_output());
//!     Ok(())
//! });
//!
//! connection.connect("127.0.0.1:18333".parse()?).await?;
//! # Ok(())
//! # }
//! ```

pub mod cli;
pub mod codec;
pub mod crypto;
pub mod filter;
pub mod network;

// Re-export commonly used types
pub use codec::{CodecError, Decodable, Encodable, Endianness, WireBuffer};
pub use crypto::{address_hash, MerkleError, PartialMerkleTree, Sha256Hash};
pub use filter::{BloomFilter, BloomFlags, FilterConfig};
pub use network::{
    BlockEvent, Connection, ConnectionConfig, ConnectionError, ConnectionEvent, ConnectionState,
    Message, MessageCodec, NetworkParameters, ServiceFlags,
};
