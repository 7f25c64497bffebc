//! Cryptographic utilities for the peer protocol
//!
//! This module provides:
//! - SHA-256 / double SHA-256 hashing and the wire-order hash type
//! - Partial merkle tree verification for filtered blocks
//! - Address string to HASH160 decoding

pub mod address;
pub mod hash;
pub mod merkle;

pub use address::{address_hash, AddressError, ADDRESS_HASH_LEN};
pub use hash::{checksum, double_sha256, sha256, Sha256Hash};
pub use merkle::{unpack_flags, MerkleError, PartialMerkleTree};
