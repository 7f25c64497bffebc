//! Transaction filtering (BIP 37)
//!
//! - Bloom filter sizing and murmur3 hash family
//! - Filter configuration

pub mod bloom;
pub mod config;

pub use bloom::{murmur3_32, BloomFilter, MAX_FILTER_BYTES, MAX_HASH_FUNCS};
pub use config::{BloomFlags, FilterConfig, DEFAULT_FALSE_POSITIVE_RATE};
