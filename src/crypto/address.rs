//! Address strings to 20-byte hashes
//!
//! Bloom filters match on the hash inside an address, not on the address text.
//! Base58check (P2PKH/P2SH) and bech32 v0 (P2WPKH) addresses are supported.

use super::hash::double_sha256;
use bech32::FromBase32;
use thiserror::Error;

/// Length of a HASH160 payload
pub const ADDRESS_HASH_LEN: usize = 20;

/// Address parsing errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AddressError {
    #[error("Unrecognized address: {0}")]
    Unrecognized(String),
    #[error("Address payload is {0} bytes, expected 20")]
    UnexpectedLength(usize),
}

/// Extract the 20-byte hash from a base58check or bech32 address
pub fn address_hash(address: &str) -> Result<[u8; ADDRESS_HASH_LEN], AddressError> {
    let payload = match decode_bech32(address) {
        Some(program) => program,
        None => decode_base58check(address)
            .ok_or_else(|| AddressError::Unrecognized(address.to_string()))?,
    };

    if payload.len() != ADDRESS_HASH_LEN {
        return Err(AddressError::UnexpectedLength(payload.len()));
    }
    let mut hash = [0u8; ADDRESS_HASH_LEN];
    hash.copy_from_slice(&payload);
    Ok(hash)
}

/// Returns the witness program of a segwit address
fn decode_bech32(address: &str) -> Option<Vec<u8>> {
    let (_hrp, data, _variant) = bech32::decode(address).ok()?;
    // First 5-bit group is the witness version
    let program = data.get(1..)?;
    Vec::<u8>::from_base32(program).ok()
}

/// Returns the payload after the version byte, with the checksum verified
fn decode_base58check(address: &str) -> Option<Vec<u8>> {
    let raw = bs58::decode(address).into_vec().ok()?;
    if raw.len() < 5 {
        return None;
    }
    let (body, check) = raw.split_at(raw.len() - 4);
    if double_sha256(body)[..4] != *check {
        return None;
    }
    Some(body[1..].to_vec())
}
