//! BIP 37 bloom filter
//!
//! Peers recompute every bit position on their side, so sizing and hashing
//! must match the reference formulas exactly.

use std::f64::consts::LN_2;

// =============================================================================
// Constants
// =============================================================================

/// Maximum filter size in bytes
pub const MAX_FILTER_BYTES: usize = 36_000;

/// Maximum number of hash functions
pub const MAX_HASH_FUNCS: u32 = 50;

/// Seed multiplier between successive hash functions
const SEED_STEP: u32 = 0xFBA4_C795;

// =============================================================================
// Bloom Filter
// =============================================================================

/// Probabilistic set of byte strings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BloomFilter {
    data: Vec<u8>,
    num_hash_funcs: u32,
    tweak: u32,
}

impl BloomFilter {
    /// Size a filter for `elements` items at false-positive rate `fp_rate`
    pub fn new(elements: usize, fp_rate: f64, tweak: u32) -> Self {
        let n = elements as f64;
        // Reference implementations truncate toward zero at both steps
        let size = (-1.0 / (LN_2 * LN_2) * n * fp_rate.ln()) as i64;
        let size_bytes = (size.clamp(0, (MAX_FILTER_BYTES * 8) as i64) as usize / 8).max(1);
        let nbits = size_bytes * 8;

        let funcs = (nbits as f64 / n * LN_2) as i64;
        let num_hash_funcs = funcs.clamp(1, i64::from(MAX_HASH_FUNCS)) as u32;

        Self {
            data: vec![0u8; size_bytes],
            num_hash_funcs,
            tweak,
        }
    }

    /// Same sizing with a random tweak
    pub fn with_random_tweak(elements: usize, fp_rate: f64) -> Self {
        Self::new(elements, fp_rate, rand::random())
    }

    pub fn insert(&mut self, item: &[u8]) {
        for k in 0..self.num_hash_funcs {
            let idx = self.bit_index(item, k);
            self.data[idx >> 3] |= 1 << (idx & 7);
        }
    }

    /// May report false positives, never false negatives
    pub fn contains(&self, item: &[u8]) -> bool {
        (0..self.num_hash_funcs).all(|k| {
            let idx = self.bit_index(item, k);
            self.data[idx >> 3] & (1 << (idx & 7)) != 0
        })
    }

    pub fn num_hash_funcs(&self) -> u32 {
        self.num_hash_funcs
    }

    pub fn tweak(&self) -> u32 {
        self.tweak
    }

    /// Filter bit field, full size
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn size_bytes(&self) -> usize {
        self.data.len()
    }

    pub fn nbits(&self) -> usize {
        self.data.len() * 8
    }

    pub fn is_empty(&self) -> bool {
        self.data.iter().all(|&b| b == 0)
    }

    // Private helpers

    fn bit_index(&self, item: &[u8], k: u32) -> usize {
        let seed = k.wrapping_mul(SEED_STEP).wrapping_add(self.tweak);
        murmur3_32(item, seed) as usize % self.nbits()
    }
}

/// MurmurHash3 x86 32-bit
pub fn murmur3_32(data: &[u8], seed: u32) -> u32 {
    const C1: u32 = 0xCC9E_2D51;
    const C2: u32 = 0x1B87_3593;

    let mut h1 = seed;
    let mut blocks = data.chunks_exact(4);
    for block in &mut blocks {
        let mut k1 = u32::from_le_bytes([block[0], block[1], block[2], block[3]]);
        k1 = k1.wrapping_mul(C1).rotate_left(15).wrapping_mul(C2);
        h1 ^= k1;
        h1 = h1.rotate_left(13).wrapping_mul(5).wrapping_add(0xE654_6B64);
    }

    let tail = blocks.remainder();
    if !tail.is_empty() {
        let mut k1 = 0u32;
        for (i, &byte) in tail.iter().enumerate() {
            k1 |= u32::from(byte) << (8 * i);
        }
        k1 = k1.wrapping_mul(C1).rotate_left(15).wrapping_mul(C2);
        h1 ^= k1;
    }

    h1 ^= data.len() as u32;
    h1 ^= h1 >> 16;
    h1 = h1.wrapping_mul(0x85EB_CA6B);
    h1 ^= h1 >> 13;
    h1 = h1.wrapping_mul(0xC2B2_AE35);
    h1 ^= h1 >> 16;
    h1
}
