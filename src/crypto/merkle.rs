//! Partial merkle tree verification
//!
//! A `merkleblock` proves that a set of transactions belongs to a block
//! without sending the whole block. The proof is a depth-first walk of the
//! block's merkle tree: one flag bit per visited node and one hash per node
//! that is either pruned or a matched leaf. Rebuilding the tree from that walk
//! must reproduce the merkle root in the block header.

use super::hash::Sha256Hash;
use thiserror::Error;

/// Merkle proof validation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MerkleError {
    #[error("Proof covers zero transactions")]
    NoTransactions,
    #[error("Proof carries {hashes} hashes for {transactions} transactions")]
    TooManyHashes { hashes: usize, transactions: u32 },
    #[error("Ran out of flag bits while walking the tree")]
    FlagsExhausted,
    #[error("Ran out of hashes while walking the tree")]
    HashesExhausted,
    #[error("{0} hashes left unused after walking the tree")]
    UnusedHashes(usize),
    #[error("Flag bits left unused after walking the tree")]
    UnusedFlags,
    #[error("Identical sibling hashes at height {height}, index {index}")]
    DuplicateSiblings { height: u32, index: u32 },
    #[error("Merkle root mismatch: header has {expected}, proof yields {computed}")]
    RootMismatch {
        expected: Sha256Hash,
        computed: Sha256Hash,
    },
}

#[derive(Debug, Clone)]
struct TreeNode {
    hash: Option<Sha256Hash>,
    left: Option<usize>,
    right: Option<usize>,
    height: u32,
    index: u32,
}

impl TreeNode {
    fn new(height: u32, index: u32) -> Self {
        Self {
            hash: None,
            left: None,
            right: None,
            height,
            index,
        }
    }
}

/// A reconstructed, validated partial merkle tree
#[derive(Debug, Clone)]
pub struct PartialMerkleTree {
    total_transactions: u32,
    height: u32,
    merkle_root: Sha256Hash,
    matched_tx_ids: Vec<Sha256Hash>,
}

impl PartialMerkleTree {
    /// Rebuild the tree from a proof.
    ///
    /// `hashes` are in depth-first order and wire byte order. Fails on any
    /// leftover hash, on flag bits left over beyond the final byte's padding,
    /// and on identical sibling hashes.
    pub fn build(
        hashes: Vec<Sha256Hash>,
        total_transactions: u32,
        flags: Vec<bool>,
    ) -> Result<Self, MerkleError> {
        if total_transactions == 0 {
            return Err(MerkleError::NoTransactions);
        }
        if hashes.len() > total_transactions as usize {
            return Err(MerkleError::TooManyHashes {
                hashes: hashes.len(),
                transactions: total_transactions,
            });
        }

        let height = tree_height(total_transactions);
        let mut nodes = vec![TreeNode::new(0, 0)];
        let mut matched_tx_ids = Vec::new();
        let mut hashes = hashes.into_iter();
        let mut flag_bits = flags.iter().copied();
        let mut flags_used = 0usize;

        // Depth-first, left child first
        let mut stack = vec![0usize];
        while let Some(id) = stack.pop() {
            let flag = flag_bits.next().ok_or(MerkleError::FlagsExhausted)?;
            flags_used += 1;
            let (node_height, node_index) = (nodes[id].height, nodes[id].index);

            if flag && node_height < height {
                let left_index = node_index * 2;
                let has_right =
                    nodes_at(total_transactions, height, node_height + 1) > left_index + 1;

                let left = nodes.len();
                nodes.push(TreeNode::new(node_height + 1, left_index));
                nodes[id].left = Some(left);

                if has_right {
                    let right = nodes.len();
                    nodes.push(TreeNode::new(node_height + 1, left_index + 1));
                    nodes[id].right = Some(right);
                    stack.push(right);
                }
                stack.push(left);
            } else {
                let hash = hashes.next().ok_or(MerkleError::HashesExhausted)?;
                if flag {
                    matched_tx_ids.push(hash);
                }
                nodes[id].hash = Some(hash);
            }
        }

        let unused = hashes.len();
        if unused > 0 {
            return Err(MerkleError::UnusedHashes(unused));
        }
        // Only zero padding up to the end of the last flag byte is tolerated
        let padded_len = (flags_used + 7) / 8 * 8;
        if flags.len() > padded_len || flags[flags_used..].iter().any(|&f| f) {
            return Err(MerkleError::UnusedFlags);
        }

        let merkle_root = fill_missing_hashes(&mut nodes, 0)?;

        Ok(Self {
            total_transactions,
            height,
            merkle_root,
            matched_tx_ids,
        })
    }

    /// Build from the packed flag bytes of a `merkleblock` (least significant bit first)
    pub fn from_flag_bytes(
        hashes: Vec<Sha256Hash>,
        total_transactions: u32,
        flag_bytes: &[u8],
    ) -> Result<Self, MerkleError> {
        Self::build(hashes, total_transactions, unpack_flags(flag_bytes))
    }

    /// Reconstructed root in wire order
    pub fn merkle_root(&self) -> Sha256Hash {
        self.merkle_root
    }

    /// Transaction ids proven to be in the block, in tree order
    pub fn matched_tx_ids(&self) -> &[Sha256Hash] {
        &self.matched_tx_ids
    }

    pub fn total_transactions(&self) -> u32 {
        self.total_transactions
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Check the reconstructed root against a block header's merkle root
    pub fn verify_root(&self, expected: &Sha256Hash) -> Result<(), MerkleError> {
        if self.merkle_root != *expected {
            return Err(MerkleError::RootMismatch {
                expected: *expected,
                computed: self.merkle_root,
            });
        }
        Ok(())
    }
}

/// Expand flag bytes into bits, least significant bit of each byte first
pub fn unpack_flags(bytes: &[u8]) -> Vec<bool> {
    bytes
        .iter()
        .flat_map(|byte| (0..8).map(move |bit| byte & (1 << bit) != 0))
        .collect()
}

/// ceil(log2(total)), i.e. the depth of the leaves
fn tree_height(total: u32) -> u32 {
    let mut height = 0;
    while (1u64 << height) < u64::from(total) {
        height += 1;
    }
    height
}

/// Number of nodes at `level`: ceil(total / 2^(height - level))
fn nodes_at(total: u32, height: u32, level: u32) -> u32 {
    let shift = height - level;
    ((u64::from(total) + (1u64 << shift) - 1) >> shift) as u32
}

fn fill_missing_hashes(nodes: &mut [TreeNode], id: usize) -> Result<Sha256Hash, MerkleError> {
    if let Some(hash) = nodes[id].hash {
        return Ok(hash);
    }

    // A node without a hash always had its flag set, so it has a left child
    let left_id = nodes[id].left.ok_or(MerkleError::HashesExhausted)?;
    let left = fill_missing_hashes(nodes, left_id)?;
    let right = match nodes[id].right {
        Some(right_id) => {
            let right = fill_missing_hashes(nodes, right_id)?;
            if right == left {
                return Err(MerkleError::DuplicateSiblings {
                    height: nodes[right_id].height,
                    index: nodes[right_id].index,
                });
            }
            right
        }
        None => left,
    };

    let hash = Sha256Hash::hash_pair(&left, &right);
    nodes[id].hash = Some(hash);
    Ok(hash)
}
