/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Merkle inclusion proofs.
//!
//! [`proofs_from_byte_slices`] builds the whole tree once and emits one [`Proof`] per item. The
//! intermediate tree lives in an arena of nodes addressed by index, with sibling and parent links
//! stored as indices into the arena.

use std::fmt::{self, Display, Formatter};

use borsh::{BorshDeserialize, BorshSerialize};

use crate::types::basic::CryptoHash;

use super::tree::{empty_hash, get_split_point, inner_hash, leaf_hash};

/// Upper bound on the number of aunts accepted in a [`Proof`]. A tree with 2^100 leaves is not
/// constructible, so anything longer is malformed by definition.
pub const MAX_AUNTS: usize = 100;

/// Proof that the item at position `index` in a list of `total` items is included in the tree
/// with a given root.
///
/// `aunts` holds the hashes of the sibling subtrees on the path from the leaf to the root, leaf
/// side first.
#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct Proof {
    pub total: u64,
    pub index: u64,
    pub leaf_hash: CryptoHash,
    pub aunts: Vec<CryptoHash>,
}

/// Ways in which a [`Proof`] can fail verification.
#[derive(Debug, PartialEq, Eq)]
pub enum ProofError {
    /// `total` is zero.
    TotalMustBePositive,
    /// `index` is not smaller than `total`.
    IndexOutOfRange,
    /// `aunts` is longer than [`MAX_AUNTS`].
    TooManyAunts,
    /// The hash of the presented leaf does not equal `leaf_hash`.
    InvalidLeafHash,
    /// `aunts` has too few or too many entries for a tree of `total` items.
    MalformedAunts,
    /// The recomputed root does not equal the expected root.
    InvalidRootHash,
}

impl Display for ProofError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ProofError::TotalMustBePositive => write!(f, "proof total must be positive"),
            ProofError::IndexOutOfRange => write!(f, "proof index is out of range"),
            ProofError::TooManyAunts => write!(f, "proof has more than {} aunts", MAX_AUNTS),
            ProofError::InvalidLeafHash => write!(f, "invalid leaf hash"),
            ProofError::MalformedAunts => write!(f, "aunt list does not match tree shape"),
            ProofError::InvalidRootHash => write!(f, "invalid root hash"),
        }
    }
}

impl Proof {
    /// Verify that `leaf` is the item this proof covers, and that it is included under
    /// `root_hash`.
    pub fn verify(&self, root_hash: &CryptoHash, leaf: &[u8]) -> Result<(), ProofError> {
        if self.total == 0 {
            return Err(ProofError::TotalMustBePositive);
        }
        if self.index >= self.total {
            return Err(ProofError::IndexOutOfRange);
        }
        if self.aunts.len() > MAX_AUNTS {
            return Err(ProofError::TooManyAunts);
        }
        if self.leaf_hash != leaf_hash(leaf) {
            return Err(ProofError::InvalidLeafHash);
        }
        let computed_root =
            compute_hash_from_aunts(self.index, self.total, self.leaf_hash, &self.aunts)
                .ok_or(ProofError::MalformedAunts)?;
        if computed_root != *root_hash {
            return Err(ProofError::InvalidRootHash);
        }
        Ok(())
    }
}

/// Recompute the root of a tree of `total` items from the leaf hash at `index` and its aunts.
///
/// Returns `None` if the aunt list is too short or too long for the tree shape.
fn compute_hash_from_aunts(
    index: u64,
    total: u64,
    leaf_hash: CryptoHash,
    aunts: &[CryptoHash],
) -> Option<CryptoHash> {
    if index >= total || total == 0 {
        return None;
    }
    if total == 1 {
        return if aunts.is_empty() {
            Some(leaf_hash)
        } else {
            None
        };
    }
    let (last_aunt, inner_aunts) = aunts.split_last()?;
    let split_point = get_split_point(total);
    if index < split_point {
        let left = compute_hash_from_aunts(index, split_point, leaf_hash, inner_aunts)?;
        Some(inner_hash(&left, last_aunt))
    } else {
        let right =
            compute_hash_from_aunts(index - split_point, total - split_point, leaf_hash, inner_aunts)?;
        Some(inner_hash(last_aunt, &right))
    }
}

/// A node of the in-construction tree. Links are indices into the arena that
/// [`proofs_from_byte_slices`] builds.
struct ProofNode {
    hash: CryptoHash,
    parent: Option<usize>,
    /// Left sibling, set on right children only.
    left: Option<usize>,
    /// Right sibling, set on left children only.
    right: Option<usize>,
}

/// Compute the root of `items` and an inclusion proof for each item.
pub fn proofs_from_byte_slices<T: AsRef<[u8]>>(items: &[T]) -> (CryptoHash, Vec<Proof>) {
    let mut arena: Vec<ProofNode> = Vec::with_capacity(2 * items.len().max(1));
    let (leaves, root) = trails_from_byte_slices(&mut arena, items);
    let root_hash = arena[root].hash;
    let proofs = leaves
        .iter()
        .enumerate()
        .map(|(index, leaf)| Proof {
            total: items.len() as u64,
            index: index as u64,
            leaf_hash: arena[*leaf].hash,
            aunts: flatten_aunts(&arena, *leaf),
        })
        .collect();
    (root_hash, proofs)
}

/// Build the tree over `items` into `arena`. Returns the arena indices of the leaves, in item
/// order, and of the root.
fn trails_from_byte_slices<T: AsRef<[u8]>>(
    arena: &mut Vec<ProofNode>,
    items: &[T],
) -> (Vec<usize>, usize) {
    match items.len() {
        0 => {
            let root = push_node(arena, empty_hash());
            (Vec::new(), root)
        }
        1 => {
            let leaf = push_node(arena, leaf_hash(items[0].as_ref()));
            (vec![leaf], leaf)
        }
        len => {
            let split_point = get_split_point(len as u64) as usize;
            let (mut leaves, left_root) = trails_from_byte_slices(arena, &items[..split_point]);
            let (right_leaves, right_root) = trails_from_byte_slices(arena, &items[split_point..]);
            leaves.extend(right_leaves);

            let root_hash = inner_hash(&arena[left_root].hash, &arena[right_root].hash);
            let root = push_node(arena, root_hash);
            arena[left_root].right = Some(right_root);
            arena[left_root].parent = Some(root);
            arena[right_root].left = Some(left_root);
            arena[right_root].parent = Some(root);
            (leaves, root)
        }
    }
}

fn push_node(arena: &mut Vec<ProofNode>, hash: CryptoHash) -> usize {
    arena.push(ProofNode {
        hash,
        parent: None,
        left: None,
        right: None,
    });
    arena.len() - 1
}

/// Collect the sibling hashes on the path from `node` to the root, leaf side first.
fn flatten_aunts(arena: &[ProofNode], mut node: usize) -> Vec<CryptoHash> {
    let mut aunts = Vec::new();
    loop {
        let current = &arena[node];
        if let Some(left_sibling) = current.left {
            aunts.push(arena[left_sibling].hash);
        } else if let Some(right_sibling) = current.right {
            aunts.push(arena[right_sibling].hash);
        }
        match current.parent {
            Some(parent) => node = parent,
            None => break,
        }
    }
    aunts
}
