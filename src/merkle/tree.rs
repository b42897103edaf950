/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Root computation for Merkle trees over lists of byte strings.

use sha2::{Digest, Sha256};

use crate::types::basic::CryptoHash;

/// Domain separation prefix hashed before a leaf's bytes.
const LEAF_PREFIX: u8 = 0x00;

/// Domain separation prefix hashed before an inner node's child hashes.
const INNER_PREFIX: u8 = 0x01;

/// Hash of the empty item list: SHA256 of the empty byte string.
pub fn empty_hash() -> CryptoHash {
    CryptoHash::new(Sha256::digest([]).into())
}

/// Hash a leaf: `SHA256(0x00 ‖ item)`.
pub fn leaf_hash(item: &[u8]) -> CryptoHash {
    let mut hasher = Sha256::new();
    hasher.update([LEAF_PREFIX]);
    hasher.update(item);
    CryptoHash::new(hasher.finalize().into())
}

/// Hash an inner node: `SHA256(0x01 ‖ left ‖ right)`.
pub fn inner_hash(left: &CryptoHash, right: &CryptoHash) -> CryptoHash {
    let mut hasher = Sha256::new();
    hasher.update([INNER_PREFIX]);
    hasher.update(left.bytes());
    hasher.update(right.bytes());
    CryptoHash::new(hasher.finalize().into())
}

/// The number of items covered by the left subtree of an inner node covering `length` items:
/// the largest power of two strictly smaller than `length`.
///
/// `get_split_point(1)` is 0; callers never split a single-item subtree.
pub fn get_split_point(length: u64) -> u64 {
    debug_assert!(length > 0);
    let bit_len = u64::BITS - length.leading_zeros();
    let mut split_point = 1u64 << (bit_len.saturating_sub(1));
    if split_point == length {
        split_point >>= 1;
    }
    split_point
}

/// Compute the Merkle root of `items`.
///
/// The empty list hashes to [`empty_hash`], a single item to its [`leaf_hash`], and longer lists
/// to the [`inner_hash`] of the two subtrees split at [`get_split_point`].
pub fn hash_from_byte_slices<T: AsRef<[u8]>>(items: &[T]) -> CryptoHash {
    match items.len() {
        0 => empty_hash(),
        1 => leaf_hash(items[0].as_ref()),
        len => {
            let split_point = get_split_point(len as u64) as usize;
            let left = hash_from_byte_slices(&items[..split_point]);
            let right = hash_from_byte_slices(&items[split_point..]);
            inner_hash(&left, &right)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_point_table() {
        let cases: [(u64, u64); 9] = [
            (1, 0),
            (2, 1),
            (3, 2),
            (4, 2),
            (5, 4),
            (10, 8),
            (100, 64),
            (256, 128),
            (257, 256),
        ];
        for (length, expected) in cases {
            assert_eq!(get_split_point(length), expected, "length {}", length);
        }
    }

    #[test]
    fn root_shape_is_deterministic() {
        let items = [b"alpha".to_vec(), b"bravo".to_vec(), b"charlie".to_vec()];
        // Three items split as [2, 1].
        let expected = inner_hash(
            &inner_hash(&leaf_hash(b"alpha"), &leaf_hash(b"bravo")),
            &leaf_hash(b"charlie"),
        );
        assert_eq!(hash_from_byte_slices(&items), expected);
    }

    #[test]
    fn leaf_and_inner_are_domain_separated() {
        let left = leaf_hash(b"a");
        let right = leaf_hash(b"b");
        let mut concatenated = Vec::new();
        concatenated.extend_from_slice(&left.bytes());
        concatenated.extend_from_slice(&right.bytes());
        assert_ne!(inner_hash(&left, &right), leaf_hash(&concatenated));
    }

    #[test]
    fn empty_and_single_item_roots() {
        let no_items: [&[u8]; 0] = [];
        assert_eq!(hash_from_byte_slices(&no_items), empty_hash());
        assert_eq!(hash_from_byte_slices(&[b"solo"]), leaf_hash(b"solo"));
    }
}
