/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Merkle trees over lists of byte strings, with inclusion proofs.
//!
//! Trees are built with domain-separated SHA256 hashing: leaves are hashed with a `0x00` prefix
//! and inner nodes with a `0x01` prefix, so a leaf can never be reinterpreted as an inner node.
//! The left subtree of every inner node covers the largest power of two strictly smaller than the
//! number of items under the node, which makes the tree shape, and thus the root, a pure function
//! of the item list.
//!
//! Roots computed here identify blocks ([`Header::hash`](crate::types::block::Header::hash)),
//! transaction lists, validator sets, and [`PartSet`](crate::types::part_set::PartSet)s, and the
//! proofs in [`proof`] let a single block part be verified against the part set root before the
//! whole block has arrived.

pub mod tree;

pub mod proof;

pub use proof::{proofs_from_byte_slices, Proof, ProofError};
pub use tree::{hash_from_byte_slices, inner_hash, leaf_hash};
