/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Blocks, block identifiers, and commits.
//!
//! A block's hash is the Merkle root over the canonical encodings of its header fields, so two
//! headers differ in hash iff they differ in any field. A [`BlockId`] pairs that hash with the
//! [`PartSetHeader`] of the block's part set, which is what votes and proposals actually refer
//! to: a validator that votes for a `BlockId` commits both to the block's content and to the
//! exact chunking its bytes were gossiped in.

use std::fmt::{self, Display, Formatter};

use borsh::{BorshDeserialize, BorshSerialize};
use sha2::{Digest, Sha256};

use crate::merkle;

use super::basic::{
    Address, ChainId, CryptoHash, Height, Round, SignatureBytes, Timestamp, Transaction,
};

/// Versions of the block structure and of the application's state machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct Version {
    pub block: u64,
    pub app: u64,
}

/// Identifies the part set that a block's bytes were split into: the number of parts and the
/// Merkle root over them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, BorshDeserialize, BorshSerialize)]
pub struct PartSetHeader {
    pub total: u32,
    pub hash: CryptoHash,
}

impl PartSetHeader {
    /// The zero `PartSetHeader`, part of the nil [`BlockId`].
    pub const fn zero() -> Self {
        Self {
            total: 0,
            hash: CryptoHash::zero(),
        }
    }

    pub fn is_zero(&self) -> bool {
        self.total == 0 && self.hash.is_zero()
    }
}

/// Identifies a block: its header hash plus the header of its part set.
///
/// The all-zeroes `BlockId` stands for "nil", i.e. no block, in votes and in the
/// `last_block_id` of the first block after genesis.
#[derive(Clone, Debug, PartialEq, Eq, Hash, BorshDeserialize, BorshSerialize)]
pub struct BlockId {
    pub hash: CryptoHash,
    pub part_set_header: PartSetHeader,
}

impl BlockId {
    pub const fn new(hash: CryptoHash, part_set_header: PartSetHeader) -> Self {
        Self {
            hash,
            part_set_header,
        }
    }

    /// The nil `BlockId`.
    pub const fn zero() -> Self {
        Self {
            hash: CryptoHash::zero(),
            part_set_header: PartSetHeader::zero(),
        }
    }

    pub fn is_zero(&self) -> bool {
        self.hash.is_zero() && self.part_set_header.is_zero()
    }

    /// Canonical bytes of this `BlockId`, usable as a map key.
    pub fn key(&self) -> Vec<u8> {
        self.try_to_vec().unwrap()
    }
}

/// How a validator's slot in a [`Commit`] was filled.
#[derive(Clone, Copy, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub enum BlockIdFlag {
    /// No precommit for the committed block was recorded from this validator.
    Absent,
    /// The validator precommitted the committed block.
    Commit,
    /// The validator precommitted nil.
    Nil,
}

/// One validator's slot in a [`Commit`], in validator set order.
///
/// `extension` preserves the opaque vote extension of the recorded precommit, if it carried one.
#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct CommitSig {
    pub flag: BlockIdFlag,
    pub validator_address: Address,
    pub timestamp: Timestamp,
    pub signature: Option<SignatureBytes>,
    pub extension: Option<Vec<u8>>,
}

impl CommitSig {
    /// The slot recorded for a validator from which no usable precommit was seen.
    pub fn absent() -> Self {
        Self {
            flag: BlockIdFlag::Absent,
            validator_address: Address::new([0u8; 20]),
            timestamp: Timestamp::zero(),
            signature: None,
            extension: None,
        }
    }

    pub fn is_absent(&self) -> bool {
        self.flag == BlockIdFlag::Absent
    }

    /// Whether this slot records a precommit for the committed block (as opposed to nil or
    /// absent).
    pub fn is_commit(&self) -> bool {
        self.flag == BlockIdFlag::Commit
    }
}

/// The +2/3 precommits that committed a block, in validator set order.
///
/// Stored with the *next* block as its `last_commit`, which is how the chain itself proves that
/// each block was committed.
#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct Commit {
    pub height: Height,
    pub round: Round,
    pub block_id: BlockId,
    pub signatures: Vec<CommitSig>,
}

impl Commit {
    /// The empty commit stored as the `last_commit` of the first block after genesis.
    pub fn empty() -> Self {
        Self {
            height: Height::new(0),
            round: Round::new(0),
            block_id: BlockId::zero(),
            signatures: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.signatures.is_empty()
    }

    /// Hash of this commit: the Merkle root over the canonical encodings of its signature slots.
    pub fn hash(&self) -> CryptoHash {
        let canonical_sigs: Vec<Vec<u8>> = self
            .signatures
            .iter()
            .map(|sig| sig.try_to_vec().unwrap())
            .collect();
        merkle::hash_from_byte_slices(&canonical_sigs)
    }

    /// Reconstruct the precommit [`Vote`](super::vote::Vote) recorded in the slot at
    /// `validator_index`, or `None` if the slot is absent.
    ///
    /// Reconstruction inverts [`Vote::to_commit_sig`](super::vote::Vote::to_commit_sig): a
    /// `Commit` slot votes for this commit's block, a `Nil` slot for the nil block.
    pub fn get_vote(&self, validator_index: u32) -> Option<super::vote::Vote> {
        let commit_sig = self.signatures.get(validator_index as usize)?;
        if commit_sig.is_absent() {
            return None;
        }
        let block_id = match commit_sig.flag {
            BlockIdFlag::Commit => self.block_id.clone(),
            BlockIdFlag::Nil => BlockId::zero(),
            BlockIdFlag::Absent => unreachable!(),
        };
        Some(super::vote::Vote {
            vote_type: super::vote::VoteType::Precommit,
            height: self.height,
            round: self.round,
            block_id,
            timestamp: commit_sig.timestamp,
            validator_address: commit_sig.validator_address,
            validator_index,
            signature: commit_sig.signature?,
            extension: commit_sig.extension.clone(),
        })
    }
}

/// A block's header. Every hash field commits to a different piece of the chain's state, so the
/// header's own hash transitively commits to all of them.
#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct Header {
    pub version: Version,
    pub chain_id: ChainId,
    pub height: Height,
    pub time: Timestamp,
    /// Id of the previous block, or the nil id for the first block after genesis.
    pub last_block_id: BlockId,
    /// Hash of this block's `last_commit`.
    pub last_commit_hash: CryptoHash,
    /// Merkle root over the hashes of this block's transactions.
    pub data_hash: CryptoHash,
    /// Hash of the validator set that votes on this block.
    pub validators_hash: CryptoHash,
    /// Hash of the validator set that will vote on the next block.
    pub next_validators_hash: CryptoHash,
    /// Hash of the consensus parameters in force at this height.
    pub consensus_hash: CryptoHash,
    /// The application's state root after executing the *previous* block.
    pub app_hash: Vec<u8>,
    /// Merkle root over the transaction results of the *previous* block.
    pub last_results_hash: CryptoHash,
    pub proposer_address: Address,
}

impl Header {
    /// Hash of this header: the Merkle root over the canonical encodings of every field, in
    /// declaration order.
    pub fn hash(&self) -> CryptoHash {
        let fields: Vec<Vec<u8>> = vec![
            self.version.try_to_vec().unwrap(),
            self.chain_id.try_to_vec().unwrap(),
            self.height.try_to_vec().unwrap(),
            self.time.try_to_vec().unwrap(),
            self.last_block_id.try_to_vec().unwrap(),
            self.last_commit_hash.try_to_vec().unwrap(),
            self.data_hash.try_to_vec().unwrap(),
            self.validators_hash.try_to_vec().unwrap(),
            self.next_validators_hash.try_to_vec().unwrap(),
            self.consensus_hash.try_to_vec().unwrap(),
            self.app_hash.try_to_vec().unwrap(),
            self.last_results_hash.try_to_vec().unwrap(),
            self.proposer_address.try_to_vec().unwrap(),
        ];
        merkle::hash_from_byte_slices(&fields)
    }
}

/// A block: header, transactions, and the commit that sealed the previous block.
#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct Block {
    pub header: Header,
    pub data: Vec<Transaction>,
    pub last_commit: Commit,
}

impl Block {
    /// Hash of this block, which is its header's hash.
    pub fn hash(&self) -> CryptoHash {
        self.header.hash()
    }

    /// Merkle root over the SHA256 hashes of `transactions`.
    pub fn data_hash(transactions: &[Transaction]) -> CryptoHash {
        let tx_hashes: Vec<[u8; 32]> = transactions
            .iter()
            .map(|tx| Sha256::digest(tx.bytes()).into())
            .collect();
        merkle::hash_from_byte_slices(&tx_hashes)
    }

    /// Check this block's internal consistency: every hash field that can be recomputed from the
    /// block's own content must match.
    pub fn validate_basic(&self) -> Result<(), BlockError> {
        if self.header.data_hash != Self::data_hash(&self.data) {
            return Err(BlockError::DataHashMismatch);
        }
        if self.header.last_commit_hash != self.last_commit.hash() {
            return Err(BlockError::LastCommitHashMismatch);
        }
        if self.header.height.int() == 0 {
            return Err(BlockError::ZeroHeight);
        }
        // The first block after genesis carries an empty last commit; all later blocks must
        // commit their direct predecessor.
        if !self.last_commit.is_empty() && self.last_commit.height + 1 != self.header.height {
            return Err(BlockError::WrongLastCommitHeight {
                last_commit_height: self.last_commit.height,
                height: self.header.height,
            });
        }
        Ok(())
    }
}

/// Ways in which a block can be internally inconsistent.
#[derive(Debug, PartialEq, Eq)]
pub enum BlockError {
    DataHashMismatch,
    LastCommitHashMismatch,
    ZeroHeight,
    WrongLastCommitHeight {
        last_commit_height: Height,
        height: Height,
    },
}

impl Display for BlockError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            BlockError::DataHashMismatch => {
                write!(f, "data hash does not match the block's transactions")
            }
            BlockError::LastCommitHashMismatch => {
                write!(f, "last commit hash does not match the block's last commit")
            }
            BlockError::ZeroHeight => write!(f, "block height is zero"),
            BlockError::WrongLastCommitHeight {
                last_commit_height,
                height,
            } => write!(
                f,
                "last commit is for height {} but the block is at height {}",
                last_commit_height, height
            ),
        }
    }
}
