/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Votes: the signed prevotes and precommits that validators exchange within a round.

use std::fmt::{self, Display, Formatter};

use borsh::{BorshDeserialize, BorshSerialize};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};

use super::basic::{Address, ChainId, Height, Round, SignatureBytes, Timestamp};
use super::block::{BlockId, BlockIdFlag, CommitSig};

/// The two vote steps of a round.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, BorshDeserialize, BorshSerialize)]
pub enum VoteType {
    Prevote,
    Precommit,
}

impl Display for VoteType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            VoteType::Prevote => write!(f, "Prevote"),
            VoteType::Precommit => write!(f, "Precommit"),
        }
    }
}

/// A validator's vote for (or against) a block in a specific height, round, and step.
///
/// A vote whose `block_id` [is zero](BlockId::is_zero) is a *nil* vote: an explicit vote against
/// committing anything in this round.
///
/// Precommits may carry an application-supplied `extension`. The engine treats it as opaque
/// bytes: it travels with the vote and is recorded in the commit, but it is not part of the
/// [sign-bytes](Vote::sign_bytes), and prevotes must not carry one.
#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct Vote {
    pub vote_type: VoteType,
    pub height: Height,
    pub round: Round,
    pub block_id: BlockId,
    pub timestamp: Timestamp,
    pub validator_address: Address,
    pub validator_index: u32,
    pub signature: SignatureBytes,
    pub extension: Option<Vec<u8>>,
}

impl Vote {
    /// Create a `Vote` with a zeroed signature, ready to be signed by a
    /// [`FilePv`](crate::privval::FilePv).
    pub fn new_unsigned(
        vote_type: VoteType,
        height: Height,
        round: Round,
        block_id: BlockId,
        timestamp: Timestamp,
        validator_address: Address,
        validator_index: u32,
    ) -> Self {
        Self {
            vote_type,
            height,
            round,
            block_id,
            timestamp,
            validator_address,
            validator_index,
            signature: SignatureBytes::new([0u8; 64]),
            extension: None,
        }
    }

    /// Whether this is a nil vote.
    pub fn is_nil(&self) -> bool {
        self.block_id.is_zero()
    }

    /// The bytes that are signed: the Borsh encoding of the [`CanonicalVote`] for `chain_id`.
    /// The validator's address and index are excluded, so the sign-bytes commit only to what was
    /// voted for, not to who voted.
    pub fn sign_bytes(&self, chain_id: &ChainId) -> Vec<u8> {
        CanonicalVote::from_vote(self, chain_id).try_to_vec().unwrap()
    }

    /// Whether `signature` is a correct signature over this vote's sign-bytes by `pub_key`.
    pub fn verify_signature(&self, chain_id: &ChainId, pub_key: &VerifyingKey) -> bool {
        let signature = Signature::from_bytes(&self.signature.bytes());
        pub_key
            .verify(&self.sign_bytes(chain_id), &signature)
            .is_ok()
    }

    /// Convert this (precommit) vote into the [`CommitSig`] that records it inside a
    /// [`Commit`](super::block::Commit).
    pub fn to_commit_sig(&self) -> CommitSig {
        CommitSig {
            flag: if self.is_nil() {
                BlockIdFlag::Nil
            } else {
                BlockIdFlag::Commit
            },
            validator_address: self.validator_address,
            timestamp: self.timestamp,
            signature: Some(self.signature),
            extension: self.extension.clone(),
        }
    }
}

impl Display for Vote {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} at {}/{} for {:?}",
            self.vote_type, self.height, self.round, self.block_id.hash
        )
    }
}

/// The canonical, chain-scoped form of a [`Vote`] whose Borsh encoding is what validators
/// actually sign.
#[derive(Clone, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct CanonicalVote {
    pub vote_type: VoteType,
    pub height: Height,
    pub round: Round,
    pub block_id: BlockId,
    pub timestamp: Timestamp,
    pub chain_id: ChainId,
}

impl CanonicalVote {
    pub fn from_vote(vote: &Vote, chain_id: &ChainId) -> Self {
        Self {
            vote_type: vote.vote_type,
            height: vote.height,
            round: vote.round,
            block_id: vote.block_id.clone(),
            timestamp: vote.timestamp,
            chain_id: chain_id.clone(),
        }
    }

    /// Whether `self` and `other` vote for the same thing and differ at most in their timestamps.
    /// Used by the signer to allow re-signing a vote whose only change is its time.
    pub fn eq_ignoring_timestamp(&self, other: &CanonicalVote) -> bool {
        self.vote_type == other.vote_type
            && self.height == other.height
            && self.round == other.round
            && self.block_id == other.block_id
            && self.chain_id == other.chain_id
    }
}
