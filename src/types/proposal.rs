/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Proposals: the signed messages with which the round's proposer announces its block.
//!
//! The proposal itself identifies the block only by [`BlockId`]; the block's bytes travel
//! separately as [`Part`](super::part_set::Part)s.

use std::fmt::{self, Display, Formatter};

use borsh::{BorshDeserialize, BorshSerialize};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};

use super::basic::{ChainId, Height, Round, SignatureBytes, Timestamp};
use super::block::BlockId;

/// The kinds of message a validator signs, as the leading byte of canonical sign-bytes.
///
/// [`CanonicalVote`](super::vote::CanonicalVote) leads with its
/// [`VoteType`](super::vote::VoteType), whose Borsh encoding matches the first two variants
/// here, so the leading byte alone separates the three signing domains: a signature over a
/// proposal can never verify as a vote, and vice versa.
#[derive(Clone, Copy, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub enum SignedMsgType {
    Prevote,
    Precommit,
    Proposal,
}

/// A proposer's announcement of the block it proposes for a height and round.
///
/// `pol_round` is the round of the Proof-of-Lock that justifies re-proposing a block from an
/// earlier round, or [`Round::NONE`] for a fresh proposal. Receivers only accept a proposal with
/// `pol_round >= 0` after seeing the +2/3 prevotes from that round.
#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct Proposal {
    pub height: Height,
    pub round: Round,
    pub pol_round: Round,
    pub block_id: BlockId,
    pub timestamp: Timestamp,
    pub signature: SignatureBytes,
}

impl Proposal {
    /// Create a `Proposal` with a zeroed signature, ready to be signed by a
    /// [`FilePv`](crate::privval::FilePv).
    pub fn new_unsigned(
        height: Height,
        round: Round,
        pol_round: Round,
        block_id: BlockId,
        timestamp: Timestamp,
    ) -> Self {
        Self {
            height,
            round,
            pol_round,
            block_id,
            timestamp,
            signature: SignatureBytes::new([0u8; 64]),
        }
    }

    /// The bytes that are signed: the Borsh encoding of the [`CanonicalProposal`] for `chain_id`.
    pub fn sign_bytes(&self, chain_id: &ChainId) -> Vec<u8> {
        CanonicalProposal::from_proposal(self, chain_id)
            .try_to_vec()
            .unwrap()
    }

    /// Whether `signature` is a correct signature over this proposal's sign-bytes by `pub_key`.
    pub fn verify_signature(&self, chain_id: &ChainId, pub_key: &VerifyingKey) -> bool {
        let signature = Signature::from_bytes(&self.signature.bytes());
        pub_key
            .verify(&self.sign_bytes(chain_id), &signature)
            .is_ok()
    }
}

impl Display for Proposal {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Proposal at {}/{} (pol {}) for {:?}",
            self.height, self.round, self.pol_round, self.block_id.hash
        )
    }
}

/// The canonical, chain-scoped form of a [`Proposal`] whose Borsh encoding is what proposers
/// actually sign.
#[derive(Clone, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct CanonicalProposal {
    pub msg_type: SignedMsgType,
    pub height: Height,
    pub round: Round,
    pub pol_round: Round,
    pub block_id: BlockId,
    pub timestamp: Timestamp,
    pub chain_id: ChainId,
}

impl CanonicalProposal {
    pub fn from_proposal(proposal: &Proposal, chain_id: &ChainId) -> Self {
        Self {
            msg_type: SignedMsgType::Proposal,
            height: proposal.height,
            round: proposal.round,
            pol_round: proposal.pol_round,
            block_id: proposal.block_id.clone(),
            timestamp: proposal.timestamp,
            chain_id: chain_id.clone(),
        }
    }

    /// Whether `self` and `other` propose the same thing and differ at most in their timestamps.
    pub fn eq_ignoring_timestamp(&self, other: &CanonicalProposal) -> bool {
        self.height == other.height
            && self.round == other.round
            && self.pol_round == other.pol_round
            && self.block_id == other.block_id
            && self.chain_id == other.chain_id
    }
}
