/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Accumulation of the votes of one (height, round, step), with quorum detection.
//!
//! # Canonical slots and equivocation
//!
//! Each validator gets one *canonical* slot, holding the first valid vote received from it. A
//! later vote from the same validator for a different block is equivocation. Such votes are not
//! tracked freely (an attacker could otherwise make a replica store one vote per block hash it
//! invents): a conflicting vote is only recorded under its block if some peer has *claimed*, via
//! [`set_peer_maj23`](VoteSet::set_peer_maj23), that +2/3 voted for that block, and each peer
//! may make exactly one such claim per vote set.
//!
//! # Promotion
//!
//! When the votes for one block cross the quorum threshold, that block becomes the set's
//! permanent +2/3 decision ([`two_thirds_majority`](VoteSet::two_thirds_majority)), and any votes
//! for it that had been displaced from canonical slots by equivocation are promoted back into
//! them. A vote set never reports two different majorities; if tracked votes would ever support
//! a second one, the set has caught more than a third of the validators equivocating.

use std::collections::HashMap;
use std::fmt::{self, Display, Formatter};
use std::sync::Arc;

use log::error;

use crate::types::basic::{ChainId, Height, PeerId, Power, Round, TotalPower};
use crate::types::bit_vector::BitVector;
use crate::types::block::{BlockId, Commit};
use crate::types::validators::ValidatorSet;
use crate::types::vote::{Vote, VoteType};

/// The votes received for one specific block (or nil) within a [`VoteSet`].
struct BlockVotes {
    /// Whether some peer claimed that this block has +2/3 votes. Set at construction or by
    /// `set_peer_maj23`; conflicting votes are only tracked here while this is true.
    peer_maj23: bool,
    bit_vector: BitVector,
    votes: Vec<Option<Vote>>,
    sum: TotalPower,
}

impl BlockVotes {
    fn new(peer_maj23: bool, len: usize) -> Self {
        Self {
            peer_maj23,
            bit_vector: BitVector::new(len as u32),
            votes: vec![None; len],
            sum: TotalPower::zero(),
        }
    }

    fn add_verified_vote(&mut self, vote: Vote, power: Power) {
        let index = vote.validator_index;
        if !self.bit_vector.get(index) {
            self.bit_vector.set(index, true);
            self.votes[index as usize] = Some(vote);
            self.sum += power;
        }
    }
}

/// All votes of one (height, round, vote type).
pub struct VoteSet {
    chain_id: ChainId,
    height: Height,
    round: Round,
    vote_type: VoteType,
    validator_set: Arc<ValidatorSet>,

    votes_bit_vector: BitVector,
    /// Canonical slots, one per validator in validator set order.
    votes: Vec<Option<Vote>>,
    /// Power behind the canonical slots.
    sum: TotalPower,
    /// The +2/3 decision, once one exists. Never reset.
    maj23: Option<BlockId>,
    votes_by_block: HashMap<Vec<u8>, BlockVotes>,
    peer_maj23s: HashMap<PeerId, BlockId>,
}

impl VoteSet {
    pub fn new(
        chain_id: ChainId,
        height: Height,
        round: Round,
        vote_type: VoteType,
        validator_set: Arc<ValidatorSet>,
    ) -> Self {
        let len = validator_set.len();
        Self {
            chain_id,
            height,
            round,
            vote_type,
            validator_set,
            votes_bit_vector: BitVector::new(len as u32),
            votes: vec![None; len],
            sum: TotalPower::zero(),
            maj23: None,
            votes_by_block: HashMap::new(),
            peer_maj23s: HashMap::new(),
        }
    }

    pub fn height(&self) -> Height {
        self.height
    }

    pub fn round(&self) -> Round {
        self.round
    }

    pub fn vote_type(&self) -> VoteType {
        self.vote_type
    }

    /// Add a vote.
    ///
    /// Returns `Ok(true)` if the vote was recorded, `Ok(false)` if it was an exact duplicate.
    /// A [`ConflictingVote`](VoteSetError::ConflictingVote) error means the validator
    /// equivocated; `tracked` tells whether the vote was still recorded under its block because
    /// a peer had claimed a majority for it.
    pub fn add_vote(&mut self, vote: Vote) -> Result<bool, VoteSetError> {
        let validator = self
            .validator_set
            .get_by_index(vote.validator_index)
            .ok_or(VoteSetError::InvalidValidatorIndex {
                index: vote.validator_index,
            })?;
        if validator.address != vote.validator_address {
            return Err(VoteSetError::InvalidValidatorAddress {
                index: vote.validator_index,
            });
        }
        if vote.height != self.height
            || vote.round != self.round
            || vote.vote_type != self.vote_type
        {
            return Err(VoteSetError::UnexpectedVote {
                expected_height: self.height,
                expected_round: self.round,
                expected_type: self.vote_type,
            });
        }
        // Extensions are a precommit-only field.
        if vote.vote_type == VoteType::Prevote && vote.extension.is_some() {
            return Err(VoteSetError::UnexpectedExtension {
                index: vote.validator_index,
            });
        }

        let block_key = vote.block_id.key();

        // Duplicate detection against both the canonical slot and the tracked per-block votes.
        if let Some(existing) = self.get_vote(vote.validator_index, &block_key) {
            if existing.signature == vote.signature {
                return Ok(false);
            }
            // Same validator, same block, different signature bytes. Signing is
            // deterministic, so one of the two votes was forged and verification below would
            // not distinguish them.
            return Err(VoteSetError::NonDeterministicSignature);
        }

        if !vote.verify_signature(&self.chain_id, &validator.pub_key) {
            return Err(VoteSetError::InvalidSignature {
                index: vote.validator_index,
            });
        }

        self.add_verified_vote(vote, block_key, validator.power)
    }

    fn get_vote(&self, validator_index: u32, block_key: &[u8]) -> Option<&Vote> {
        if let Some(existing) = &self.votes[validator_index as usize] {
            if existing.block_id.key() == block_key {
                return Some(existing);
            }
        }
        self.votes_by_block
            .get(block_key)
            .and_then(|block_votes| block_votes.votes[validator_index as usize].as_ref())
    }

    fn add_verified_vote(
        &mut self,
        vote: Vote,
        block_key: Vec<u8>,
        power: Power,
    ) -> Result<bool, VoteSetError> {
        let index = vote.validator_index;

        let conflicting = match &self.votes[index as usize] {
            Some(existing) => {
                debug_assert!(existing.block_id != vote.block_id);
                true
            }
            None => {
                self.votes[index as usize] = Some(vote.clone());
                self.votes_bit_vector.set(index, true);
                self.sum += power;
                false
            }
        };

        match self.votes_by_block.get_mut(&block_key) {
            Some(block_votes) => {
                if conflicting && !block_votes.peer_maj23 {
                    return Err(VoteSetError::ConflictingVote { tracked: false });
                }
                block_votes.add_verified_vote(vote, power);
            }
            None => {
                if conflicting {
                    // No peer claimed a majority for this block, so tracking the vote would
                    // let an equivocator consume unbounded memory.
                    return Err(VoteSetError::ConflictingVote { tracked: false });
                }
                let mut block_votes = BlockVotes::new(false, self.votes.len());
                block_votes.add_verified_vote(vote.clone(), power);
                self.votes_by_block.insert(block_key.clone(), block_votes);
            }
        }

        // Promote this block to the set's +2/3 decision if it just crossed the quorum.
        let block_votes = &self.votes_by_block[&block_key];
        if block_votes.sum >= self.validator_set.quorum() {
            let block_id = match block_votes.votes.iter().flatten().next() {
                Some(vote) => vote.block_id.clone(),
                None => unreachable!(),
            };
            match &self.maj23 {
                // The decision is permanent. A second block crossing the quorum means more
                // than a third of the power signed precommits for two blocks in the same
                // round, which no honest network produces.
                Some(decided) => {
                    if *decided != block_id {
                        error!(
                            "+2/3 of the power voted for a second block at {}/{}: more than \
                             a third of the validators equivocated",
                            self.height, self.round
                        );
                    }
                }
                None => {
                    self.maj23 = Some(block_id);
                    let promoted: Vec<Vote> =
                        block_votes.votes.iter().flatten().cloned().collect();
                    for promoted_vote in promoted {
                        let slot = promoted_vote.validator_index as usize;
                        if self.votes[slot].as_ref().map(|v| &v.block_id)
                            != Some(&promoted_vote.block_id)
                        {
                            self.votes[slot] = Some(promoted_vote);
                        }
                    }
                }
            }
        }

        if conflicting {
            Err(VoteSetError::ConflictingVote { tracked: true })
        } else {
            Ok(true)
        }
    }

    /// Record `peer`'s claim that +2/3 voted for `block_id`. Each peer may claim exactly one
    /// block per vote set.
    pub fn set_peer_maj23(&mut self, peer: PeerId, block_id: BlockId) -> Result<(), VoteSetError> {
        if let Some(previous) = self.peer_maj23s.get(&peer) {
            if *previous == block_id {
                return Ok(());
            }
            return Err(VoteSetError::ConflictingMajorityClaim { peer });
        }
        self.peer_maj23s.insert(peer, block_id.clone());

        let block_key = block_id.key();
        match self.votes_by_block.get_mut(&block_key) {
            Some(block_votes) => block_votes.peer_maj23 = true,
            None => {
                self.votes_by_block
                    .insert(block_key, BlockVotes::new(true, self.votes.len()));
            }
        }
        Ok(())
    }

    /// The block (possibly nil) with +2/3 of the power behind it, if any. Permanent once set.
    pub fn two_thirds_majority(&self) -> Option<&BlockId> {
        self.maj23.as_ref()
    }

    pub fn has_two_thirds_majority(&self) -> bool {
        self.maj23.is_some()
    }

    /// Whether +2/3 of the power has voted for *something*, counting votes for different blocks
    /// together. Signals that this round's outcome is near, even if split.
    pub fn has_two_thirds_any(&self) -> bool {
        self.sum >= self.validator_set.quorum()
    }

    /// Whether every validator has voted.
    pub fn has_all(&self) -> bool {
        self.sum == self.validator_set.total_power()
    }

    /// The canonical vote of the validator at `index`.
    pub fn get_by_index(&self, index: u32) -> Option<&Vote> {
        self.votes.get(index as usize)?.as_ref()
    }

    /// Which validators have a canonical vote.
    pub fn bit_vector(&self) -> BitVector {
        self.votes_bit_vector.clone()
    }

    /// Which validators are known to have voted for `block_id`.
    pub fn bit_vector_by_block_id(&self, block_id: &BlockId) -> Option<BitVector> {
        self.votes_by_block
            .get(&block_id.key())
            .map(|block_votes| block_votes.bit_vector.clone())
    }

    /// Build the [`Commit`] recording this precommit set's +2/3 decision.
    ///
    /// Slots holding precommits for other blocks are recorded as absent; they prove nothing
    /// about the committed block.
    pub fn make_commit(&self) -> Result<Commit, VoteSetError> {
        if self.vote_type != VoteType::Precommit {
            return Err(VoteSetError::NotPrecommitSet);
        }
        let maj23 = self.maj23.clone().ok_or(VoteSetError::NoMajority)?;
        if maj23.is_zero() {
            return Err(VoteSetError::NilMajority);
        }
        let signatures = self
            .votes
            .iter()
            .map(|slot| match slot {
                Some(vote) => {
                    let commit_sig = vote.to_commit_sig();
                    if commit_sig.is_commit() && vote.block_id != maj23 {
                        crate::types::block::CommitSig::absent()
                    } else {
                        commit_sig
                    }
                }
                None => crate::types::block::CommitSig::absent(),
            })
            .collect();
        Ok(Commit {
            height: self.height,
            round: self.round,
            block_id: maj23,
            signatures,
        })
    }

    /// Reconstruct the precommit set that a [`Commit`] is a record of. Fails unless the
    /// reconstructed votes reach a +2/3 majority under `validator_set`.
    pub fn from_commit(
        chain_id: ChainId,
        commit: &Commit,
        validator_set: Arc<ValidatorSet>,
    ) -> Result<VoteSet, VoteSetError> {
        let mut vote_set = VoteSet::new(
            chain_id,
            commit.height,
            commit.round,
            VoteType::Precommit,
            validator_set,
        );
        for index in 0..commit.signatures.len() as u32 {
            if let Some(vote) = commit.get_vote(index) {
                vote_set.add_vote(vote)?;
            }
        }
        if !vote_set.has_two_thirds_majority() {
            return Err(VoteSetError::NoMajority);
        }
        Ok(vote_set)
    }
}

/// Ways in which adding a vote or building a commit can fail.
#[derive(Debug, PartialEq, Eq)]
pub enum VoteSetError {
    InvalidValidatorIndex {
        index: u32,
    },
    InvalidValidatorAddress {
        index: u32,
    },
    UnexpectedVote {
        expected_height: Height,
        expected_round: Round,
        expected_type: VoteType,
    },
    InvalidSignature {
        index: u32,
    },
    /// A prevote carried a vote extension.
    UnexpectedExtension {
        index: u32,
    },
    /// Two different signatures over identical sign-bytes from the same validator.
    NonDeterministicSignature,
    /// The validator voted for two different blocks in the same (height, round, step).
    ConflictingVote {
        /// Whether the conflicting vote was still recorded under its block.
        tracked: bool,
    },
    /// A peer claimed +2/3 for two different blocks in the same vote set.
    ConflictingMajorityClaim {
        peer: PeerId,
    },
    NotPrecommitSet,
    NoMajority,
    NilMajority,
}

impl Display for VoteSetError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            VoteSetError::InvalidValidatorIndex { index } => {
                write!(f, "validator index {} is out of range", index)
            }
            VoteSetError::InvalidValidatorAddress { index } => {
                write!(f, "vote address does not match validator {}", index)
            }
            VoteSetError::UnexpectedVote {
                expected_height,
                expected_round,
                expected_type,
            } => write!(
                f,
                "vote is not a {} for {}/{}",
                expected_type, expected_height, expected_round
            ),
            VoteSetError::InvalidSignature { index } => {
                write!(f, "invalid signature from validator {}", index)
            }
            VoteSetError::UnexpectedExtension { index } => {
                write!(f, "prevote from validator {} carries an extension", index)
            }
            VoteSetError::NonDeterministicSignature => {
                write!(f, "two different signatures over the same sign-bytes")
            }
            VoteSetError::ConflictingVote { tracked } => {
                write!(f, "conflicting vote (tracked: {})", tracked)
            }
            VoteSetError::ConflictingMajorityClaim { peer } => {
                write!(f, "peer {:?} claimed +2/3 for two different blocks", peer)
            }
            VoteSetError::NotPrecommitSet => {
                write!(f, "cannot make a commit from a prevote set")
            }
            VoteSetError::NoMajority => write!(f, "vote set has no +2/3 majority"),
            VoteSetError::NilMajority => write!(f, "cannot make a commit for nil"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::basic::{CryptoHash, SignatureBytes, Timestamp};
    use crate::types::block::PartSetHeader;
    use crate::types::validators::{address_of, Validator};
    use ed25519_dalek::{Signer, SigningKey};
    use rand_core::OsRng;

    fn chain_id() -> ChainId {
        ChainId::new("vote-set-test-chain")
    }

    fn block_id(tag: u8) -> BlockId {
        BlockId::new(
            CryptoHash::new([tag; 32]),
            PartSetHeader {
                total: 1,
                hash: CryptoHash::new([tag; 32]),
            },
        )
    }

    /// A validator set with the given powers, plus its signing keys in validator set (address)
    /// order, so that `signers[i]` signs for the validator at index `i`.
    fn validators(powers: &[u64]) -> (Arc<ValidatorSet>, Vec<SigningKey>) {
        let mut signers: Vec<SigningKey> = powers
            .iter()
            .map(|_| SigningKey::generate(&mut OsRng))
            .collect();
        let validator_set = ValidatorSet::new(
            signers
                .iter()
                .zip(powers)
                .map(|(signer, power)| {
                    Validator::new(signer.verifying_key(), Power::new(*power))
                })
                .collect(),
        );
        signers.sort_by_key(|signer| address_of(&signer.verifying_key()));
        (Arc::new(validator_set), signers)
    }

    fn precommit_set(validator_set: Arc<ValidatorSet>) -> VoteSet {
        VoteSet::new(
            chain_id(),
            Height::new(1),
            Round::new(0),
            VoteType::Precommit,
            validator_set,
        )
    }

    fn signed_vote(
        validator_set: &ValidatorSet,
        signer: &SigningKey,
        index: u32,
        vote_type: VoteType,
        block_id: BlockId,
    ) -> Vote {
        let mut vote = Vote::new_unsigned(
            vote_type,
            Height::new(1),
            Round::new(0),
            block_id,
            Timestamp::new(1000),
            validator_set.get_by_index(index).unwrap().address,
            index,
        );
        let signature = signer.sign(&vote.sign_bytes(&chain_id()));
        vote.signature = SignatureBytes::new(signature.to_bytes());
        vote
    }

    #[test]
    fn majority_appears_exactly_at_the_quorum_boundary() {
        // Total power 9, so the quorum is 7.
        let (validator_set, signers) = validators(&[2, 2, 2, 3]);
        let mut vote_set = precommit_set(validator_set.clone());

        // Two validators holding 5 between them are below the boundary.
        let mut voted = TotalPower::zero();
        for index in 0..4u32 {
            if voted.int() + validator_set.get_by_index(index).unwrap().power.int() as u128 > 7 {
                continue;
            }
            let vote = signed_vote(
                &validator_set,
                &signers[index as usize],
                index,
                VoteType::Precommit,
                block_id(1),
            );
            voted += validator_set.get_by_index(index).unwrap().power;
            assert!(vote_set.add_vote(vote).unwrap());
            if voted.int() < 7 {
                assert!(!vote_set.has_two_thirds_majority());
            }
        }

        // The loop stops adding votes once the sum hits exactly 7: the boundary itself is a
        // majority.
        assert_eq!(voted, TotalPower::new(7));
        assert_eq!(vote_set.two_thirds_majority(), Some(&block_id(1)));
    }

    #[test]
    fn duplicate_votes_are_not_double_counted() {
        // Total power 3, quorum 3: every validator must vote.
        let (validator_set, signers) = validators(&[1, 1, 1]);
        let mut vote_set = precommit_set(validator_set.clone());

        let vote = signed_vote(&validator_set, &signers[0], 0, VoteType::Precommit, block_id(1));
        assert!(vote_set.add_vote(vote.clone()).unwrap());
        // The resubmission is reported as a duplicate and adds no power.
        assert!(!vote_set.add_vote(vote.clone()).unwrap());
        assert!(!vote_set.add_vote(vote).unwrap());

        let second = signed_vote(&validator_set, &signers[1], 1, VoteType::Precommit, block_id(1));
        assert!(vote_set.add_vote(second).unwrap());
        assert!(!vote_set.has_two_thirds_any());
        assert!(!vote_set.has_two_thirds_majority());

        let third = signed_vote(&validator_set, &signers[2], 2, VoteType::Precommit, block_id(1));
        assert!(vote_set.add_vote(third).unwrap());
        assert_eq!(vote_set.two_thirds_majority(), Some(&block_id(1)));
    }

    #[test]
    fn the_first_majority_is_permanent() {
        let (validator_set, signers) = validators(&[1, 1, 1]);
        let mut vote_set = precommit_set(validator_set.clone());

        for index in 0..3u32 {
            let vote = signed_vote(
                &validator_set,
                &signers[index as usize],
                index,
                VoteType::Precommit,
                block_id(1),
            );
            vote_set.add_vote(vote).unwrap();
        }
        assert_eq!(vote_set.two_thirds_majority(), Some(&block_id(1)));

        // A peer claims +2/3 for a second block, which makes the set track the equivocating
        // votes, and every validator then also precommits that block. The decision must not
        // move: it would take more than a third of the power equivocating to get here.
        vote_set
            .set_peer_maj23(PeerId::new([9u8; 32]), block_id(2))
            .unwrap();
        for index in 0..3u32 {
            let conflicting = signed_vote(
                &validator_set,
                &signers[index as usize],
                index,
                VoteType::Precommit,
                block_id(2),
            );
            assert_eq!(
                vote_set.add_vote(conflicting),
                Err(VoteSetError::ConflictingVote { tracked: true })
            );
        }
        assert_eq!(vote_set.two_thirds_majority(), Some(&block_id(1)));
    }

    #[test]
    fn prevotes_must_not_carry_extensions() {
        let (validator_set, signers) = validators(&[1, 1, 1]);
        let mut prevote_set = VoteSet::new(
            chain_id(),
            Height::new(1),
            Round::new(0),
            VoteType::Prevote,
            validator_set.clone(),
        );

        // Extensions are outside the sign-bytes, so the signature still verifies; the vote set
        // must reject the vote on the extension alone.
        let mut prevote =
            signed_vote(&validator_set, &signers[0], 0, VoteType::Prevote, block_id(1));
        prevote.extension = Some(vec![1, 2, 3]);
        assert_eq!(
            prevote_set.add_vote(prevote),
            Err(VoteSetError::UnexpectedExtension { index: 0 })
        );

        // The same bytes on a precommit are legal.
        let mut vote_set = precommit_set(validator_set.clone());
        let mut precommit =
            signed_vote(&validator_set, &signers[0], 0, VoteType::Precommit, block_id(1));
        precommit.extension = Some(vec![1, 2, 3]);
        assert!(vote_set.add_vote(precommit).unwrap());
    }

    #[test]
    fn extensions_survive_the_commit_round_trip() {
        let (validator_set, signers) = validators(&[1, 1, 1]);
        let mut vote_set = precommit_set(validator_set.clone());

        for index in 0..3u32 {
            let mut vote = signed_vote(
                &validator_set,
                &signers[index as usize],
                index,
                VoteType::Precommit,
                block_id(1),
            );
            vote.extension = Some(vec![index as u8]);
            vote_set.add_vote(vote).unwrap();
        }

        let commit = vote_set.make_commit().unwrap();
        for index in 0..3u32 {
            assert_eq!(
                commit.signatures[index as usize].extension,
                Some(vec![index as u8])
            );
        }

        // Reconstructing the vote set from the commit restores the extensions onto the votes.
        let reconstructed =
            VoteSet::from_commit(chain_id(), &commit, validator_set).unwrap();
        for index in 0..3u32 {
            assert_eq!(
                reconstructed.get_by_index(index).unwrap().extension,
                Some(vec![index as u8])
            );
        }
    }
}
