/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! All votes of one height, organized by round.
//!
//! Rounds at or below the engine's current round always have vote sets. Votes for higher rounds
//! are *catch-up* votes: they are accepted, because they are how a lagging replica learns that
//! the network has moved on, but each peer may only open two catch-up rounds per height. Without
//! that bound a malicious peer could make a replica allocate a vote set per round number it
//! invents.

use std::collections::{BTreeMap, HashMap};
use std::fmt::{self, Display, Formatter};
use std::sync::Arc;

use crate::types::basic::{ChainId, Height, PeerId, Round};
use crate::types::block::BlockId;
use crate::types::validators::ValidatorSet;
use crate::types::vote::{Vote, VoteType};

use super::vote_set::{VoteSet, VoteSetError};

/// The prevotes and precommits of one round.
pub struct RoundVoteSet {
    pub prevotes: VoteSet,
    pub precommits: VoteSet,
}

/// Vote sets for every tracked round of one height.
pub struct HeightVoteSet {
    chain_id: ChainId,
    height: Height,
    validator_set: Arc<ValidatorSet>,

    round: Round,
    round_vote_sets: BTreeMap<i32, RoundVoteSet>,
    peer_catchup_rounds: HashMap<PeerId, Vec<i32>>,
}

impl HeightVoteSet {
    pub fn new(chain_id: ChainId, height: Height, validator_set: Arc<ValidatorSet>) -> Self {
        let mut height_vote_set = Self {
            chain_id,
            height,
            validator_set,
            round: Round::new(0),
            round_vote_sets: BTreeMap::new(),
            peer_catchup_rounds: HashMap::new(),
        };
        height_vote_set.add_round(0);
        height_vote_set
    }

    pub fn height(&self) -> Height {
        self.height
    }

    pub fn round(&self) -> Round {
        self.round
    }

    fn add_round(&mut self, round: i32) {
        if self.round_vote_sets.contains_key(&round) {
            return;
        }
        let round_vote_set = RoundVoteSet {
            prevotes: VoteSet::new(
                self.chain_id.clone(),
                self.height,
                Round::new(round),
                VoteType::Prevote,
                Arc::clone(&self.validator_set),
            ),
            precommits: VoteSet::new(
                self.chain_id.clone(),
                self.height,
                Round::new(round),
                VoteType::Precommit,
                Arc::clone(&self.validator_set),
            ),
        };
        self.round_vote_sets.insert(round, round_vote_set);
    }

    /// Advance to `round`, creating vote sets up to one round ahead. Vote sets of earlier rounds
    /// are kept: their polkas remain relevant for unlocking.
    pub fn set_round(&mut self, round: Round) {
        let start = (self.round.int()).max(0);
        for r in start..=round.int() + 1 {
            self.add_round(r);
        }
        self.round = round;
    }

    /// Add a vote, tracking catch-up rounds per peer.
    ///
    /// `peer` is `None` for this replica's own votes and for votes reconstructed from commits,
    /// which are exempt from the catch-up bound.
    pub fn add_vote(
        &mut self,
        vote: Vote,
        peer: Option<PeerId>,
    ) -> Result<bool, HeightVoteSetError> {
        let round = vote.round.int();
        if !self.round_vote_sets.contains_key(&round) {
            match peer {
                Some(peer) => {
                    let catchup_rounds = self.peer_catchup_rounds.entry(peer).or_default();
                    if !catchup_rounds.contains(&round) {
                        if catchup_rounds.len() >= 2 {
                            return Err(HeightVoteSetError::UnwantedRound {
                                peer,
                                round: vote.round,
                            });
                        }
                        catchup_rounds.push(round);
                    }
                    self.add_round(round);
                }
                None => self.add_round(round),
            }
        }
        let vote_set = self.vote_set_mut(Round::new(round), vote.vote_type);
        vote_set
            .add_vote(vote)
            .map_err(HeightVoteSetError::VoteSet)
    }

    pub fn prevotes(&self, round: Round) -> Option<&VoteSet> {
        self.round_vote_sets
            .get(&round.int())
            .map(|round_vote_set| &round_vote_set.prevotes)
    }

    pub fn precommits(&self, round: Round) -> Option<&VoteSet> {
        self.round_vote_sets
            .get(&round.int())
            .map(|round_vote_set| &round_vote_set.precommits)
    }

    fn vote_set_mut(&mut self, round: Round, vote_type: VoteType) -> &mut VoteSet {
        let round_vote_set = self.round_vote_sets.get_mut(&round.int()).unwrap();
        match vote_type {
            VoteType::Prevote => &mut round_vote_set.prevotes,
            VoteType::Precommit => &mut round_vote_set.precommits,
        }
    }

    /// The most recent round at or before the current round whose prevotes reached a +2/3
    /// majority, with the block they agreed on. This is the height's freshest Proof-of-Lock.
    pub fn pol_info(&self) -> Option<(Round, BlockId)> {
        for round in (0..=self.round.int()).rev() {
            if let Some(prevotes) = self.prevotes(Round::new(round)) {
                if let Some(block_id) = prevotes.two_thirds_majority() {
                    return Some((Round::new(round), block_id.clone()));
                }
            }
        }
        None
    }

    /// Take the precommit set of `round` out of this height's votes. Called once when the height
    /// commits, to carry the committing precommits into the next height as its `last_commit`.
    pub fn take_precommits(&mut self, round: Round) -> Option<VoteSet> {
        self.round_vote_sets
            .remove(&round.int())
            .map(|round_vote_set| round_vote_set.precommits)
    }

    /// Record a peer's claim that +2/3 voted for `block_id` in the given round and step.
    /// Ignored for rounds this replica is not tracking.
    pub fn set_peer_maj23(
        &mut self,
        round: Round,
        vote_type: VoteType,
        peer: PeerId,
        block_id: BlockId,
    ) -> Result<(), VoteSetError> {
        if !self.round_vote_sets.contains_key(&round.int()) {
            return Ok(());
        }
        self.vote_set_mut(round, vote_type)
            .set_peer_maj23(peer, block_id)
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum HeightVoteSetError {
    /// The peer sent a vote for a third untracked round this height.
    UnwantedRound { peer: PeerId, round: Round },
    VoteSet(VoteSetError),
}

impl Display for HeightVoteSetError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            HeightVoteSetError::UnwantedRound { peer, round } => {
                write!(
                    f,
                    "peer {:?} exceeded its catch-up round budget with round {}",
                    peer, round
                )
            }
            HeightVoteSetError::VoteSet(source) => Display::fmt(source, f),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::basic::{Address, Power, Timestamp};
    use crate::types::validators::Validator;
    use crate::types::vote::Vote;
    use ed25519_dalek::{Signer, SigningKey};
    use rand_core::OsRng;

    fn fixture() -> (ChainId, Arc<ValidatorSet>, Vec<SigningKey>) {
        let chain_id = ChainId::new("test-chain");
        let keypairs: Vec<SigningKey> = (0..4).map(|_| SigningKey::generate(&mut OsRng)).collect();
        let validator_set = ValidatorSet::new(
            keypairs
                .iter()
                .map(|keypair| Validator::new(keypair.verifying_key(), Power::new(1)))
                .collect(),
        );
        (chain_id, Arc::new(validator_set), keypairs)
    }

    fn signed_vote(
        chain_id: &ChainId,
        validator_set: &ValidatorSet,
        keypairs: &[SigningKey],
        index: u32,
        round: i32,
        block_id: BlockId,
    ) -> Vote {
        let validator = validator_set.get_by_index(index).unwrap();
        let keypair = keypairs
            .iter()
            .find(|keypair| keypair.verifying_key() == validator.pub_key)
            .unwrap();
        let mut vote = Vote::new_unsigned(
            VoteType::Prevote,
            Height::new(1),
            Round::new(round),
            block_id,
            Timestamp::new(1),
            validator.address,
            index,
        );
        let signature = keypair.sign(&vote.sign_bytes(chain_id));
        vote.signature = crate::types::basic::SignatureBytes::new(signature.to_bytes());
        vote
    }

    #[test]
    fn third_catchup_round_from_one_peer_is_rejected() {
        let (chain_id, validator_set, keypairs) = fixture();
        let mut height_vote_set =
            HeightVoteSet::new(chain_id.clone(), Height::new(1), Arc::clone(&validator_set));
        let peer = PeerId::new([7u8; 32]);

        // Rounds 0 and 1 exist (current round plus one ahead); rounds 5, 6, 7 are catch-up.
        for (index, round) in [(0u32, 5), (1u32, 6)] {
            let vote = signed_vote(&chain_id, &validator_set, &keypairs, index, round, BlockId::zero());
            assert!(height_vote_set.add_vote(vote, Some(peer)).is_ok());
        }
        let vote = signed_vote(&chain_id, &validator_set, &keypairs, 2, 7, BlockId::zero());
        assert_eq!(
            height_vote_set.add_vote(vote, Some(peer)),
            Err(HeightVoteSetError::UnwantedRound {
                peer,
                round: Round::new(7)
            })
        );

        // A repeat vote into an already-opened catch-up round is still fine.
        let vote = signed_vote(&chain_id, &validator_set, &keypairs, 3, 5, BlockId::zero());
        assert!(height_vote_set.add_vote(vote, Some(peer)).is_ok());
    }

    #[test]
    fn pol_info_returns_the_latest_polka() {
        let (chain_id, validator_set, keypairs) = fixture();
        let mut height_vote_set =
            HeightVoteSet::new(chain_id.clone(), Height::new(1), Arc::clone(&validator_set));
        height_vote_set.set_round(Round::new(2));

        let block_id = BlockId::new(
            crate::types::basic::CryptoHash::new([9u8; 32]),
            crate::types::block::PartSetHeader {
                total: 1,
                hash: crate::types::basic::CryptoHash::new([8u8; 32]),
            },
        );
        for index in 0..3 {
            let vote = signed_vote(&chain_id, &validator_set, &keypairs, index, 1, block_id.clone());
            height_vote_set.add_vote(vote, None).unwrap();
        }
        assert_eq!(height_vote_set.pol_info(), Some((Round::new(1), block_id)));
    }
}
