/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The mutable state of the consensus engine within one height.

use std::fmt::{self, Display, Formatter};
use std::sync::Arc;

use borsh::{BorshDeserialize, BorshSerialize};

use crate::types::basic::{Height, Round, Timestamp};
use crate::types::block::Block;
use crate::types::part_set::PartSet;
use crate::types::proposal::Proposal;
use crate::types::validators::ValidatorSet;

use super::height_vote_set::HeightVoteSet;
use super::vote_set::VoteSet;

/// Where within a round the engine currently is.
///
/// The variants are ordered: a timeout scheduled for an earlier step of the same (height, round)
/// is stale once the engine has moved to a later step.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize,
)]
pub enum Step {
    /// Waiting out the commit timeout of the previous height before starting round 0.
    NewHeight,
    NewRound,
    Propose,
    Prevote,
    /// Got +2/3 prevotes for conflicting things; waiting briefly for stragglers.
    PrevoteWait,
    Precommit,
    /// Got +2/3 precommits for conflicting things; waiting briefly for stragglers.
    PrecommitWait,
    Commit,
}

impl Display for Step {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let name = match self {
            Step::NewHeight => "NewHeight",
            Step::NewRound => "NewRound",
            Step::Propose => "Propose",
            Step::Prevote => "Prevote",
            Step::PrevoteWait => "PrevoteWait",
            Step::Precommit => "Precommit",
            Step::PrecommitWait => "PrecommitWait",
            Step::Commit => "Commit",
        };
        f.write_str(name)
    }
}

/// Everything the engine tracks about the height in progress.
///
/// The lock fields enforce the safety rule: once this replica precommits a block, it stays
/// locked on that block, prevoting it in later rounds and refusing to prevote anything else,
/// until a newer polka releases or moves the lock. The valid fields track the most recent block
/// known to have had a polka, which is what a proposer re-proposes.
pub struct RoundState {
    pub height: Height,
    pub round: Round,
    pub step: Step,

    /// When round 0 of this height may start (the previous height's commit time plus the commit
    /// timeout).
    pub start_time: Timestamp,
    /// When the block of this height was committed.
    pub commit_time: Timestamp,

    pub validators: Arc<ValidatorSet>,

    pub proposal: Option<Proposal>,
    pub proposal_block: Option<Block>,
    pub proposal_block_parts: Option<PartSet>,

    /// Round in which this replica precommitted `locked_block`, or [`Round::NONE`].
    pub locked_round: Round,
    pub locked_block: Option<Block>,
    pub locked_block_parts: Option<PartSet>,

    /// Most recent round with a polka for `valid_block`, or [`Round::NONE`].
    pub valid_round: Round,
    pub valid_block: Option<Block>,
    pub valid_block_parts: Option<PartSet>,

    pub votes: HeightVoteSet,

    /// Round in which the commit of this height was reached, or [`Round::NONE`].
    pub commit_round: Round,
    /// The +2/3 precommits that committed the previous height. Embedded in any block this
    /// replica proposes, and still accepting latecomer precommits during `NewHeight`.
    pub last_commit: Option<VoteSet>,
    pub last_validators: Arc<ValidatorSet>,

    /// Whether the precommit-wait timeout has already been scheduled this round.
    pub triggered_timeout_precommit: bool,
}

impl RoundState {
    /// Whether the proposal of the current round is complete: the proposal message arrived, all
    /// block parts arrived, and, for a re-proposal, the justifying polka is visible.
    pub fn is_proposal_complete(&self) -> bool {
        let proposal = match &self.proposal {
            Some(proposal) => proposal,
            None => return false,
        };
        if self.proposal_block.is_none() {
            return false;
        }
        if proposal.pol_round.is_none() {
            return true;
        }
        // Re-proposal: we must have seen the +2/3 prevotes it claims, or we could be tricked
        // into prevoting something that never had a polka.
        match self.votes.prevotes(proposal.pol_round) {
            Some(prevotes) => prevotes.has_two_thirds_majority(),
            None => false,
        }
    }
}
