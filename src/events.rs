/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Definitions of consensus events for event handling and logging.
//! Note: an event for a given action indicates that the action has been completed.

use std::sync::mpsc::Sender;
use std::time::{Duration, SystemTime};

use crate::consensus::round_state::Step;
use crate::types::basic::{CryptoHash, Height, Round};
use crate::types::block::BlockId;
use crate::types::proposal::Proposal;
use crate::types::vote::Vote;

pub enum Event {
    // Events that mark progress through rounds.
    NewRoundStep(NewRoundStepEvent),
    Timeout(TimeoutEvent),
    // Events that involve broadcasting a message.
    Propose(ProposeEvent),
    Vote(VoteEvent),
    // Events that involve receiving a message.
    ReceiveProposal(ReceiveProposalEvent),
    ReceiveVote(ReceiveVoteEvent),
    // Events that change what this replica is bound to.
    Polka(PolkaEvent),
    Lock(LockEvent),
    Unlock(UnlockEvent),
    // Events that change persistent state.
    CommitBlock(CommitBlockEvent),
    UpdateValidatorSet(UpdateValidatorSetEvent),
}

impl Event {
    pub(crate) fn publish(event_publisher: &Option<Sender<Event>>, event: Event) {
        if let Some(event_publisher) = event_publisher {
            event_publisher.send(event).unwrap()
        }
    }
}

pub struct NewRoundStepEvent {
    pub timestamp: SystemTime,
    pub height: Height,
    pub round: Round,
    pub step: Step,
}

pub struct TimeoutEvent {
    pub timestamp: SystemTime,
    pub height: Height,
    pub round: Round,
    pub step: Step,
    pub duration: Duration,
}

pub struct ProposeEvent {
    pub timestamp: SystemTime,
    pub proposal: Proposal,
}

pub struct VoteEvent {
    pub timestamp: SystemTime,
    pub vote: Vote,
}

pub struct ReceiveProposalEvent {
    pub timestamp: SystemTime,
    pub proposal: Proposal,
}

pub struct ReceiveVoteEvent {
    pub timestamp: SystemTime,
    pub vote: Vote,
}

pub struct PolkaEvent {
    pub timestamp: SystemTime,
    pub height: Height,
    pub round: Round,
    pub block_id: BlockId,
}

pub struct LockEvent {
    pub timestamp: SystemTime,
    pub height: Height,
    pub round: Round,
    pub block_id: BlockId,
}

pub struct UnlockEvent {
    pub timestamp: SystemTime,
    pub height: Height,
    pub round: Round,
}

pub struct CommitBlockEvent {
    pub timestamp: SystemTime,
    pub height: Height,
    pub round: Round,
    pub block_hash: CryptoHash,
}

pub struct UpdateValidatorSetEvent {
    pub timestamp: SystemTime,
    pub height: Height,
    pub validators_hash: CryptoHash,
}
