/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Definitions of the messages that replicas exchange.
//!
//! This crate does not move these messages between machines. The [`Node`](crate::node::Node)
//! consumes messages its user feeds in and emits the messages that should be gossiped on an
//! outbound channel; transport, peer management, and gossip scheduling live outside the crate.

use borsh::{BorshDeserialize, BorshSerialize};

use crate::consensus::round_state::Step;
use crate::types::basic::{Height, Round};
use crate::types::bit_vector::BitVector;
use crate::types::block::{Block, BlockId};
use crate::types::part_set::Part;
use crate::types::proposal::Proposal;
use crate::types::vote::{Vote, VoteType};

/// Everything a replica sends or receives.
#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub enum Message {
    Consensus(ConsensusMessage),
    PeerState(PeerStateMessage),
    BlockSync(BlockSyncMessage),
}

/// Messages that drive rounds forward.
#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub enum ConsensusMessage {
    Proposal(Proposal),
    BlockPart {
        height: Height,
        round: Round,
        part: Part,
    },
    Vote(Vote),
}

/// Messages with which peers describe what they have, so gossip can fill gaps.
#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub enum PeerStateMessage {
    /// The sender entered a new (height, round, step).
    NewRoundStep {
        height: Height,
        round: Round,
        step: Step,
        last_commit_round: Round,
    },
    /// The sender holds the vote of the validator at `index`.
    HasVote {
        height: Height,
        round: Round,
        vote_type: VoteType,
        index: u32,
    },
    /// The sender claims +2/3 of the given step voted for `block_id`.
    VoteSetMaj23 {
        height: Height,
        round: Round,
        vote_type: VoteType,
        block_id: BlockId,
    },
    /// Which of the votes for `block_id` the sender holds, in reply to a
    /// [`VoteSetMaj23`](PeerStateMessage::VoteSetMaj23).
    VoteSetBits {
        height: Height,
        round: Round,
        vote_type: VoteType,
        block_id: BlockId,
        votes: BitVector,
    },
}

/// Messages with which a lagging replica fetches committed blocks.
#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub enum BlockSyncMessage {
    BlockRequest { height: Height },
    BlockResponse { block: Block },
    NoBlockResponse { height: Height },
    StatusRequest,
    /// The range of heights the sender can serve.
    StatusResponse { height: Height, base: Height },
}
