/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The consensus engine: vote accumulation, the round state machine, and the event loop that
//! drives them.
//!
//! The engine is strictly single-threaded. One loop owns all consensus state and drains a single
//! inbox into which everything arrives: peer messages, this replica's own messages looped back,
//! and expired timeouts from the [`timeout`] ticker. No locks guard consensus state because no
//! other thread can touch it.

pub mod height_vote_set;

pub mod implementation;

pub mod round_state;

pub mod timeout;

pub mod vote_set;

use crate::messages::{BlockSyncMessage, ConsensusMessage, PeerStateMessage};
use crate::types::basic::PeerId;

use timeout::TimeoutInfo;

/// Everything that can arrive in the consensus inbox.
pub enum ConsensusInput {
    /// A consensus message, from a peer or looped back from this replica itself (`peer` is
    /// `None` for our own messages).
    Message {
        message: ConsensusMessage,
        peer: Option<PeerId>,
    },
    /// A peer's description of its own progress.
    PeerState { message: PeerStateMessage, peer: PeerId },
    /// A block sync request or response.
    BlockSync { message: BlockSyncMessage, peer: PeerId },
    /// An expired timeout.
    Timeout(TimeoutInfo),
}
