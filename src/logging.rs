/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Functions that log out events.
//!
//! The logs defined in this module are printed if the user enabled them via the node's
//! [config](crate::config::Configuration).
//!
//! This crate logs using the [log](https://docs.rs/log/latest/log/) crate. To get these messages
//! printed onto a terminal or to a file, set up a
//! [logging implementation](https://docs.rs/log/latest/log/#available-logging-implementations).
//!
//! ## Log message format
//!
//! Log messages are CSVs (Comma Separated Values) with at least two values. The first two values
//! are always:
//! 1. The name of the [event](crate::events) in PascalCase (defined in this module as constants).
//! 2. The time the event was emitted (as number of seconds since the Unix Epoch).
//!
//! The rest of the values differ depending on the kind of event. For example, the following
//! snippet is how a [ReceiveVote](crate::events::ReceiveVoteEvent) is printed:
//!
//! ```text
//! ReceiveVote, 1701329264, Precommit, 42, 0, Id5u7f6
//! ```
//!
//! In the snippet:
//! - The third, fourth, and fifth values are the vote's type, height, and round.
//! - The sixth value is the first seven characters of the Base64 encoding of the hash of the
//!   block the vote is for.

use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine as _};
use log;
use std::time::SystemTime;

use crate::events::*;

// Names of each event in PascalCase for printing:
pub const NEW_ROUND_STEP: &str = "NewRoundStep";
pub const TIMEOUT: &str = "Timeout";

pub const PROPOSE: &str = "Propose";
pub const VOTE: &str = "Vote";

pub const RECEIVE_PROPOSAL: &str = "ReceiveProposal";
pub const RECEIVE_VOTE: &str = "ReceiveVote";

pub const POLKA: &str = "Polka";
pub const LOCK: &str = "Lock";
pub const UNLOCK: &str = "Unlock";

pub const COMMIT_BLOCK: &str = "CommitBlock";
pub const UPDATE_VALIDATOR_SET: &str = "UpdateValidatorSet";

/// Implemented by event types. Used to get a closure that logs the event.
pub(crate) trait Logger {
    /// Returns a pointer to the default logging handler for a given event type.
    fn get_logger() -> Box<dyn Fn(&Self) + Send>;
}

impl Logger for NewRoundStepEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |new_round_step_event: &NewRoundStepEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                NEW_ROUND_STEP,
                secs_since_unix_epoch(new_round_step_event.timestamp),
                new_round_step_event.height,
                new_round_step_event.round,
                new_round_step_event.step
            )
        };
        Box::new(logger)
    }
}

impl Logger for TimeoutEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |timeout_event: &TimeoutEvent| {
            log::info!(
                "{}, {}, {}, {}, {}, {}",
                TIMEOUT,
                secs_since_unix_epoch(timeout_event.timestamp),
                timeout_event.height,
                timeout_event.round,
                timeout_event.step,
                timeout_event.duration.as_millis()
            )
        };
        Box::new(logger)
    }
}

impl Logger for ProposeEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |propose_event: &ProposeEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                PROPOSE,
                secs_since_unix_epoch(propose_event.timestamp),
                propose_event.proposal.height,
                propose_event.proposal.round,
                first_seven_base64_chars(&propose_event.proposal.block_id.hash.bytes())
            )
        };
        Box::new(logger)
    }
}

impl Logger for VoteEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |vote_event: &VoteEvent| {
            log::info!(
                "{}, {}, {}, {}, {}, {}",
                VOTE,
                secs_since_unix_epoch(vote_event.timestamp),
                vote_event.vote.vote_type,
                vote_event.vote.height,
                vote_event.vote.round,
                first_seven_base64_chars(&vote_event.vote.block_id.hash.bytes())
            )
        };
        Box::new(logger)
    }
}

impl Logger for ReceiveProposalEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |receive_proposal_event: &ReceiveProposalEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                RECEIVE_PROPOSAL,
                secs_since_unix_epoch(receive_proposal_event.timestamp),
                receive_proposal_event.proposal.height,
                receive_proposal_event.proposal.round,
                first_seven_base64_chars(&receive_proposal_event.proposal.block_id.hash.bytes())
            )
        };
        Box::new(logger)
    }
}

impl Logger for ReceiveVoteEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |receive_vote_event: &ReceiveVoteEvent| {
            log::info!(
                "{}, {}, {}, {}, {}, {}",
                RECEIVE_VOTE,
                secs_since_unix_epoch(receive_vote_event.timestamp),
                receive_vote_event.vote.vote_type,
                receive_vote_event.vote.height,
                receive_vote_event.vote.round,
                first_seven_base64_chars(&receive_vote_event.vote.block_id.hash.bytes())
            )
        };
        Box::new(logger)
    }
}

impl Logger for PolkaEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |polka_event: &PolkaEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                POLKA,
                secs_since_unix_epoch(polka_event.timestamp),
                polka_event.height,
                polka_event.round,
                first_seven_base64_chars(&polka_event.block_id.hash.bytes())
            )
        };
        Box::new(logger)
    }
}

impl Logger for LockEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |lock_event: &LockEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                LOCK,
                secs_since_unix_epoch(lock_event.timestamp),
                lock_event.height,
                lock_event.round,
                first_seven_base64_chars(&lock_event.block_id.hash.bytes())
            )
        };
        Box::new(logger)
    }
}

impl Logger for UnlockEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |unlock_event: &UnlockEvent| {
            log::info!(
                "{}, {}, {}, {}",
                UNLOCK,
                secs_since_unix_epoch(unlock_event.timestamp),
                unlock_event.height,
                unlock_event.round
            )
        };
        Box::new(logger)
    }
}

impl Logger for CommitBlockEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |commit_block_event: &CommitBlockEvent| {
            log::info!(
                "{}, {}, {}, {}, {}",
                COMMIT_BLOCK,
                secs_since_unix_epoch(commit_block_event.timestamp),
                commit_block_event.height,
                commit_block_event.round,
                first_seven_base64_chars(&commit_block_event.block_hash.bytes())
            )
        };
        Box::new(logger)
    }
}

impl Logger for UpdateValidatorSetEvent {
    fn get_logger() -> Box<dyn Fn(&Self) + Send> {
        let logger = |update_validator_set_event: &UpdateValidatorSetEvent| {
            log::info!(
                "{}, {}, {}, {}",
                UPDATE_VALIDATOR_SET,
                secs_since_unix_epoch(update_validator_set_event.timestamp),
                update_validator_set_event.height,
                first_seven_base64_chars(&update_validator_set_event.validators_hash.bytes())
            )
        };
        Box::new(logger)
    }
}

// Get a more readable representation of a bytesequence by base64-encoding it and taking the first 7 characters.
fn first_seven_base64_chars(bytes: &[u8]) -> String {
    let encoded = STANDARD_NO_PAD.encode(bytes);
    if encoded.len() > 7 {
        encoded[0..7].to_string()
    } else {
        encoded
    }
}

fn secs_since_unix_epoch(timestamp: SystemTime) -> u64 {
    timestamp
        .duration_since(SystemTime::UNIX_EPOCH)
        .expect("Event occured before the Unix Epoch.")
        .as_secs()
}
