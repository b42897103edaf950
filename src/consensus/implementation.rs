/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The round state machine that drives heights to commitment.
//!
//! [`ConsensusState`] owns everything: the inter-block [`State`], the current height's
//! [`RoundState`], the signer, and the executor. It runs on a single thread, draining one inbox
//! of [`ConsensusInput`]s. Every transition below is guarded by the (height, round, step) it
//! belongs to, so stale timeouts and replayed messages fall through harmlessly.
//!
//! The safety-critical rules live in three places:
//! - [`do_prevote`](ConsensusState::do_prevote): a locked replica prevotes its locked block and
//!   nothing else.
//! - [`enter_precommit`](ConsensusState::enter_precommit): only a polka in the current round can
//!   create, move, or release a lock.
//! - [`try_add_vote`](ConsensusState::try_add_vote): a lock is released only when a polka from a
//!   round later than the locked round shows the network has moved on.

use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime};

use log::{debug, error, info, warn};

use crate::app::App;
use crate::config::Configuration;
use crate::events::*;
use crate::executor::BlockExecutor;
use crate::messages::{BlockSyncMessage, ConsensusMessage, Message, PeerStateMessage};
use crate::privval::FilePv;
use crate::state::State;
use crate::store::{BlockStore, KVStore};
use crate::types::basic::{Height, PeerId, Round, Timestamp};
use crate::types::bit_vector::BitVector;
use crate::types::block::{BlockId, Commit};
use crate::types::part_set::{Part, PartSet};
use crate::types::proposal::Proposal;
use crate::types::vote::{Vote, VoteType};

use super::height_vote_set::{HeightVoteSet, HeightVoteSetError};
use super::round_state::{RoundState, Step};
use super::timeout::TimeoutInfo;
use super::vote_set::{VoteSet, VoteSetError};
use super::ConsensusInput;

/// How often the consensus thread wakes up to poll the shutdown signal while its inbox is idle.
const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// The consensus engine of one replica.
pub(crate) struct ConsensusState<K: KVStore, A: App> {
    config: Configuration,
    privval: Option<FilePv>,

    state: State,
    rs: RoundState,

    executor: BlockExecutor<K, A>,
    block_store: BlockStore<K>,

    /// Loopback into this engine's own inbox. The replica's own proposals, block parts, and
    /// votes go through the same channel as everyone else's.
    inbox: Sender<ConsensusInput>,
    ticker: Sender<TimeoutInfo>,
    /// Messages for the user's transport. `None` as the destination means broadcast.
    outbound: Sender<(Option<PeerId>, Message)>,
    event_publisher: Option<Sender<Event>>,
}

impl<K: KVStore, A: App> ConsensusState<K, A> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        config: Configuration,
        state: State,
        privval: Option<FilePv>,
        executor: BlockExecutor<K, A>,
        block_store: BlockStore<K>,
        last_commit: Option<VoteSet>,
        inbox: Sender<ConsensusInput>,
        ticker: Sender<TimeoutInfo>,
        outbound: Sender<(Option<PeerId>, Message)>,
        event_publisher: Option<Sender<Event>>,
    ) -> Self {
        let start_time = Timestamp::now().add_millis(config.timeout_commit.as_millis() as i64);
        let rs = new_round_state(&state, last_commit, start_time);
        Self {
            config,
            privval,
            state,
            rs,
            executor,
            block_store,
            inbox,
            ticker,
            outbound,
            event_publisher,
        }
    }

    /// Run the engine until `shutdown_signal` fires or the inbox closes.
    pub(crate) fn start(
        mut self,
        inputs: Receiver<ConsensusInput>,
        shutdown_signal: Receiver<()>,
    ) -> JoinHandle<()> {
        thread::spawn(move || {
            self.schedule_new_height_timeout();
            loop {
                match shutdown_signal.try_recv() {
                    Ok(()) => return,
                    Err(TryRecvError::Empty) => (),
                    Err(TryRecvError::Disconnected) => {
                        panic!("consensus thread disconnected from main thread")
                    }
                }

                match inputs.recv_timeout(IDLE_POLL_INTERVAL) {
                    Ok(input) => self.handle_input(input),
                    Err(RecvTimeoutError::Timeout) => (),
                    Err(RecvTimeoutError::Disconnected) => return,
                }
            }
        })
    }

    fn handle_input(&mut self, input: ConsensusInput) {
        match input {
            ConsensusInput::Message { message, peer } => self.handle_message(message, peer),
            ConsensusInput::PeerState { message, peer } => self.handle_peer_state(message, peer),
            ConsensusInput::BlockSync { message, peer } => self.handle_block_sync(message, peer),
            ConsensusInput::Timeout(timeout_info) => self.handle_timeout(timeout_info),
        }
    }

    fn handle_message(&mut self, message: ConsensusMessage, peer: Option<PeerId>) {
        match message {
            ConsensusMessage::Proposal(proposal) => {
                if peer.is_some() {
                    Event::publish(
                        &self.event_publisher,
                        Event::ReceiveProposal(ReceiveProposalEvent {
                            timestamp: SystemTime::now(),
                            proposal: proposal.clone(),
                        }),
                    );
                }
                self.set_proposal(proposal);
            }
            ConsensusMessage::BlockPart {
                height,
                round: _,
                part,
            } => self.add_proposal_block_part(height, part),
            ConsensusMessage::Vote(vote) => {
                if peer.is_some() {
                    Event::publish(
                        &self.event_publisher,
                        Event::ReceiveVote(ReceiveVoteEvent {
                            timestamp: SystemTime::now(),
                            vote: vote.clone(),
                        }),
                    );
                }
                self.try_add_vote(vote, peer);
            }
        }
    }

    // Round transitions.
    //
    // Each `enter_*` below mirrors one arrow of the round state machine. Every one starts with a
    // guard on (height, round, step); calling them out of turn is a no-op, which is what lets
    // vote handling fire them opportunistically.

    fn handle_timeout(&mut self, timeout_info: TimeoutInfo) {
        if timeout_info.height != self.rs.height
            || timeout_info.round < self.rs.round
            || (timeout_info.round == self.rs.round && timeout_info.step < self.rs.step)
        {
            debug!(
                "discarding stale timeout for {}/{}/{}",
                timeout_info.height, timeout_info.round, timeout_info.step
            );
            return;
        }
        Event::publish(
            &self.event_publisher,
            Event::Timeout(TimeoutEvent {
                timestamp: SystemTime::now(),
                height: timeout_info.height,
                round: timeout_info.round,
                step: timeout_info.step,
                duration: timeout_info.duration,
            }),
        );
        match timeout_info.step {
            Step::NewHeight => self.enter_new_round(timeout_info.height, Round::new(0)),
            Step::Propose => self.enter_prevote(timeout_info.height, timeout_info.round),
            Step::PrevoteWait => self.enter_precommit(timeout_info.height, timeout_info.round),
            Step::PrecommitWait => {
                self.enter_precommit(timeout_info.height, timeout_info.round);
                self.enter_new_round(timeout_info.height, timeout_info.round + 1);
            }
            _ => (),
        }
    }

    fn enter_new_round(&mut self, height: Height, round: Round) {
        if self.rs.height != height
            || round < self.rs.round
            || (self.rs.round == round && self.rs.step != Step::NewHeight)
        {
            return;
        }
        info!("entering round {} at height {}", round, height);

        // Skipped rounds still consume proposer turns.
        if round > self.rs.round {
            let mut validators = (*self.rs.validators).clone();
            validators.increment_proposer_priority((round.int() - self.rs.round.int()) as u32);
            self.rs.validators = Arc::new(validators);
        }
        self.rs.round = round;
        self.rs.step = Step::NewRound;
        if round.int() != 0 {
            // The proposal belonged to the failed round.
            self.rs.proposal = None;
            self.rs.proposal_block = None;
            self.rs.proposal_block_parts = None;
        }
        self.rs.votes.set_round(round);
        self.rs.triggered_timeout_precommit = false;
        self.publish_new_round_step();

        self.enter_propose(height, round);
    }

    fn enter_propose(&mut self, height: Height, round: Round) {
        if self.rs.height != height
            || round < self.rs.round
            || (self.rs.round == round && self.rs.step >= Step::Propose)
        {
            return;
        }
        self.rs.step = Step::Propose;
        self.publish_new_round_step();

        self.schedule_timeout(self.config.propose_timeout(round), round, Step::Propose);

        if self.is_proposer() {
            self.decide_proposal(height, round);
        }

        // A complete proposal can already be on hand when re-entering propose after a skipped
        // round.
        if self.rs.is_proposal_complete() {
            self.enter_prevote(height, round);
        }
    }

    fn is_proposer(&self) -> bool {
        match (&self.privval, self.rs.validators.current_proposer()) {
            (Some(privval), Some(proposer)) => privval.address() == proposer.address,
            _ => false,
        }
    }

    /// Choose and announce this replica's proposal: the freshest polka'd block if one exists,
    /// otherwise a new block from the application.
    fn decide_proposal(&mut self, height: Height, round: Round) {
        let (block, block_parts) = match (&self.rs.valid_block, &self.rs.valid_block_parts) {
            (Some(block), Some(block_parts)) => (block.clone(), block_parts.clone()),
            _ => {
                let last_commit = if height == self.state.initial_height {
                    Commit::empty()
                } else {
                    let last_commit_votes = match &self.rs.last_commit {
                        Some(votes) => votes,
                        None => {
                            error!("cannot propose: no commit for the previous height");
                            return;
                        }
                    };
                    match last_commit_votes.make_commit() {
                        Ok(commit) => commit,
                        Err(err) => {
                            error!("cannot propose: {}", err);
                            return;
                        }
                    }
                };
                let proposer_address = match &self.privval {
                    Some(privval) => privval.address(),
                    None => return,
                };
                let block = self.executor.create_proposal_block(
                    height,
                    &self.state,
                    last_commit,
                    proposer_address,
                );
                let block_parts = PartSet::from_block(&block, self.config.block_part_size);
                (block, block_parts)
            }
        };

        let block_id = BlockId::new(block.hash(), *block_parts.header());
        let mut proposal = Proposal::new_unsigned(
            height,
            round,
            self.rs.valid_round,
            block_id,
            Timestamp::now(),
        );
        let privval = self.privval.as_mut().expect("checked by is_proposer");
        if let Err(err) = privval.sign_proposal(&self.state.chain_id, &mut proposal) {
            error!("failed to sign proposal: {}", err);
            return;
        }

        Event::publish(
            &self.event_publisher,
            Event::Propose(ProposeEvent {
                timestamp: SystemTime::now(),
                proposal: proposal.clone(),
            }),
        );
        self.broadcast(ConsensusMessage::Proposal(proposal));
        for part in block_parts.parts() {
            self.broadcast(ConsensusMessage::BlockPart {
                height,
                round,
                part: part.clone(),
            });
        }
    }

    fn set_proposal(&mut self, proposal: Proposal) {
        if self.rs.proposal.is_some() {
            return;
        }
        if proposal.height != self.rs.height || proposal.round != self.rs.round {
            debug!("ignoring proposal for {}/{}", proposal.height, proposal.round);
            return;
        }
        if !proposal.pol_round.is_none()
            && (proposal.pol_round.int() < 0 || proposal.pol_round >= proposal.round)
        {
            warn!("proposal has an invalid POL round {}", proposal.pol_round);
            return;
        }
        let proposer = match self.rs.validators.current_proposer() {
            Some(proposer) => proposer,
            None => return,
        };
        if !proposal.verify_signature(&self.state.chain_id, &proposer.pub_key) {
            warn!("proposal signature does not verify against the round's proposer");
            return;
        }

        info!("received {}", proposal);
        if self.rs.proposal_block_parts.is_none() {
            self.rs.proposal_block_parts =
                Some(PartSet::from_header(proposal.block_id.part_set_header));
        }
        self.rs.proposal = Some(proposal);
    }

    fn add_proposal_block_part(&mut self, height: Height, part: Part) {
        if height != self.rs.height {
            debug!("ignoring block part for height {}", height);
            return;
        }
        let block_parts = match self.rs.proposal_block_parts.as_mut() {
            Some(block_parts) => block_parts,
            // No proposal (or polka) has announced a part set header yet.
            None => return,
        };
        match block_parts.add_part(part) {
            Ok(true) => (),
            Ok(false) => return,
            Err(err) => {
                warn!("rejecting block part: {}", err);
                return;
            }
        }
        if !block_parts.is_complete() {
            return;
        }

        let block = match block_parts.to_block() {
            Ok(block) => block,
            Err(err) => {
                error!("complete part set does not decode to a block: {}", err);
                return;
            }
        };
        if let Some(proposal) = &self.rs.proposal {
            if block.hash() != proposal.block_id.hash {
                warn!("assembled block does not match the proposal");
                return;
            }
        }
        info!(
            "received complete block for height {} ({} parts)",
            height,
            self.rs.proposal_block_parts.as_ref().unwrap().total()
        );
        self.rs.proposal_block = Some(block);

        // If the current round already has a polka for this block, it becomes the valid block.
        let polka = self
            .rs
            .votes
            .prevotes(self.rs.round)
            .and_then(|prevotes| prevotes.two_thirds_majority().cloned());
        if let Some(block_id) = polka {
            if !block_id.is_zero()
                && self.rs.valid_round < self.rs.round
                && self.rs.proposal_block.as_ref().unwrap().hash() == block_id.hash
            {
                self.rs.valid_round = self.rs.round;
                self.rs.valid_block = self.rs.proposal_block.clone();
                self.rs.valid_block_parts = self.rs.proposal_block_parts.clone();
            }
        }

        if self.rs.step <= Step::Propose && self.rs.is_proposal_complete() {
            self.enter_prevote(self.rs.height, self.rs.round);
        } else if self.rs.step == Step::Commit {
            self.try_finalize_commit(self.rs.height);
        }
    }

    fn enter_prevote(&mut self, height: Height, round: Round) {
        if self.rs.height != height
            || round < self.rs.round
            || (self.rs.round == round && self.rs.step >= Step::Prevote)
        {
            return;
        }
        self.do_prevote();
        self.rs.step = Step::Prevote;
        self.publish_new_round_step();
    }

    fn do_prevote(&mut self) {
        // Locked: prevote the lock regardless of the proposal.
        if let (Some(block), Some(block_parts)) = (&self.rs.locked_block, &self.rs.locked_block_parts)
        {
            let block_id = BlockId::new(block.hash(), *block_parts.header());
            self.sign_and_broadcast_vote(VoteType::Prevote, block_id);
            return;
        }

        let block = match &self.rs.proposal_block {
            Some(block) => block.clone(),
            None => {
                debug!("no proposal block by prevote time, prevoting nil");
                self.sign_and_broadcast_vote(VoteType::Prevote, BlockId::zero());
                return;
            }
        };
        if let Err(err) = self.executor.validate_block(&self.state, &block) {
            warn!("proposal block is invalid, prevoting nil: {}", err);
            self.sign_and_broadcast_vote(VoteType::Prevote, BlockId::zero());
            return;
        }
        let block_id = BlockId::new(
            block.hash(),
            *self.rs.proposal_block_parts.as_ref().unwrap().header(),
        );
        self.sign_and_broadcast_vote(VoteType::Prevote, block_id);
    }

    fn enter_prevote_wait(&mut self, height: Height, round: Round) {
        if self.rs.height != height
            || round < self.rs.round
            || (self.rs.round == round && self.rs.step >= Step::PrevoteWait)
        {
            return;
        }
        self.rs.step = Step::PrevoteWait;
        self.publish_new_round_step();
        self.schedule_timeout(self.config.prevote_timeout(round), round, Step::PrevoteWait);
    }

    fn enter_precommit(&mut self, height: Height, round: Round) {
        if self.rs.height != height
            || round < self.rs.round
            || (self.rs.round == round && self.rs.step >= Step::Precommit)
        {
            return;
        }

        let polka = self
            .rs
            .votes
            .prevotes(round)
            .and_then(|prevotes| prevotes.two_thirds_majority().cloned());

        match polka {
            // No polka: precommit nil, keeping any lock.
            None => self.sign_and_broadcast_vote(VoteType::Precommit, BlockId::zero()),

            // Polka for nil: release the lock and precommit nil.
            Some(block_id) if block_id.is_zero() => {
                if self.rs.locked_block.is_some() {
                    self.unlock(height, round);
                }
                self.sign_and_broadcast_vote(VoteType::Precommit, BlockId::zero());
            }

            Some(block_id) => {
                Event::publish(
                    &self.event_publisher,
                    Event::Polka(PolkaEvent {
                        timestamp: SystemTime::now(),
                        height,
                        round,
                        block_id: block_id.clone(),
                    }),
                );

                let locked_hash = self.rs.locked_block.as_ref().map(|block| block.hash());
                let proposal_hash = self.rs.proposal_block.as_ref().map(|block| block.hash());

                if locked_hash == Some(block_id.hash) {
                    // Relock on the same block in this round.
                    self.rs.locked_round = round;
                    self.publish_lock(height, round, block_id.clone());
                    self.sign_and_broadcast_vote(VoteType::Precommit, block_id);
                } else if proposal_hash == Some(block_id.hash) {
                    let block = self.rs.proposal_block.clone().unwrap();
                    if let Err(err) = self.executor.validate_block(&self.state, &block) {
                        // +2/3 prevoted a block that fails validation. Something is deeply
                        // wrong on this replica or in the network; do not precommit it.
                        error!("polka'd block fails validation: {}", err);
                        self.sign_and_broadcast_vote(VoteType::Precommit, BlockId::zero());
                    } else {
                        self.rs.locked_round = round;
                        self.rs.locked_block = Some(block);
                        self.rs.locked_block_parts = self.rs.proposal_block_parts.clone();
                        self.publish_lock(height, round, block_id.clone());
                        self.sign_and_broadcast_vote(VoteType::Precommit, block_id);
                    }
                } else {
                    // Polka for a block this replica has not seen. The lock is released (the
                    // polka proves +2/3 are past it), and the parts are fetched in case the
                    // block commits.
                    if self.rs.locked_block.is_some() {
                        self.unlock(height, round);
                    }
                    if !self
                        .rs
                        .proposal_block_parts
                        .as_ref()
                        .map_or(false, |parts| parts.has_header(&block_id.part_set_header))
                    {
                        self.rs.proposal_block = None;
                        self.rs.proposal_block_parts =
                            Some(PartSet::from_header(block_id.part_set_header));
                    }
                    self.sign_and_broadcast_vote(VoteType::Precommit, BlockId::zero());
                }
            }
        }

        self.rs.step = Step::Precommit;
        self.publish_new_round_step();
    }

    fn enter_precommit_wait(&mut self, height: Height, round: Round) {
        if self.rs.height != height
            || round < self.rs.round
            || (self.rs.round == round && self.rs.triggered_timeout_precommit)
        {
            return;
        }
        self.rs.triggered_timeout_precommit = true;
        self.schedule_timeout(
            self.config.precommit_timeout(round),
            round,
            Step::PrecommitWait,
        );
    }

    fn enter_commit(&mut self, height: Height, commit_round: Round) {
        if self.rs.height != height || self.rs.step >= Step::Commit {
            return;
        }
        let block_id = match self
            .rs
            .votes
            .precommits(commit_round)
            .and_then(|precommits| precommits.two_thirds_majority().cloned())
        {
            Some(block_id) if !block_id.is_zero() => block_id,
            _ => {
                error!("entered commit without a +2/3 precommit majority for a block");
                return;
            }
        };

        self.rs.commit_round = commit_round;
        self.rs.commit_time = Timestamp::now();

        // The locked block is the committed block whenever this replica took part in the commit.
        if self.rs.locked_block.as_ref().map(|block| block.hash()) == Some(block_id.hash) {
            self.rs.proposal_block = self.rs.locked_block.clone();
            self.rs.proposal_block_parts = self.rs.locked_block_parts.clone();
        }
        // Otherwise the block may still be in flight; make sure the right parts are collected.
        if !self
            .rs
            .proposal_block_parts
            .as_ref()
            .map_or(false, |parts| parts.has_header(&block_id.part_set_header))
        {
            self.rs.proposal_block = None;
            self.rs.proposal_block_parts = Some(PartSet::from_header(block_id.part_set_header));
        }

        self.rs.step = Step::Commit;
        self.publish_new_round_step();
        self.try_finalize_commit(height);
    }

    fn try_finalize_commit(&mut self, height: Height) {
        if self.rs.height != height {
            return;
        }
        let block_id = match self
            .rs
            .votes
            .precommits(self.rs.commit_round)
            .and_then(|precommits| precommits.two_thirds_majority().cloned())
        {
            Some(block_id) if !block_id.is_zero() => block_id,
            _ => return,
        };
        match &self.rs.proposal_block {
            Some(block) if block.hash() == block_id.hash => (),
            // The committed block has not fully arrived yet.
            _ => return,
        }
        self.finalize_commit(height, block_id);
    }

    fn finalize_commit(&mut self, height: Height, block_id: BlockId) {
        let block = self.rs.proposal_block.clone().unwrap();

        if let Err(err) = self.executor.validate_block(&self.state, &block) {
            error!("+2/3 precommitted an invalid block: {}", err);
            return;
        }

        let stored_height = match self.block_store.height() {
            Ok(stored_height) => stored_height,
            Err(err) => {
                error!("cannot read the block store: {}", err);
                return;
            }
        };
        if stored_height < height {
            let seen_commit = match self
                .rs
                .votes
                .precommits(self.rs.commit_round)
                .expect("commit round has a vote set")
                .make_commit()
            {
                Ok(commit) => commit,
                Err(err) => {
                    error!("cannot build the seen commit: {}", err);
                    return;
                }
            };
            if let Err(err) = self.block_store.save_block(&block, &block_id, &seen_commit) {
                error!("cannot save the committed block: {}", err);
                return;
            }
        }

        let new_state = match self.executor.apply_block(&self.state, &block_id, &block) {
            Ok(new_state) => new_state,
            Err(err) => {
                // A block that +2/3 precommitted failed to execute. The replica cannot make
                // progress past it.
                error!("failed to execute committed block: {}", err);
                return;
            }
        };

        Event::publish(
            &self.event_publisher,
            Event::CommitBlock(CommitBlockEvent {
                timestamp: SystemTime::now(),
                height,
                round: self.rs.commit_round,
                block_hash: block.hash(),
            }),
        );
        if new_state.validators.hash() != self.state.validators.hash() {
            Event::publish(
                &self.event_publisher,
                Event::UpdateValidatorSet(UpdateValidatorSetEvent {
                    timestamp: SystemTime::now(),
                    height,
                    validators_hash: new_state.validators.hash(),
                }),
            );
        }

        let last_commit = self.rs.votes.take_precommits(self.rs.commit_round);
        self.update_to_state(new_state, last_commit);
        self.schedule_new_height_timeout();
    }

    /// Replace the round state with a fresh one for the height after `new_state`.
    fn update_to_state(&mut self, new_state: State, last_commit: Option<VoteSet>) {
        let commit_time = if self.rs.commit_time == Timestamp::zero() {
            Timestamp::now()
        } else {
            self.rs.commit_time
        };
        let start_time = commit_time.add_millis(self.config.timeout_commit.as_millis() as i64);
        self.rs = new_round_state(&new_state, last_commit, start_time);
        self.state = new_state;
    }

    // Vote handling.

    fn try_add_vote(&mut self, vote: Vote, peer: Option<PeerId>) {
        // Latecomer precommits for the height just committed tighten its seen commit and can
        // cut the commit timeout short.
        if vote.height + 1 == self.rs.height {
            if !(self.rs.step == Step::NewHeight && vote.vote_type == VoteType::Precommit) {
                return;
            }
            let last_commit = match self.rs.last_commit.as_mut() {
                Some(last_commit) => last_commit,
                None => return,
            };
            let announce = (vote.round, vote.validator_index);
            match last_commit.add_vote(vote) {
                Ok(true) => {
                    self.send_peer_state(
                        None,
                        PeerStateMessage::HasVote {
                            height: self.rs.height - 1,
                            round: announce.0,
                            vote_type: VoteType::Precommit,
                            index: announce.1,
                        },
                    );
                }
                Ok(false) => return,
                Err(err) => {
                    debug!("discarding last-commit precommit: {}", err);
                    return;
                }
            }
            if self.config.skip_timeout_commit
                && self.rs.last_commit.as_ref().unwrap().has_all()
            {
                self.enter_new_round(self.rs.height, Round::new(0));
            }
            return;
        }

        if vote.height != self.rs.height {
            debug!("ignoring vote for height {}", vote.height);
            return;
        }

        let height = self.rs.height;
        let vote_round = vote.round;
        let vote_type = vote.vote_type;
        let vote_index = vote.validator_index;
        match self.rs.votes.add_vote(vote, peer) {
            Ok(_) => (),
            Err(HeightVoteSetError::VoteSet(VoteSetError::ConflictingVote { tracked })) => {
                warn!(
                    "validator {} equivocated in {}/{}/{}",
                    vote_index, height, vote_round, vote_type
                );
                if !tracked {
                    return;
                }
                // The conflicting vote backs a peer's +2/3 claim; it counts toward that block.
            }
            Err(err) => {
                debug!("discarding vote: {}", err);
                return;
            }
        }
        self.send_peer_state(
            None,
            PeerStateMessage::HasVote {
                height,
                round: vote_round,
                vote_type,
                index: vote_index,
            },
        );

        match vote_type {
            VoteType::Prevote => self.handle_added_prevote(height, vote_round),
            VoteType::Precommit => self.handle_added_precommit(height, vote_round),
        }
    }

    fn handle_added_prevote(&mut self, height: Height, vote_round: Round) {
        let polka = self
            .rs
            .votes
            .prevotes(vote_round)
            .and_then(|prevotes| prevotes.two_thirds_majority().cloned());

        if let Some(block_id) = &polka {
            // Unlock rule: a polka from a later round than the lock releases it, unless the
            // polka is for the locked block itself.
            if self.rs.locked_round < vote_round
                && vote_round <= self.rs.round
                && self
                    .rs
                    .locked_block
                    .as_ref()
                    .map_or(false, |block| block.hash() != block_id.hash)
            {
                info!(
                    "unlocking: round {} polka supersedes the lock from round {}",
                    vote_round, self.rs.locked_round
                );
                self.unlock(height, vote_round);
            }

            // Valid-block rule: the freshest polka'd block is what the next proposer re-proposes.
            if !block_id.is_zero() && self.rs.valid_round < vote_round && vote_round == self.rs.round
            {
                if self.rs.proposal_block.as_ref().map(|block| block.hash())
                    == Some(block_id.hash)
                {
                    self.rs.valid_round = vote_round;
                    self.rs.valid_block = self.rs.proposal_block.clone();
                    self.rs.valid_block_parts = self.rs.proposal_block_parts.clone();
                } else {
                    // Polka for a block this replica has not assembled; fetch its parts.
                    self.rs.proposal_block = None;
                    if !self
                        .rs
                        .proposal_block_parts
                        .as_ref()
                        .map_or(false, |parts| parts.has_header(&block_id.part_set_header))
                    {
                        self.rs.proposal_block_parts =
                            Some(PartSet::from_header(block_id.part_set_header));
                    }
                }
            }
        }

        let has_two_thirds_any = self
            .rs
            .votes
            .prevotes(vote_round)
            .map_or(false, |prevotes| prevotes.has_two_thirds_any());

        if self.rs.round < vote_round && has_two_thirds_any {
            // The network is ahead; skip to its round.
            self.enter_new_round(height, vote_round);
        } else if self.rs.round == vote_round && self.rs.step >= Step::Prevote {
            match &polka {
                Some(block_id) if self.rs.is_proposal_complete() || block_id.is_zero() => {
                    self.enter_precommit(height, vote_round);
                }
                _ if has_two_thirds_any => {
                    self.enter_prevote_wait(height, vote_round);
                }
                _ => (),
            }
        } else if self
            .rs
            .proposal
            .as_ref()
            .map_or(false, |proposal| proposal.pol_round == vote_round)
        {
            // The polka that justifies the pending re-proposal arrived.
            if self.rs.is_proposal_complete() {
                self.enter_prevote(height, self.rs.round);
            }
        }
    }

    fn handle_added_precommit(&mut self, height: Height, vote_round: Round) {
        let (majority, has_two_thirds_any, has_all) = match self.rs.votes.precommits(vote_round) {
            Some(precommits) => (
                precommits.two_thirds_majority().cloned(),
                precommits.has_two_thirds_any(),
                precommits.has_all(),
            ),
            None => return,
        };

        if let Some(block_id) = majority {
            self.enter_new_round(height, vote_round);
            self.enter_precommit(height, vote_round);
            if !block_id.is_zero() {
                self.enter_commit(height, vote_round);
                if self.config.skip_timeout_commit && has_all {
                    self.enter_new_round(self.rs.height, Round::new(0));
                }
            } else {
                self.enter_precommit_wait(height, vote_round);
            }
        } else if self.rs.round <= vote_round && has_two_thirds_any {
            self.enter_new_round(height, vote_round);
            self.enter_precommit_wait(height, vote_round);
        }
    }

    fn sign_and_broadcast_vote(&mut self, vote_type: VoteType, block_id: BlockId) {
        let validator_address = match &self.privval {
            Some(privval) => privval.address(),
            // Listeners follow consensus without voting in it.
            None => return,
        };
        let validator_index = match self.rs.validators.index_of(&validator_address) {
            Some(index) => index,
            None => return,
        };
        let mut vote = Vote::new_unsigned(
            vote_type,
            self.rs.height,
            self.rs.round,
            block_id,
            self.vote_time(),
            validator_address,
            validator_index,
        );
        let privval = self.privval.as_mut().unwrap();
        if let Err(err) = privval.sign_vote(&self.state.chain_id, &mut vote) {
            error!("failed to sign {}: {}", vote, err);
            return;
        }
        Event::publish(
            &self.event_publisher,
            Event::Vote(VoteEvent {
                timestamp: SystemTime::now(),
                vote: vote.clone(),
            }),
        );
        self.broadcast(ConsensusMessage::Vote(vote));
    }

    /// The time carried in this replica's votes: the wall clock, pushed forward if needed so
    /// that vote times never precede the block they are for.
    fn vote_time(&self) -> Timestamp {
        let now = Timestamp::now();
        let block = self
            .rs
            .locked_block
            .as_ref()
            .or(self.rs.proposal_block.as_ref());
        match block {
            Some(block) if now <= block.header.time => block.header.time.add_millis(1),
            _ => now,
        }
    }

    // Peer state and block sync.

    fn handle_peer_state(&mut self, message: PeerStateMessage, peer: PeerId) {
        match message {
            PeerStateMessage::NewRoundStep {
                height,
                round,
                step,
                ..
            } => {
                debug!("peer {:?} is at {}/{}/{}", peer, height, round, step);
            }
            PeerStateMessage::HasVote { .. } => (),
            PeerStateMessage::VoteSetMaj23 {
                height,
                round,
                vote_type,
                block_id,
            } => {
                if height != self.rs.height {
                    return;
                }
                if let Err(err) =
                    self.rs
                        .votes
                        .set_peer_maj23(round, vote_type, peer, block_id.clone())
                {
                    warn!("rejecting +2/3 claim from {:?}: {}", peer, err);
                    return;
                }
                // Tell the peer which of the claimed votes this replica already holds, so it
                // can gossip the gaps.
                let votes = match vote_type {
                    VoteType::Prevote => self.rs.votes.prevotes(round),
                    VoteType::Precommit => self.rs.votes.precommits(round),
                }
                .and_then(|vote_set| vote_set.bit_vector_by_block_id(&block_id))
                .unwrap_or_else(|| BitVector::new(self.rs.validators.len() as u32));
                self.send_peer_state(
                    Some(peer),
                    PeerStateMessage::VoteSetBits {
                        height,
                        round,
                        vote_type,
                        block_id,
                        votes,
                    },
                );
            }
            PeerStateMessage::VoteSetBits { .. } => (),
        }
    }

    fn handle_block_sync(&mut self, message: BlockSyncMessage, peer: PeerId) {
        match message {
            BlockSyncMessage::BlockRequest { height } => match self.block_store.load_block(height)
            {
                Ok(Some(block)) => {
                    let _ = self.outbound.send((
                        Some(peer),
                        Message::BlockSync(BlockSyncMessage::BlockResponse { block }),
                    ));
                }
                Ok(None) => {
                    let _ = self.outbound.send((
                        Some(peer),
                        Message::BlockSync(BlockSyncMessage::NoBlockResponse { height }),
                    ));
                }
                Err(err) => error!("cannot serve block {}: {}", height, err),
            },
            BlockSyncMessage::StatusRequest => {
                let state = match self.block_store.state() {
                    Ok(state) => state,
                    Err(err) => {
                        error!("cannot read the block store: {}", err);
                        return;
                    }
                };
                let _ = self.outbound.send((
                    Some(peer),
                    Message::BlockSync(BlockSyncMessage::StatusResponse {
                        height: state.height,
                        base: state.base,
                    }),
                ));
            }
            BlockSyncMessage::BlockResponse { block } => {
                debug!(
                    "peer {:?} sent block for height {}",
                    peer, block.header.height
                );
            }
            BlockSyncMessage::NoBlockResponse { height } => {
                debug!("peer {:?} has no block for height {}", peer, height);
            }
            BlockSyncMessage::StatusResponse { height, base } => {
                debug!("peer {:?} serves heights {}..={}", peer, base, height);
            }
        }
    }

    // Shared plumbing.

    fn unlock(&mut self, height: Height, round: Round) {
        self.rs.locked_round = Round::NONE;
        self.rs.locked_block = None;
        self.rs.locked_block_parts = None;
        Event::publish(
            &self.event_publisher,
            Event::Unlock(UnlockEvent {
                timestamp: SystemTime::now(),
                height,
                round,
            }),
        );
    }

    fn publish_lock(&mut self, height: Height, round: Round, block_id: BlockId) {
        Event::publish(
            &self.event_publisher,
            Event::Lock(LockEvent {
                timestamp: SystemTime::now(),
                height,
                round,
                block_id,
            }),
        );
    }

    fn publish_new_round_step(&self) {
        Event::publish(
            &self.event_publisher,
            Event::NewRoundStep(NewRoundStepEvent {
                timestamp: SystemTime::now(),
                height: self.rs.height,
                round: self.rs.round,
                step: self.rs.step,
            }),
        );
        self.send_peer_state(
            None,
            PeerStateMessage::NewRoundStep {
                height: self.rs.height,
                round: self.rs.round,
                step: self.rs.step,
                last_commit_round: self
                    .rs
                    .last_commit
                    .as_ref()
                    .map(|last_commit| last_commit.round())
                    .unwrap_or(Round::NONE),
            },
        );
    }

    /// Send `message` to the peers and loop it back into this engine's own inbox.
    fn broadcast(&self, message: ConsensusMessage) {
        let _ = self.inbox.send(ConsensusInput::Message {
            message: message.clone(),
            peer: None,
        });
        let _ = self
            .outbound
            .send((None, Message::Consensus(message)));
    }

    fn send_peer_state(&self, peer: Option<PeerId>, message: PeerStateMessage) {
        let _ = self.outbound.send((peer, Message::PeerState(message)));
    }

    fn schedule_timeout(&self, duration: Duration, round: Round, step: Step) {
        let _ = self.ticker.send(TimeoutInfo {
            duration,
            height: self.rs.height,
            round,
            step,
        });
    }

    /// Schedule the timeout that starts round 0 of the current height once its start time is
    /// reached.
    fn schedule_new_height_timeout(&self) {
        let wait_millis = (self.rs.start_time.millis() - Timestamp::now().millis()).max(0);
        let _ = self.ticker.send(TimeoutInfo {
            duration: Duration::from_millis(wait_millis as u64),
            height: self.rs.height,
            round: Round::new(0),
            step: Step::NewHeight,
        });
    }
}

/// A fresh [`RoundState`] for the height that follows `state`.
fn new_round_state(
    state: &State,
    last_commit: Option<VoteSet>,
    start_time: Timestamp,
) -> RoundState {
    let height = state.next_height();
    let validators = Arc::new(state.validators.clone());
    RoundState {
        height,
        round: Round::new(0),
        step: Step::NewHeight,
        start_time,
        commit_time: Timestamp::zero(),
        validators: Arc::clone(&validators),
        proposal: None,
        proposal_block: None,
        proposal_block_parts: None,
        locked_round: Round::NONE,
        locked_block: None,
        locked_block_parts: None,
        valid_round: Round::NONE,
        valid_block: None,
        valid_block_parts: None,
        votes: HeightVoteSet::new(state.chain_id.clone(), height, validators),
        commit_round: Round::NONE,
        last_commit,
        last_validators: Arc::new(state.last_validators.clone()),
        triggered_timeout_precommit: false,
    }
}
