/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The thread that distributes published [events](crate::events) to registered handlers.

use std::sync::mpsc::Receiver;
use std::sync::mpsc::TryRecvError;
use std::thread;
use std::thread::JoinHandle;

use crate::events::*;
use crate::logging::Logger;

pub(crate) type HandlerPtr<T> = Box<dyn Fn(&T) + Send>;

pub(crate) struct EventHandlers {
    pub(crate) new_round_step_handlers: Vec<HandlerPtr<NewRoundStepEvent>>,
    pub(crate) timeout_handlers: Vec<HandlerPtr<TimeoutEvent>>,
    pub(crate) propose_handlers: Vec<HandlerPtr<ProposeEvent>>,
    pub(crate) vote_handlers: Vec<HandlerPtr<VoteEvent>>,
    pub(crate) receive_proposal_handlers: Vec<HandlerPtr<ReceiveProposalEvent>>,
    pub(crate) receive_vote_handlers: Vec<HandlerPtr<ReceiveVoteEvent>>,
    pub(crate) polka_handlers: Vec<HandlerPtr<PolkaEvent>>,
    pub(crate) lock_handlers: Vec<HandlerPtr<LockEvent>>,
    pub(crate) unlock_handlers: Vec<HandlerPtr<UnlockEvent>>,
    pub(crate) commit_block_handlers: Vec<HandlerPtr<CommitBlockEvent>>,
    pub(crate) update_validator_set_handlers: Vec<HandlerPtr<UpdateValidatorSetEvent>>,
}

impl EventHandlers {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        log_events: bool,
        on_new_round_step: Option<HandlerPtr<NewRoundStepEvent>>,
        on_timeout: Option<HandlerPtr<TimeoutEvent>>,
        on_propose: Option<HandlerPtr<ProposeEvent>>,
        on_vote: Option<HandlerPtr<VoteEvent>>,
        on_receive_proposal: Option<HandlerPtr<ReceiveProposalEvent>>,
        on_receive_vote: Option<HandlerPtr<ReceiveVoteEvent>>,
        on_polka: Option<HandlerPtr<PolkaEvent>>,
        on_lock: Option<HandlerPtr<LockEvent>>,
        on_unlock: Option<HandlerPtr<UnlockEvent>>,
        on_commit_block: Option<HandlerPtr<CommitBlockEvent>>,
        on_update_validator_set: Option<HandlerPtr<UpdateValidatorSetEvent>>,
    ) -> Self {
        fn handlers<T: Logger>(log_events: bool, user: Option<HandlerPtr<T>>) -> Vec<HandlerPtr<T>> {
            let mut handlers = Vec::new();
            if log_events {
                handlers.push(T::get_logger());
            }
            if let Some(user) = user {
                handlers.push(user);
            }
            handlers
        }

        Self {
            new_round_step_handlers: handlers(log_events, on_new_round_step),
            timeout_handlers: handlers(log_events, on_timeout),
            propose_handlers: handlers(log_events, on_propose),
            vote_handlers: handlers(log_events, on_vote),
            receive_proposal_handlers: handlers(log_events, on_receive_proposal),
            receive_vote_handlers: handlers(log_events, on_receive_vote),
            polka_handlers: handlers(log_events, on_polka),
            lock_handlers: handlers(log_events, on_lock),
            unlock_handlers: handlers(log_events, on_unlock),
            commit_block_handlers: handlers(log_events, on_commit_block),
            update_validator_set_handlers: handlers(log_events, on_update_validator_set),
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.new_round_step_handlers.is_empty()
            && self.timeout_handlers.is_empty()
            && self.propose_handlers.is_empty()
            && self.vote_handlers.is_empty()
            && self.receive_proposal_handlers.is_empty()
            && self.receive_vote_handlers.is_empty()
            && self.polka_handlers.is_empty()
            && self.lock_handlers.is_empty()
            && self.unlock_handlers.is_empty()
            && self.commit_block_handlers.is_empty()
            && self.update_validator_set_handlers.is_empty()
    }

    pub fn fire_handlers(&self, event: Event) {
        match event {
            Event::NewRoundStep(new_round_step_event) => self
                .new_round_step_handlers
                .iter()
                .for_each(|handler| handler(&new_round_step_event)),

            Event::Timeout(timeout_event) => self
                .timeout_handlers
                .iter()
                .for_each(|handler| handler(&timeout_event)),

            Event::Propose(propose_event) => self
                .propose_handlers
                .iter()
                .for_each(|handler| handler(&propose_event)),

            Event::Vote(vote_event) => self
                .vote_handlers
                .iter()
                .for_each(|handler| handler(&vote_event)),

            Event::ReceiveProposal(receive_proposal_event) => self
                .receive_proposal_handlers
                .iter()
                .for_each(|handler| handler(&receive_proposal_event)),

            Event::ReceiveVote(receive_vote_event) => self
                .receive_vote_handlers
                .iter()
                .for_each(|handler| handler(&receive_vote_event)),

            Event::Polka(polka_event) => self
                .polka_handlers
                .iter()
                .for_each(|handler| handler(&polka_event)),

            Event::Lock(lock_event) => self
                .lock_handlers
                .iter()
                .for_each(|handler| handler(&lock_event)),

            Event::Unlock(unlock_event) => self
                .unlock_handlers
                .iter()
                .for_each(|handler| handler(&unlock_event)),

            Event::CommitBlock(commit_block_event) => self
                .commit_block_handlers
                .iter()
                .for_each(|handler| handler(&commit_block_event)),

            Event::UpdateValidatorSet(update_validator_set_event) => self
                .update_validator_set_handlers
                .iter()
                .for_each(|handler| handler(&update_validator_set_event)),
        }
    }
}

pub(crate) fn start_event_bus(
    event_handlers: EventHandlers,
    event_subscriber: Receiver<Event>,
    shutdown_signal: Receiver<()>,
) -> JoinHandle<()> {
    thread::spawn(move || loop {
        match shutdown_signal.try_recv() {
            Ok(()) => return,
            Err(TryRecvError::Empty) => (),
            Err(TryRecvError::Disconnected) => {
                panic!("event_bus thread disconnected from main thread")
            }
        }

        match event_subscriber.try_recv() {
            Ok(event) => event_handlers.fire_handlers(event),
            Err(TryRecvError::Empty) => thread::yield_now(),
            Err(TryRecvError::Disconnected) => return,
        }
    })
}
