/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Methods to build, run, and initialize a consensus node.
//!
//! A node is one replica of the replicated state machine. It owns the consensus thread, the
//! timeout ticker, and (if any event handlers are registered) the event bus. The node does not
//! do networking: the user feeds incoming messages in through [`Node::handle_message`], and
//! picks up the messages the node wants delivered from the outbound channel given to the
//! builder, where each entry is `(destination, message)` with a destination of `None` meaning
//! broadcast.
//!
//! ## Starting a node
//!
//! Here is an example that demonstrates how to build and start running a node using the builder
//! pattern:
//!
//! ```ignore
//! let node = NodeSpec::builder()
//!     .app(app)
//!     .kv_store(kv_store)
//!     .genesis(genesis)
//!     .configuration(configuration)
//!     .outbound(outbound_sender)
//!     .private_validator(file_pv)
//!     .on_commit_block(commit_handler)
//!     .build()
//!     .start()?;
//! ```
//!
//! ### Required setters
//!
//! `.app(...)`, `.kv_store(...)`, `.genesis(...)`, `.configuration(...)`, and `.outbound(...)`
//! are required. `.private_validator(...)` is required for a validator and omitted for a
//! listener that follows consensus without voting. The `.on_*(...)` setters optionally register
//! event handlers.
//!
//! ## Validators and Listeners
//!
//! Not every node has to vote in consensus. A node built without a private validator merely
//! keeps up with consensus decisions, validating and executing every committed block, without
//! having weight in them.

use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;

use typed_builder::TypedBuilder;

use crate::app::{App, InfoRequest, InitChainRequest};
use crate::config::Configuration;
use crate::consensus::implementation::ConsensusState;
use crate::consensus::timeout::start_timeout_ticker;
use crate::consensus::vote_set::{VoteSet, VoteSetError};
use crate::event_bus::{start_event_bus, EventHandlers, HandlerPtr};
use crate::events::*;
use crate::executor::BlockExecutor;
use crate::genesis::{GenesisDoc, GenesisError};
use crate::messages::Message;
use crate::privval::FilePv;
use crate::state::State;
use crate::store::{BlockStore, KVStore, StateStore, StoreError};
use crate::types::basic::PeerId;
use crate::types::validators::{
    validate_updates, ValidatorSet, ValidatorSetUpdateError, ValidatorUpdate,
};

use crate::consensus::ConsensusInput;

/// Stores all necessary parameters and trait implementations required to run a [Node].
#[derive(TypedBuilder)]
#[builder(builder_method(doc = "
    Create a builder for building a [NodeSpec]. On the builder call the following methods to construct a valid [NodeSpec].

    Required:
    - `.app(...)`
    - `.kv_store(...)`
    - `.genesis(...)`
    - `.configuration(...)`
    - `.outbound(...)`

    Optional:
    - `.private_validator(...)`
    - `.on_new_round_step(...)`
    - `.on_timeout(...)`
    - `.on_propose(...)`
    - `.on_vote(...)`
    - `.on_receive_proposal(...)`
    - `.on_receive_vote(...)`
    - `.on_polka(...)`
    - `.on_lock(...)`
    - `.on_unlock(...)`
    - `.on_commit_block(...)`
    - `.on_update_validator_set(...)`
"))]
pub struct NodeSpec<K: KVStore, A: App> {
    // Required parameters
    #[builder(setter(doc = "Set the application code to be replicated. The argument must implement the [App](crate::app::App) trait. Required."))]
    app: A,
    #[builder(setter(doc = "Set the implementation of the node's Key-Value store. The argument must implement the [KVStore](crate::store::KVStore) trait. Required."))]
    kv_store: K,
    #[builder(setter(doc = "Set the genesis document of the chain. Required."))]
    genesis: GenesisDoc,
    #[builder(setter(doc = "Set the [configuration](Configuration), which contains the necessary parameters to run a node. Required."))]
    configuration: Configuration,
    #[builder(setter(doc = "Set the channel on which the node emits `(destination, message)` pairs for the user's transport. A destination of `None` means broadcast. Required."))]
    outbound: Sender<(Option<PeerId>, Message)>,
    // Optional parameters
    #[builder(default, setter(strip_option, doc = "Set the node's private validator, used to sign proposals and votes. Omit it to run a listener. Optional."))]
    private_validator: Option<FilePv>,
    #[builder(default, setter(transform = |handler: impl Fn(&NewRoundStepEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<NewRoundStepEvent>),
    doc = "Register a handler closure to be invoked after the node enters a new (height, round, step). Optional."))]
    on_new_round_step: Option<HandlerPtr<NewRoundStepEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&TimeoutEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<TimeoutEvent>),
    doc = "Register a handler closure to be invoked after one of the node's timeouts fires. Optional."))]
    on_timeout: Option<HandlerPtr<TimeoutEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&ProposeEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<ProposeEvent>),
    doc = "Register a handler closure to be invoked after the node broadcasts a proposal. Optional."))]
    on_propose: Option<HandlerPtr<ProposeEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&VoteEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<VoteEvent>),
    doc = "Register a handler closure to be invoked after the node signs and broadcasts a vote. Optional."))]
    on_vote: Option<HandlerPtr<VoteEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&ReceiveProposalEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<ReceiveProposalEvent>),
    doc = "Register a handler closure to be invoked after the node receives a proposal. Optional."))]
    on_receive_proposal: Option<HandlerPtr<ReceiveProposalEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&ReceiveVoteEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<ReceiveVoteEvent>),
    doc = "Register a handler closure to be invoked after the node receives a vote. Optional."))]
    on_receive_vote: Option<HandlerPtr<ReceiveVoteEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&PolkaEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<PolkaEvent>),
    doc = "Register a handler closure to be invoked after the node observes +2/3 prevotes for a block. Optional."))]
    on_polka: Option<HandlerPtr<PolkaEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&LockEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<LockEvent>),
    doc = "Register a handler closure to be invoked after the node locks on a block. Optional."))]
    on_lock: Option<HandlerPtr<LockEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&UnlockEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<UnlockEvent>),
    doc = "Register a handler closure to be invoked after the node releases its lock. Optional."))]
    on_unlock: Option<HandlerPtr<UnlockEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&CommitBlockEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<CommitBlockEvent>),
    doc = "Register a handler closure to be invoked after a block is committed and executed. Optional."))]
    on_commit_block: Option<HandlerPtr<CommitBlockEvent>>,
    #[builder(default, setter(transform = |handler: impl Fn(&UpdateValidatorSetEvent) + Send + 'static| Some(Box::new(handler) as HandlerPtr<UpdateValidatorSetEvent>),
    doc = "Register a handler closure to be invoked after the node's validator set changes. Optional."))]
    on_update_validator_set: Option<HandlerPtr<UpdateValidatorSetEvent>>,
}

impl<K: KVStore, A: App> NodeSpec<K, A> {
    /// Starts all threads and channels associated with running a node, and returns the handles
    /// to them in a [Node] struct.
    ///
    /// If the node's state store is empty, the chain is initialized from the genesis document,
    /// calling [`init_chain`](crate::app::App::init_chain) on the application. Otherwise the
    /// persisted state is loaded and consensus resumes from the height after the last committed
    /// block.
    pub fn start(mut self) -> Result<Node, NodeError> {
        let block_store = BlockStore::new(self.kv_store.clone());
        let mut state_store = StateStore::new(self.kv_store.clone());

        let state = match state_store.load()? {
            Some(state) => state,
            None => initialize_chain(&mut self.app, self.genesis, &mut state_store)?,
        };

        // The application must have committed exactly as far as the state store; an application
        // that is behind or ahead of it has committed a different chain, and executing on top of
        // it would diverge.
        let info = self.app.info(InfoRequest {});
        if info.last_block_height != state.last_block_height {
            return Err(NodeError::AppHeightMismatch {
                app_height: info.last_block_height.int(),
                store_height: state.last_block_height.int(),
            });
        }
        if state.last_block_height.int() > 0 && info.last_block_app_hash != state.app_hash {
            return Err(NodeError::AppHashMismatch {
                height: state.last_block_height.int(),
            });
        }

        // A restarting node rebuilds the precommits that committed its last block, so it can
        // still serve them to peers and embed them in its next proposal.
        let last_commit = if state.last_block_height.int() > 0 {
            let seen_commit = block_store
                .load_seen_commit(state.last_block_height)?
                .ok_or(NodeError::MissingSeenCommit {
                    height: state.last_block_height.int(),
                })?;
            Some(
                VoteSet::from_commit(
                    state.chain_id.clone(),
                    &seen_commit,
                    Arc::new(state.last_validators.clone()),
                )
                .map_err(NodeError::InvalidSeenCommit)?,
            )
        } else {
            None
        };

        let event_handlers = EventHandlers::new(
            self.configuration.log_events,
            self.on_new_round_step,
            self.on_timeout,
            self.on_propose,
            self.on_vote,
            self.on_receive_proposal,
            self.on_receive_vote,
            self.on_polka,
            self.on_lock,
            self.on_unlock,
            self.on_commit_block,
            self.on_update_validator_set,
        );
        let (event_publisher, event_subscriber) = if !event_handlers.is_empty() {
            Some(mpsc::channel()).unzip()
        } else {
            (None, None)
        };

        let (inbox, inbox_receiver) = mpsc::channel();
        let (ticker, ticker_handle) = start_timeout_ticker(inbox.clone());

        let executor = BlockExecutor::new(self.app, block_store.clone(), state_store);
        let consensus = ConsensusState::new(
            self.configuration,
            state,
            self.private_validator,
            executor,
            block_store,
            last_commit,
            inbox.clone(),
            ticker,
            self.outbound,
            event_publisher,
        );

        let (consensus_shutdown, consensus_shutdown_receiver) = mpsc::channel();
        let consensus = consensus.start(inbox_receiver, consensus_shutdown_receiver);

        let (event_bus_shutdown, event_bus_shutdown_receiver) = if !event_handlers.is_empty() {
            Some(mpsc::channel()).unzip()
        } else {
            (None, None)
        };
        let event_bus = if !event_handlers.is_empty() {
            Some(start_event_bus(
                event_handlers,
                event_subscriber.unwrap(),          // Safety: should be Some(...).
                event_bus_shutdown_receiver.unwrap(), // Safety: should be Some(...).
            ))
        } else {
            None
        };

        Ok(Node {
            inbox,
            consensus: Some(consensus),
            consensus_shutdown,
            ticker: Some(ticker_handle),
            event_bus,
            event_bus_shutdown,
        })
    }
}

/// Set up the inter-block state of a brand new chain from its genesis document.
fn initialize_chain<K: KVStore, A: App>(
    app: &mut A,
    mut genesis: GenesisDoc,
    state_store: &mut StateStore<K>,
) -> Result<State, NodeError> {
    genesis.validate_and_complete()?;
    let mut state = State::from_genesis(&genesis);

    let response = app.init_chain(InitChainRequest {
        chain_id: genesis.chain_id.clone(),
        initial_height: genesis.initial_height,
        consensus_params: genesis.consensus_params.clone(),
        validators: genesis
            .validators
            .iter()
            .map(|genesis_validator| ValidatorUpdate {
                pub_key: genesis_validator.pub_key,
                power: genesis_validator.power,
            })
            .collect(),
        app_state: genesis.app_state.clone(),
    });

    if let Some(consensus_params) = response.consensus_params {
        consensus_params
            .validate()
            .map_err(NodeError::InvalidInitChainParams)?;
        state.consensus_params = consensus_params;
    }
    if !response.validators.is_empty() {
        validate_updates(&response.validators)?;
        let mut validator_set = ValidatorSet::empty();
        validator_set.apply_updates(&response.validators)?;
        state.validators = validator_set.clone();
        state.next_validators = validator_set;
    }
    if state.validators.is_empty() {
        return Err(NodeError::NoInitialValidators);
    }
    state.app_hash = response.app_hash;

    state_store.save(&state);
    Ok(state)
}

/// A handle to the background threads of a running node. When this value is dropped, all
/// background threads are gracefully shut down.
pub struct Node {
    inbox: Sender<ConsensusInput>,
    consensus: Option<JoinHandle<()>>,
    consensus_shutdown: Sender<()>,
    ticker: Option<JoinHandle<()>>,
    event_bus: Option<JoinHandle<()>>,
    event_bus_shutdown: Option<Sender<()>>,
}

impl Node {
    /// Feed a message received from `origin` into the node. Returns `false` if the node has
    /// already shut down.
    pub fn handle_message(&self, message: Message, origin: PeerId) -> bool {
        let input = match message {
            Message::Consensus(message) => ConsensusInput::Message {
                message,
                peer: Some(origin),
            },
            Message::PeerState(message) => ConsensusInput::PeerState {
                message,
                peer: origin,
            },
            Message::BlockSync(message) => ConsensusInput::BlockSync {
                message,
                peer: origin,
            },
        };
        self.inbox.send(input).is_ok()
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        // Safety: the consensus thread publishes events, so the event bus must outlive it.
        self.consensus_shutdown.send(()).unwrap();
        self.consensus.take().unwrap().join().unwrap();

        // The ticker exits once every sender into it is gone; dropping the consensus state
        // above dropped the last one.
        self.ticker.take().unwrap().join().unwrap();

        self.event_bus_shutdown
            .iter()
            .for_each(|shutdown| shutdown.send(()).unwrap());
        if self.event_bus.is_some() {
            self.event_bus.take().unwrap().join().unwrap();
        }
    }
}

/// Ways in which starting a node can fail.
#[derive(Debug)]
pub enum NodeError {
    Genesis(GenesisError),
    Store(StoreError),
    /// The state store has a committed height but the block store has no seen commit for it.
    MissingSeenCommit {
        height: u64,
    },
    /// The persisted seen commit does not verify against the persisted validator set.
    InvalidSeenCommit(VoteSetError),
    /// The application reports a last committed height different from the state store's.
    AppHeightMismatch {
        app_height: u64,
        store_height: u64,
    },
    /// The application's state hash at the last committed height differs from the one the
    /// committed chain recorded.
    AppHashMismatch {
        height: u64,
    },
    InvalidInitChainParams(String),
    InvalidInitChainValidators(ValidatorSetUpdateError),
    /// Neither the genesis document nor `init_chain` produced any validators.
    NoInitialValidators,
}

impl std::fmt::Display for NodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeError::Genesis(source) => write!(f, "invalid genesis document: {}", source),
            NodeError::Store(source) => write!(f, "storage error: {}", source),
            NodeError::MissingSeenCommit { height } => {
                write!(f, "no seen commit stored for committed height {}", height)
            }
            NodeError::InvalidSeenCommit(source) => {
                write!(f, "persisted seen commit is invalid: {}", source)
            }
            NodeError::AppHeightMismatch {
                app_height,
                store_height,
            } => {
                write!(
                    f,
                    "application is at height {} but the state store is at height {}",
                    app_height, store_height
                )
            }
            NodeError::AppHashMismatch { height } => {
                write!(
                    f,
                    "application state hash at height {} does not match the committed chain",
                    height
                )
            }
            NodeError::InvalidInitChainParams(reason) => {
                write!(f, "init_chain returned invalid consensus params: {}", reason)
            }
            NodeError::InvalidInitChainValidators(source) => {
                write!(f, "init_chain returned invalid validators: {}", source)
            }
            NodeError::NoInitialValidators => {
                write!(f, "chain has no initial validators")
            }
        }
    }
}

impl From<GenesisError> for NodeError {
    fn from(error: GenesisError) -> Self {
        NodeError::Genesis(error)
    }
}

impl From<StoreError> for NodeError {
    fn from(error: StoreError) -> Self {
        NodeError::Store(error)
    }
}

impl From<ValidatorSetUpdateError> for NodeError {
    fn from(error: ValidatorSetUpdateError) -> Self {
        NodeError::InvalidInitChainValidators(error)
    }
}
