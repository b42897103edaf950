/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Trait that the replicated application must implement, along with its request and response
//! types.
//!
//! The consensus engine is generic over the application: it orders opaque transactions, and the
//! application decides what they mean. The engine drives the application through a fixed call
//! sequence for every committed block:
//!
//! 1. [`begin_block`](App::begin_block), once,
//! 2. [`deliver_tx`](App::deliver_tx), once per transaction in block order,
//! 3. [`end_block`](App::end_block), once, which may change the validator set and the consensus
//!    parameters,
//! 4. [`commit`](App::commit), once, which returns the application's new state hash.
//!
//! Calls are never reordered, interleaved across blocks, or repeated for the same block, so the
//! application can treat the sequence as a transaction against its own state.
//!
//! # Determinism
//!
//! Every method other than [`prepare_proposal`](App::prepare_proposal) must be a deterministic
//! function of the application's state and the request. If two replicas return different
//! responses for the same block, their `app_hash`es diverge and one of them will reject the
//! chain.

use crate::state::ConsensusParams;
use crate::types::basic::{ChainId, CryptoHash, Height, Transaction};
use crate::types::block::{Commit, Header};
use crate::types::validators::ValidatorUpdate;

use borsh::{BorshDeserialize, BorshSerialize};

/// The interface between the consensus engine and the replicated application.
pub trait App: Send + 'static {
    /// Report the application's last committed height and state hash. Called once when the node
    /// starts: the node refuses to run if the reported height disagrees with the state store,
    /// since the two would have committed different chains.
    fn info(&mut self, request: InfoRequest) -> InfoResponse;

    /// Initialize the application from the genesis document. Called exactly once, before the
    /// first block is proposed, and only when the state store is empty.
    fn init_chain(&mut self, request: InitChainRequest) -> InitChainResponse;

    /// Provide the transactions for a block this replica is about to propose. The returned
    /// transactions must fit within `max_tx_bytes` in total.
    fn prepare_proposal(&mut self, request: PrepareProposalRequest) -> PrepareProposalResponse;

    /// Signal the start of execution of a committed block.
    fn begin_block(&mut self, request: BeginBlockRequest) -> BeginBlockResponse;

    /// Execute one transaction of the current block.
    fn deliver_tx(&mut self, request: DeliverTxRequest) -> DeliverTxResponse;

    /// Signal the end of execution of the current block. The returned validator updates take
    /// effect two heights later; the returned consensus parameter updates take effect at the
    /// next height.
    fn end_block(&mut self, request: EndBlockRequest) -> EndBlockResponse;

    /// Persist the application state reached by the current block and return its hash. Must be
    /// idempotent: committing the same block twice (e.g. across a crash) must yield the same
    /// `app_hash`.
    fn commit(&mut self) -> CommitResponse;
}

pub struct InfoRequest {}

pub struct InfoResponse {
    pub app_version: u64,
    pub last_block_height: Height,
    pub last_block_app_hash: Vec<u8>,
}

pub struct InitChainRequest {
    pub chain_id: ChainId,
    pub initial_height: Height,
    pub consensus_params: ConsensusParams,
    pub validators: Vec<ValidatorUpdate>,
    pub app_state: Vec<u8>,
}

pub struct InitChainResponse {
    /// Consensus parameters to use instead of the genesis document's, if any.
    pub consensus_params: Option<ConsensusParams>,
    /// Initial validators to use instead of the genesis document's. Empty means "keep the
    /// genesis validators".
    pub validators: Vec<ValidatorUpdate>,
    pub app_hash: Vec<u8>,
}

pub struct PrepareProposalRequest {
    pub height: Height,
    pub max_tx_bytes: u64,
}

pub struct PrepareProposalResponse {
    pub transactions: Vec<Transaction>,
}

pub struct BeginBlockRequest {
    pub hash: CryptoHash,
    pub header: Header,
    pub last_commit: Commit,
}

pub struct BeginBlockResponse {}

pub struct DeliverTxRequest {
    pub tx: Transaction,
}

pub struct DeliverTxResponse {
    /// 0 means the transaction succeeded. Failed transactions stay in the block; only their
    /// result differs.
    pub code: u32,
    pub data: Vec<u8>,
    pub log: String,
}

impl DeliverTxResponse {
    pub fn is_ok(&self) -> bool {
        self.code == 0
    }

    /// The part of the response that is recorded on-chain through `last_results_hash`.
    pub fn to_tx_result(&self) -> TxResult {
        TxResult {
            code: self.code,
            data: self.data.clone(),
        }
    }
}

pub struct EndBlockRequest {
    pub height: Height,
}

pub struct EndBlockResponse {
    pub validator_updates: Vec<ValidatorUpdate>,
    pub consensus_param_updates: Option<ConsensusParams>,
}

pub struct CommitResponse {
    pub app_hash: Vec<u8>,
    /// Lowest block height the application still needs. Heights below it may be pruned from the
    /// block store. 0 means "keep everything".
    pub retain_height: Height,
}

/// The deterministic part of a transaction's execution result. The Merkle root over a block's
/// `TxResult`s becomes the `last_results_hash` of the next block's header.
#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct TxResult {
    pub code: u32,
    pub data: Vec<u8>,
}
