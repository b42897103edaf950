/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The block executor: validates decided blocks against the current [`State`], runs them through
//! the [`App`], and derives the next `State`.
//!
//! The executor is the only component that calls the application for committed blocks, and it
//! does so in the fixed begin-deliver-end-commit sequence. Validation results are cached per
//! block hash, since the engine validates a proposal once when prevoting and again when
//! finalizing.

use std::collections::HashMap;
use std::sync::Arc;

use log::info;

use crate::app::{
    App, BeginBlockRequest, DeliverTxRequest, EndBlockRequest, PrepareProposalRequest, TxResult,
};
use crate::consensus::vote_set::VoteSet;
use crate::merkle::hash_from_byte_slices;
use crate::state::{ConsensusParams, State};
use crate::store::{BlockStore, KVStore, StateStore, StoreError};
use crate::types::basic::{Address, CryptoHash, Height};
use crate::types::block::{Block, BlockId, Commit};
use crate::types::validators::{
    validate_updates, ValidatorSetUpdateError, ValidatorUpdate, ValidatorUpdateBytes,
};

use borsh::{BorshDeserialize, BorshSerialize};

/// What executing a block produced, beyond the application's own state: the per-transaction
/// results and the updates the application requested. Persisted per height so that a restarting
/// replica can rebuild `last_results_hash` without re-executing.
#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct ExecutionResults {
    pub tx_results: Vec<TxResult>,
    pub validator_updates: Vec<ValidatorUpdateBytes>,
    pub consensus_param_updates: Option<ConsensusParams>,
}

/// Validates and executes blocks on behalf of the consensus engine.
pub struct BlockExecutor<K: KVStore, A: App> {
    app: A,
    block_store: BlockStore<K>,
    state_store: StateStore<K>,
    /// Hashes of blocks already validated against the current state. Cleared whenever the state
    /// advances.
    validated: HashMap<CryptoHash, ()>,
}

impl<K: KVStore, A: App> BlockExecutor<K, A> {
    pub fn new(app: A, block_store: BlockStore<K>, state_store: StateStore<K>) -> Self {
        Self {
            app,
            block_store,
            state_store,
            validated: HashMap::new(),
        }
    }

    pub fn app_mut(&mut self) -> &mut A {
        &mut self.app
    }

    /// Build the block this replica proposes at `height`: ask the application for transactions
    /// that fit the current size limits, then assemble them on top of `state`.
    pub fn create_proposal_block(
        &mut self,
        height: Height,
        state: &State,
        last_commit: Commit,
        proposer_address: Address,
    ) -> Block {
        let response = self.app.prepare_proposal(PrepareProposalRequest {
            height,
            max_tx_bytes: state.max_data_bytes(),
        });
        state.make_block(height, response.transactions, last_commit, proposer_address)
    }

    /// Check that `block` is a valid successor of `state`. Results are cached by block hash, so
    /// re-validating the block the engine already prevoted is free.
    pub fn validate_block(&mut self, state: &State, block: &Block) -> Result<(), ExecutionError> {
        let block_hash = block.hash();
        if self.validated.contains_key(&block_hash) {
            return Ok(());
        }

        block
            .validate_basic()
            .map_err(|err| ExecutionError::InvalidBlock(err.to_string()))?;

        let header = &block.header;
        if header.version != state.version {
            return Err(ExecutionError::InvalidBlock(format!(
                "block version {:?} does not match state version {:?}",
                header.version, state.version
            )));
        }
        if header.chain_id != state.chain_id {
            return Err(ExecutionError::InvalidBlock(format!(
                "block chain id {} does not match state chain id {}",
                header.chain_id.str(),
                state.chain_id.str()
            )));
        }
        if header.height != state.next_height() {
            return Err(ExecutionError::InvalidBlock(format!(
                "block height {} is not the next height {}",
                header.height,
                state.next_height()
            )));
        }
        if header.last_block_id != state.last_block_id {
            return Err(ExecutionError::InvalidBlock(
                "block's last block id does not match the committed chain".to_string(),
            ));
        }
        if header.app_hash != state.app_hash {
            return Err(ExecutionError::InvalidBlock(
                "block app hash does not match the application state".to_string(),
            ));
        }
        if header.validators_hash != state.validators.hash() {
            return Err(ExecutionError::InvalidBlock(
                "block validators hash does not match the current validator set".to_string(),
            ));
        }
        if header.next_validators_hash != state.next_validators.hash() {
            return Err(ExecutionError::InvalidBlock(
                "block next validators hash does not match the next validator set".to_string(),
            ));
        }
        if header.consensus_hash != state.consensus_params.hash() {
            return Err(ExecutionError::InvalidBlock(
                "block consensus hash does not match the current consensus parameters".to_string(),
            ));
        }
        if header.last_results_hash != state.last_results_hash {
            return Err(ExecutionError::InvalidBlock(
                "block last results hash does not match the last execution results".to_string(),
            ));
        }
        if !state.validators.has_address(&header.proposer_address) {
            return Err(ExecutionError::InvalidBlock(
                "block proposer is not in the current validator set".to_string(),
            ));
        }
        if block.try_to_vec().unwrap().len() as u64 > state.consensus_params.block.max_bytes {
            return Err(ExecutionError::InvalidBlock(
                "block exceeds the maximum block size".to_string(),
            ));
        }

        if header.height == state.initial_height {
            if !block.last_commit.is_empty() {
                return Err(ExecutionError::InvalidBlock(
                    "the first block must carry an empty last commit".to_string(),
                ));
            }
        } else {
            if header.time <= state.last_block_time {
                return Err(ExecutionError::InvalidBlock(
                    "block time does not increase over the previous block".to_string(),
                ));
            }
            self.verify_last_commit(state, &block.last_commit)?;
        }

        self.validated.insert(block_hash, ());
        Ok(())
    }

    /// Verify that `last_commit` is a valid +2/3 commit of the previously committed block by the
    /// validator set that was active for it.
    fn verify_last_commit(
        &self,
        state: &State,
        last_commit: &Commit,
    ) -> Result<(), ExecutionError> {
        if last_commit.block_id != state.last_block_id {
            return Err(ExecutionError::InvalidBlock(
                "last commit is for a different block".to_string(),
            ));
        }
        if last_commit.signatures.len() != state.last_validators.len() {
            return Err(ExecutionError::InvalidBlock(format!(
                "last commit has {} signature slots, the validator set has {}",
                last_commit.signatures.len(),
                state.last_validators.len()
            )));
        }
        VoteSet::from_commit(
            state.chain_id.clone(),
            last_commit,
            Arc::new(state.last_validators.clone()),
        )
        .map_err(|err| ExecutionError::InvalidBlock(format!("invalid last commit: {}", err)))?;
        Ok(())
    }

    /// Execute a decided block against the application and return the state it leads to.
    ///
    /// The block must already have been saved to the block store. The returned state has been
    /// persisted, along with the execution results, before this returns.
    pub fn apply_block(
        &mut self,
        state: &State,
        block_id: &BlockId,
        block: &Block,
    ) -> Result<State, ExecutionError> {
        self.validate_block(state, block)?;

        self.app.begin_block(BeginBlockRequest {
            hash: block.hash(),
            header: block.header.clone(),
            last_commit: block.last_commit.clone(),
        });
        let mut tx_results = Vec::with_capacity(block.data.len());
        for tx in &block.data {
            let response = self.app.deliver_tx(DeliverTxRequest { tx: tx.clone() });
            tx_results.push(response.to_tx_result());
        }
        let end_block = self.app.end_block(EndBlockRequest {
            height: block.header.height,
        });

        validate_updates(&end_block.validator_updates)?;
        let results = ExecutionResults {
            tx_results,
            validator_updates: end_block
                .validator_updates
                .iter()
                .map(ValidatorUpdateBytes::from)
                .collect(),
            consensus_param_updates: end_block.consensus_param_updates.clone(),
        };
        self.state_store
            .save_execution_results(block.header.height, &results);

        let mut new_state = update_state(
            state,
            block_id,
            block,
            &end_block.validator_updates,
            end_block.consensus_param_updates,
            &results.tx_results,
        )?;

        let commit = self.app.commit();
        new_state.app_hash = commit.app_hash;
        self.state_store.save(&new_state);

        if commit.retain_height.int() > 0 {
            self.prune(commit.retain_height)?;
        }

        self.validated.clear();
        info!(
            "executed block at height {} with {} transactions",
            block.header.height,
            block.data.len()
        );
        Ok(new_state)
    }

    fn prune(&mut self, retain_height: Height) -> Result<(), ExecutionError> {
        let base = self.block_store.base()?;
        let pruned = self.block_store.prune_blocks(retain_height)?;
        if pruned > 0 {
            self.state_store.prune(base, retain_height);
            info!(
                "pruned {} blocks below retain height {}",
                pruned, retain_height
            );
        }
        Ok(())
    }
}

/// Derive the post-block state, except for `app_hash`, which is only known after
/// [`App::commit`].
fn update_state(
    state: &State,
    block_id: &BlockId,
    block: &Block,
    validator_updates: &[ValidatorUpdate],
    consensus_param_updates: Option<ConsensusParams>,
    tx_results: &[TxResult],
) -> Result<State, ExecutionError> {
    let height = block.header.height;

    // Validator updates land in next_validators, so they first affect the block two heights
    // after the one that requested them.
    let mut next_validators = state.next_validators.clone();
    let mut last_height_validators_changed = state.last_height_validators_changed;
    if !validator_updates.is_empty() {
        next_validators.apply_updates(validator_updates)?;
        last_height_validators_changed = height + 2;
    }
    next_validators.increment_proposer_priority(1);

    let mut consensus_params = state.consensus_params.clone();
    let mut last_height_consensus_params_changed = state.last_height_consensus_params_changed;
    if let Some(updates) = consensus_param_updates {
        updates
            .validate()
            .map_err(ExecutionError::InvalidParamUpdates)?;
        consensus_params = updates;
        last_height_consensus_params_changed = height + 1;
    }

    let results_bytes: Vec<Vec<u8>> = tx_results
        .iter()
        .map(|result| result.try_to_vec().unwrap())
        .collect();

    Ok(State {
        version: state.version,
        chain_id: state.chain_id.clone(),
        initial_height: state.initial_height,
        last_block_height: height,
        last_block_id: block_id.clone(),
        last_block_time: block.header.time,
        validators: state.next_validators.clone(),
        next_validators,
        last_validators: state.validators.clone(),
        last_height_validators_changed,
        consensus_params,
        last_height_consensus_params_changed,
        last_results_hash: hash_from_byte_slices(&results_bytes),
        app_hash: state.app_hash.clone(),
    })
}

/// Ways in which validating or executing a block can fail.
#[derive(Debug)]
pub enum ExecutionError {
    /// The block is not a valid successor of the current state.
    InvalidBlock(String),
    /// The application returned an invalid validator update set.
    InvalidValidatorUpdates(ValidatorSetUpdateError),
    /// The application returned invalid consensus parameters.
    InvalidParamUpdates(String),
    Storage(StoreError),
}

impl std::fmt::Display for ExecutionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionError::InvalidBlock(reason) => write!(f, "invalid block: {}", reason),
            ExecutionError::InvalidValidatorUpdates(source) => {
                write!(f, "invalid validator updates: {}", source)
            }
            ExecutionError::InvalidParamUpdates(reason) => {
                write!(f, "invalid consensus parameter updates: {}", reason)
            }
            ExecutionError::Storage(source) => write!(f, "storage error: {}", source),
        }
    }
}

impl From<StoreError> for ExecutionError {
    fn from(error: StoreError) -> Self {
        ExecutionError::Storage(error)
    }
}

impl From<ValidatorSetUpdateError> for ExecutionError {
    fn from(error: ValidatorSetUpdateError) -> Self {
        ExecutionError::InvalidValidatorUpdates(error)
    }
}
