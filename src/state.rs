/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The inter-block state: everything a replica must remember between heights to validate and
//! execute the next block.
//!
//! `State` is a pure value. The [`BlockExecutor`](crate::executor::BlockExecutor) derives the
//! post-block state from the pre-block state and the block, and only then persists it; a crash
//! between blocks therefore always restarts from a consistent state.

use borsh::{BorshDeserialize, BorshSerialize};
use sha2::{Digest, Sha256};

use crate::types::basic::{Address, ChainId, CryptoHash, Height, Timestamp, Transaction};
use crate::types::block::{Block, BlockId, Commit, Header, Version};
use crate::types::validators::{ValidatorSet, ValidatorSetBytes};

/// Version of the block structure produced by this crate.
pub const BLOCK_PROTOCOL: u64 = 1;

/// Hard upper bound on a block's total size.
pub const MAX_BLOCK_SIZE_BYTES: u64 = 100 * 1024 * 1024;

/// Consensus parameters that the application can adjust per height through
/// [`end_block`](crate::app::App::end_block).
#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct ConsensusParams {
    pub block: BlockParams,
}

#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct BlockParams {
    /// Maximum size of an encoded block, in bytes.
    pub max_bytes: u64,
    /// Maximum gas per block. -1 means unlimited.
    pub max_gas: i64,
}

impl ConsensusParams {
    pub fn default_params() -> Self {
        Self {
            block: BlockParams {
                max_bytes: 4 * 1024 * 1024,
                max_gas: -1,
            },
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.block.max_bytes == 0 {
            return Err("block.max_bytes must be positive".to_string());
        }
        if self.block.max_bytes > MAX_BLOCK_SIZE_BYTES {
            return Err(format!(
                "block.max_bytes {} exceeds the hard limit {}",
                self.block.max_bytes, MAX_BLOCK_SIZE_BYTES
            ));
        }
        if self.block.max_gas < -1 {
            return Err(format!("block.max_gas {} is below -1", self.block.max_gas));
        }
        Ok(())
    }

    /// Hash of these parameters, committed to by every header's `consensus_hash`.
    pub fn hash(&self) -> CryptoHash {
        CryptoHash::new(Sha256::digest(self.try_to_vec().unwrap()).into())
    }
}

/// Bytes a block spends on structure rather than transactions: encoding overhead, the header,
/// and one commit signature slot per validator. Conservative overestimates.
const MAX_BLOCK_OVERHEAD_BYTES: u64 = 16;
const MAX_HEADER_BYTES: u64 = 512;
const MAX_COMMIT_OVERHEAD_BYTES: u64 = 64;
const MAX_COMMIT_SIG_BYTES: u64 = 112;

/// The number of bytes available for transactions in a block bounded by `max_block_bytes`, whose
/// last commit has `num_validators` signature slots.
pub fn max_data_bytes(max_block_bytes: u64, num_validators: usize) -> u64 {
    max_block_bytes.saturating_sub(
        MAX_BLOCK_OVERHEAD_BYTES
            + MAX_HEADER_BYTES
            + MAX_COMMIT_OVERHEAD_BYTES
            + MAX_COMMIT_SIG_BYTES * num_validators as u64,
    )
}

/// The replica's view of the chain between blocks.
#[derive(Clone)]
pub struct State {
    pub version: Version,
    pub chain_id: ChainId,
    pub initial_height: Height,

    /// Height of the last committed block, or 0 if none has been committed.
    pub last_block_height: Height,
    pub last_block_id: BlockId,
    pub last_block_time: Timestamp,

    /// Validators of the block at `last_block_height + 1`.
    pub validators: ValidatorSet,
    /// Validators of the block after that. Validator updates land here first, which is what
    /// gives them their one-block delay.
    pub next_validators: ValidatorSet,
    /// Validators of the block at `last_block_height`, needed to verify its commit.
    pub last_validators: ValidatorSet,
    /// The last height at which the validator set changed.
    pub last_height_validators_changed: Height,

    pub consensus_params: ConsensusParams,
    pub last_height_consensus_params_changed: Height,

    /// Merkle root over the transaction results of the last committed block.
    pub last_results_hash: CryptoHash,
    /// The application's state hash after the last committed block.
    pub app_hash: Vec<u8>,
}

impl State {
    /// The state a chain starts from, before any block has been committed.
    ///
    /// The genesis validator set serves as `validators`, `next_validators`, and
    /// `last_validators`; the application may replace it via
    /// [`init_chain`](crate::app::App::init_chain) before the first block.
    pub fn from_genesis(genesis: &crate::genesis::GenesisDoc) -> Self {
        let validator_set = genesis.validator_set();
        Self {
            version: Version {
                block: BLOCK_PROTOCOL,
                app: 0,
            },
            chain_id: genesis.chain_id.clone(),
            initial_height: genesis.initial_height,
            last_block_height: Height::new(0),
            last_block_id: BlockId::zero(),
            last_block_time: genesis.genesis_time,
            validators: validator_set.clone(),
            next_validators: validator_set.clone(),
            last_validators: ValidatorSet::empty(),
            last_height_validators_changed: genesis.initial_height,
            consensus_params: genesis.consensus_params.clone(),
            last_height_consensus_params_changed: genesis.initial_height,
            last_results_hash: crate::merkle::tree::empty_hash(),
            app_hash: genesis.app_hash.clone(),
        }
    }

    /// Height of the next block to be committed.
    pub fn next_height(&self) -> Height {
        if self.last_block_height.int() == 0 {
            self.initial_height
        } else {
            self.last_block_height + 1
        }
    }

    /// Bytes available for transactions in the next block.
    pub fn max_data_bytes(&self) -> u64 {
        max_data_bytes(self.block_max_bytes(), self.validators.len())
    }

    fn block_max_bytes(&self) -> u64 {
        self.consensus_params.block.max_bytes
    }

    /// Build the block this replica would propose on top of the current state.
    ///
    /// The block's time is the wall clock, pushed forward if needed so that block times are
    /// strictly increasing.
    pub fn make_block(
        &self,
        height: Height,
        transactions: Vec<Transaction>,
        last_commit: Commit,
        proposer_address: Address,
    ) -> Block {
        let mut time = Timestamp::now();
        if time <= self.last_block_time {
            time = self.last_block_time.add_millis(1);
        }
        let header = Header {
            version: self.version,
            chain_id: self.chain_id.clone(),
            height,
            time,
            last_block_id: self.last_block_id.clone(),
            last_commit_hash: last_commit.hash(),
            data_hash: Block::data_hash(&transactions),
            validators_hash: self.validators.hash(),
            next_validators_hash: self.next_validators.hash(),
            consensus_hash: self.consensus_params.hash(),
            app_hash: self.app_hash.clone(),
            last_results_hash: self.last_results_hash,
            proposer_address,
        };
        Block {
            header,
            data: transactions,
            last_commit,
        }
    }
}

/// Intermediate representation of [`State`] for Borsh.
#[derive(BorshDeserialize, BorshSerialize)]
pub struct StateBytes {
    pub version: Version,
    pub chain_id: ChainId,
    pub initial_height: Height,
    pub last_block_height: Height,
    pub last_block_id: BlockId,
    pub last_block_time: Timestamp,
    pub validators: ValidatorSetBytes,
    pub next_validators: ValidatorSetBytes,
    pub last_validators: ValidatorSetBytes,
    pub last_height_validators_changed: Height,
    pub consensus_params: ConsensusParams,
    pub last_height_consensus_params_changed: Height,
    pub last_results_hash: CryptoHash,
    pub app_hash: Vec<u8>,
}

impl From<&State> for StateBytes {
    fn from(state: &State) -> Self {
        Self {
            version: state.version,
            chain_id: state.chain_id.clone(),
            initial_height: state.initial_height,
            last_block_height: state.last_block_height,
            last_block_id: state.last_block_id.clone(),
            last_block_time: state.last_block_time,
            validators: ValidatorSetBytes::from(&state.validators),
            next_validators: ValidatorSetBytes::from(&state.next_validators),
            last_validators: ValidatorSetBytes::from(&state.last_validators),
            last_height_validators_changed: state.last_height_validators_changed,
            consensus_params: state.consensus_params.clone(),
            last_height_consensus_params_changed: state.last_height_consensus_params_changed,
            last_results_hash: state.last_results_hash,
            app_hash: state.app_hash.clone(),
        }
    }
}

impl TryFrom<StateBytes> for State {
    type Error = ed25519_dalek::SignatureError;

    fn try_from(bytes: StateBytes) -> Result<Self, Self::Error> {
        Ok(Self {
            version: bytes.version,
            chain_id: bytes.chain_id,
            initial_height: bytes.initial_height,
            last_block_height: bytes.last_block_height,
            last_block_id: bytes.last_block_id,
            last_block_time: bytes.last_block_time,
            validators: ValidatorSet::try_from(bytes.validators)?,
            next_validators: ValidatorSet::try_from(bytes.next_validators)?,
            last_validators: ValidatorSet::try_from(bytes.last_validators)?,
            last_height_validators_changed: bytes.last_height_validators_changed,
            consensus_params: bytes.consensus_params,
            last_height_consensus_params_changed: bytes.last_height_consensus_params_changed,
            last_results_hash: bytes.last_results_hash,
            app_hash: bytes.app_hash,
        })
    }
}
