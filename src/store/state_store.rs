/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Storage of the inter-block [`State`], historical validator sets, and per-block execution
//! results.

use borsh::{BorshDeserialize, BorshSerialize};

use crate::executor::ExecutionResults;
use crate::state::{State, StateBytes};
use crate::types::basic::Height;
use crate::types::validators::{ValidatorSet, ValidatorSetBytes};

use super::block_store::{height_key, load_at_height};
use super::kv_store::{KVStore, StoreError, WriteBatch};
use super::paths;

/// Storage of consensus state that is not the blocks themselves.
#[derive(Clone)]
pub struct StateStore<K: KVStore> {
    kv: K,
}

impl<K: KVStore> StateStore<K> {
    pub fn new(kv: K) -> Self {
        Self { kv }
    }

    /// Persist `state`, and index the validator sets of the next two heights so that commits for
    /// those heights can be verified later without replaying.
    pub fn save(&mut self, state: &State) {
        let mut wb = K::WriteBatch::new();
        wb.set(
            &paths::STATE,
            &StateBytes::from(state).try_to_vec().unwrap(),
        );
        wb.set(
            &height_key(&paths::VALIDATORS, state.next_height()),
            &ValidatorSetBytes::from(&state.validators).try_to_vec().unwrap(),
        );
        wb.set(
            &height_key(&paths::VALIDATORS, state.next_height() + 1),
            &ValidatorSetBytes::from(&state.next_validators)
                .try_to_vec()
                .unwrap(),
        );
        self.kv.write(wb);
    }

    pub fn load(&self) -> Result<Option<State>, StoreError> {
        match self.kv.get(&paths::STATE) {
            Some(bytes) => {
                let state_bytes = StateBytes::deserialize(&mut bytes.as_slice()).map_err(|err| {
                    StoreError::DeserializeValue {
                        key: "state",
                        source: err,
                    }
                })?;
                Ok(Some(State::try_from(state_bytes)?))
            }
            None => Ok(None),
        }
    }

    /// The validator set active at `height`, if it is still indexed.
    pub fn load_validators(&self, height: Height) -> Result<Option<ValidatorSet>, StoreError> {
        let bytes: Option<ValidatorSetBytes> =
            load_at_height(&self.kv, &paths::VALIDATORS, height, "validators")?;
        match bytes {
            Some(bytes) => Ok(Some(ValidatorSet::try_from(bytes)?)),
            None => Ok(None),
        }
    }

    /// Persist the execution results of the block at `height`.
    pub fn save_execution_results(&mut self, height: Height, results: &ExecutionResults) {
        let mut wb = K::WriteBatch::new();
        wb.set(
            &height_key(&paths::EXECUTION_RESULTS, height),
            &results.try_to_vec().unwrap(),
        );
        self.kv.write(wb);
    }

    pub fn load_execution_results(
        &self,
        height: Height,
    ) -> Result<Option<ExecutionResults>, StoreError> {
        load_at_height(&self.kv, &paths::EXECUTION_RESULTS, height, "execution results")
    }

    /// Delete validator set and execution result records for heights in `[from, to)`.
    pub fn prune(&mut self, from: Height, to: Height) {
        let mut wb = K::WriteBatch::new();
        let mut height = from;
        while height < to {
            wb.delete(&height_key(&paths::VALIDATORS, height));
            wb.delete(&height_key(&paths::EXECUTION_RESULTS, height));
            height += 1;
        }
        self.kv.write(wb);
    }
}
