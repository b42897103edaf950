/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The genesis document: the agreed-upon starting point of a chain.

use std::fmt::{self, Display, Formatter};

use ed25519_dalek::VerifyingKey;

use crate::state::ConsensusParams;
use crate::types::basic::{ChainId, Height, Power, Timestamp};
use crate::types::validators::{Validator, ValidatorSet, MAX_TOTAL_VOTING_POWER, MAX_VOTING_POWER};

/// Longest chain id accepted, in bytes.
pub const MAX_CHAIN_ID_LEN: usize = 50;

/// One initial validator listed in the genesis document.
#[derive(Clone)]
pub struct GenesisValidator {
    pub pub_key: VerifyingKey,
    pub power: Power,
    pub name: String,
}

/// The genesis document. All replicas of a chain must start from identical genesis documents;
/// any divergence produces a different chain.
#[derive(Clone)]
pub struct GenesisDoc {
    pub genesis_time: Timestamp,
    pub chain_id: ChainId,
    /// Height of the first block, at least 1.
    pub initial_height: Height,
    pub consensus_params: ConsensusParams,
    /// Initial validators. May be empty, in which case the application must return the initial
    /// validator set from [`init_chain`](crate::app::App::init_chain).
    pub validators: Vec<GenesisValidator>,
    /// The application's state hash at genesis.
    pub app_hash: Vec<u8>,
    /// Opaque application-defined genesis state, passed through to
    /// [`init_chain`](crate::app::App::init_chain).
    pub app_state: Vec<u8>,
}

impl GenesisDoc {
    /// Validate this document and fill in defaults: an `initial_height` of 0 is normalized
    /// to 1.
    pub fn validate_and_complete(&mut self) -> Result<(), GenesisError> {
        if self.chain_id.str().is_empty() {
            return Err(GenesisError::EmptyChainId);
        }
        if self.chain_id.str().len() > MAX_CHAIN_ID_LEN {
            return Err(GenesisError::ChainIdTooLong {
                len: self.chain_id.str().len(),
            });
        }
        if self.initial_height.int() == 0 {
            self.initial_height = Height::new(1);
        }
        self.consensus_params
            .validate()
            .map_err(GenesisError::InvalidConsensusParams)?;
        let mut total_power: u128 = 0;
        for validator in &self.validators {
            if validator.power.int() == 0 || validator.power.int() > MAX_VOTING_POWER {
                return Err(GenesisError::InvalidValidatorPower {
                    name: validator.name.clone(),
                    power: validator.power,
                });
            }
            total_power += validator.power.int() as u128;
        }
        if total_power > MAX_TOTAL_VOTING_POWER {
            return Err(GenesisError::TotalPowerOverflow { total: total_power });
        }
        Ok(())
    }

    /// The validator set formed by this document's validators.
    pub fn validator_set(&self) -> ValidatorSet {
        ValidatorSet::new(
            self.validators
                .iter()
                .map(|genesis_validator| {
                    Validator::new(genesis_validator.pub_key, genesis_validator.power)
                })
                .collect(),
        )
    }
}

/// Ways in which a genesis document can be invalid.
#[derive(Debug)]
pub enum GenesisError {
    EmptyChainId,
    ChainIdTooLong { len: usize },
    InvalidConsensusParams(String),
    InvalidValidatorPower { name: String, power: Power },
    TotalPowerOverflow { total: u128 },
}

impl Display for GenesisError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            GenesisError::EmptyChainId => write!(f, "genesis chain id is empty"),
            GenesisError::ChainIdTooLong { len } => {
                write!(f, "genesis chain id is {} bytes, above the maximum {}", len, MAX_CHAIN_ID_LEN)
            }
            GenesisError::InvalidConsensusParams(reason) => {
                write!(f, "invalid consensus params: {}", reason)
            }
            GenesisError::InvalidValidatorPower { name, power } => {
                write!(
                    f,
                    "genesis validator {:?} has invalid power {}",
                    name,
                    power.int()
                )
            }
            GenesisError::TotalPowerOverflow { total } => {
                write!(
                    f,
                    "genesis validators hold a total power of {}, above the maximum",
                    total
                )
            }
        }
    }
}
