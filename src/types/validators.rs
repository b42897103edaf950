/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Validator sets: identities and voting powers of the validators active at a height, quorum
//! arithmetic, and the proposer rotation.
//!
//! # Validator set updates
//!
//! The application can change the validator set through the updates it returns from
//! [`end_block`](crate::app::App::end_block). Updates returned while executing the block at
//! height H take effect with a one-block delay: they are folded into `next_validators`, which
//! becomes the active set at height H+2. This gives every replica, including ones that are
//! syncing, an unambiguous answer to "who validates height H" using only committed data.
//!
//! # Quorum
//!
//! A set of votes is a quorum when the voting powers behind it sum to *more than two thirds* of
//! the set's total power. [`ValidatorSet::quorum`] returns the smallest sum that qualifies.

use std::fmt::{self, Display, Formatter};

use borsh::{BorshDeserialize, BorshSerialize};
use ed25519_dalek::VerifyingKey;
use sha2::{Digest, Sha256};

use crate::merkle;

use super::basic::{Address, CryptoHash, Power, TotalPower};

/// Largest voting power a single validator may hold.
pub const MAX_VOTING_POWER: u64 = i64::MAX as u64 / 8;

/// Largest total power a validator set may hold. Priority arithmetic adds and subtracts the
/// total power in `i64`, so every path that changes a set's powers must keep the sum within
/// this bound: [`ValidatorSet::apply_updates`] and genesis validation both enforce it.
pub const MAX_TOTAL_VOTING_POWER: u128 = (i64::MAX / 8) as u128;

pub(crate) const TOTAL_POWER_OVERFLOW: &str =
    "Total power exceeds MAX_TOTAL_VOTING_POWER. Every change to a validator set's powers is \
     checked against the bound, so this should not happen.";

/// Derive a validator's [`Address`] from its public key: the first 20 bytes of the SHA256 hash of
/// the key's bytes.
pub fn address_of(pub_key: &VerifyingKey) -> Address {
    let digest: [u8; 32] = Sha256::digest(pub_key.as_bytes()).into();
    let mut address = [0u8; 20];
    address.copy_from_slice(&digest[..20]);
    Address::new(address)
}

/// A single validator: its identity, voting power, and current place in the proposer rotation.
#[derive(Clone, PartialEq, Eq)]
pub struct Validator {
    pub address: Address,
    pub pub_key: VerifyingKey,
    pub power: Power,
    pub proposer_priority: i64,
}

impl Validator {
    /// Create a new `Validator` with the given key and power, with its address derived from the
    /// key and a proposer priority of 0.
    pub fn new(pub_key: VerifyingKey, power: Power) -> Self {
        Self {
            address: address_of(&pub_key),
            pub_key,
            power,
            proposer_priority: 0,
        }
    }

    /// The canonical bytes of this validator that are hashed into
    /// [`ValidatorSet::hash`]: its public key and power, not its rotation state.
    fn canonical_bytes(&self) -> Vec<u8> {
        let canonical = CanonicalValidator {
            pub_key: self.pub_key.to_bytes(),
            power: self.power,
        };
        canonical.try_to_vec().unwrap()
    }
}

#[derive(BorshSerialize)]
struct CanonicalValidator {
    pub_key: [u8; 32],
    power: Power,
}

/// Intermediate representation of [`Validator`] for Borsh. `VerifyingKey` does not implement the
/// Borsh traits, so keys cross serialization boundaries as `[u8; 32]` and are validated again on
/// the way in.
#[derive(Clone, BorshDeserialize, BorshSerialize)]
pub struct ValidatorBytes {
    pub pub_key: [u8; 32],
    pub power: Power,
    pub proposer_priority: i64,
}

impl From<&Validator> for ValidatorBytes {
    fn from(validator: &Validator) -> Self {
        Self {
            pub_key: validator.pub_key.to_bytes(),
            power: validator.power,
            proposer_priority: validator.proposer_priority,
        }
    }
}

impl TryFrom<ValidatorBytes> for Validator {
    type Error = ed25519_dalek::SignatureError;

    fn try_from(bytes: ValidatorBytes) -> Result<Self, Self::Error> {
        let pub_key = VerifyingKey::from_bytes(&bytes.pub_key)?;
        Ok(Self {
            address: address_of(&pub_key),
            pub_key,
            power: bytes.power,
            proposer_priority: bytes.proposer_priority,
        })
    }
}

/// The set of validators active at some height, ordered by ascending address.
#[derive(Clone, PartialEq, Eq)]
pub struct ValidatorSet {
    validators: Vec<Validator>,
    proposer: Option<usize>,
}

impl ValidatorSet {
    /// Create a new `ValidatorSet` from `validators`, sorted into address order. The validator
    /// with the highest proposer priority becomes the proposer.
    pub fn new(mut validators: Vec<Validator>) -> Self {
        validators.sort_by(|v1, v2| v1.address.cmp(&v2.address));
        let mut validator_set = Self {
            validators,
            proposer: None,
        };
        validator_set.proposer = validator_set.highest_priority();
        validator_set
    }

    /// Create an empty `ValidatorSet`. Used at genesis when the application provides the initial
    /// validators from `init_chain`.
    pub fn empty() -> Self {
        Self {
            validators: Vec::new(),
            proposer: None,
        }
    }

    pub fn len(&self) -> usize {
        self.validators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Validator> {
        self.validators.iter()
    }

    /// Get the validator at `index` in address order.
    pub fn get_by_index(&self, index: u32) -> Option<&Validator> {
        self.validators.get(index as usize)
    }

    /// Get the validator with the given address.
    pub fn get_by_address(&self, address: &Address) -> Option<&Validator> {
        self.index_of(address)
            .map(|index| &self.validators[index as usize])
    }

    /// Get the index of the validator with the given address.
    pub fn index_of(&self, address: &Address) -> Option<u32> {
        self.validators
            .binary_search_by(|validator| validator.address.cmp(address))
            .ok()
            .map(|index| index as u32)
    }

    /// Whether a validator with the given address is in this set.
    pub fn has_address(&self, address: &Address) -> bool {
        self.index_of(address).is_some()
    }

    /// Sum of the powers of all validators in this set.
    pub fn total_power(&self) -> TotalPower {
        let mut total = TotalPower::zero();
        for validator in &self.validators {
            total += validator.power;
        }
        total
    }

    /// The minimum sum of voting powers that makes up a quorum: strictly more than two thirds of
    /// the total power.
    pub fn quorum(&self) -> TotalPower {
        TotalPower::new(
            self.total_power()
                .int()
                .checked_mul(2)
                .expect(TOTAL_POWER_OVERFLOW)
                / 3
                + 1,
        )
    }

    /// Hash of this validator set: the Merkle root over the canonical bytes of each validator in
    /// address order.
    pub fn hash(&self) -> CryptoHash {
        let canonical_validators: Vec<Vec<u8>> = self
            .validators
            .iter()
            .map(Validator::canonical_bytes)
            .collect();
        merkle::hash_from_byte_slices(&canonical_validators)
    }

    /// The validator whose turn it is to propose.
    pub fn current_proposer(&self) -> Option<&Validator> {
        self.proposer.map(|index| &self.validators[index])
    }

    /// Apply the power changes in `updates` to this set.
    ///
    /// An update with power 0 removes the validator; any other power inserts the validator or
    /// changes its power in place. New validators enter the rotation with priority 0.
    ///
    /// On error the set may have absorbed a prefix of the updates and must be discarded; apply
    /// updates to a copy of the set that survives the failure.
    pub fn apply_updates(
        &mut self,
        updates: &[ValidatorUpdate],
    ) -> Result<(), ValidatorSetUpdateError> {
        validate_updates(updates)?;
        for update in updates {
            let address = address_of(&update.pub_key);
            let position = self
                .validators
                .binary_search_by(|validator| validator.address.cmp(&address));
            if update.power.int() == 0 {
                match position {
                    Ok(index) => {
                        self.validators.remove(index);
                    }
                    Err(_) => {
                        return Err(ValidatorSetUpdateError::RemoveNonMember { address });
                    }
                }
            } else {
                match position {
                    Ok(index) => self.validators[index].power = update.power,
                    Err(index) => self
                        .validators
                        .insert(index, Validator::new(update.pub_key, update.power)),
                }
            }
        }
        let total = self.total_power().int();
        if total > MAX_TOTAL_VOTING_POWER {
            return Err(ValidatorSetUpdateError::TotalPowerOverflow { total });
        }
        self.proposer = self.highest_priority();
        Ok(())
    }

    /// Advance the proposer rotation by `times` turns of the standard power-weighted round-robin.
    ///
    /// Each turn adds every validator's power to its priority, selects the validator with the
    /// highest priority as proposer, and subtracts the total power from the selected validator's
    /// priority. Over a full cycle each validator proposes in proportion to its power.
    pub fn increment_proposer_priority(&mut self, times: u32) {
        if self.validators.is_empty() {
            return;
        }
        self.center_priorities();
        let total_power = i64::try_from(self.total_power().int()).expect(TOTAL_POWER_OVERFLOW);
        for _ in 0..times {
            for validator in self.validators.iter_mut() {
                validator.proposer_priority = validator
                    .proposer_priority
                    .saturating_add(validator.power.int() as i64);
            }
            let proposer = self.highest_priority().unwrap();
            self.validators[proposer].proposer_priority -= total_power;
            self.proposer = Some(proposer);
        }
    }

    /// Shift all priorities so that they sum to (close to) zero. Keeps repeated rotation from
    /// drifting priorities toward the `i64` limits.
    fn center_priorities(&mut self) {
        let sum: i128 = self
            .validators
            .iter()
            .map(|validator| validator.proposer_priority as i128)
            .sum();
        let average = (sum / self.validators.len() as i128) as i64;
        for validator in self.validators.iter_mut() {
            validator.proposer_priority -= average;
        }
    }

    /// Index of the validator with the highest proposer priority, breaking ties toward the lowest
    /// address.
    fn highest_priority(&self) -> Option<usize> {
        self.validators
            .iter()
            .enumerate()
            .max_by(|(index1, v1), (index2, v2)| {
                v1.proposer_priority
                    .cmp(&v2.proposer_priority)
                    .then(index2.cmp(index1))
            })
            .map(|(index, _)| index)
    }
}

/// Intermediate representation of [`ValidatorSet`] for Borsh.
#[derive(Clone, BorshDeserialize, BorshSerialize)]
pub struct ValidatorSetBytes {
    pub validators: Vec<ValidatorBytes>,
    pub proposer: Option<u32>,
}

impl From<&ValidatorSet> for ValidatorSetBytes {
    fn from(validator_set: &ValidatorSet) -> Self {
        Self {
            validators: validator_set
                .validators
                .iter()
                .map(ValidatorBytes::from)
                .collect(),
            proposer: validator_set.proposer.map(|index| index as u32),
        }
    }
}

impl TryFrom<ValidatorSetBytes> for ValidatorSet {
    type Error = ed25519_dalek::SignatureError;

    fn try_from(bytes: ValidatorSetBytes) -> Result<Self, Self::Error> {
        let validators = bytes
            .validators
            .into_iter()
            .map(Validator::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            validators,
            proposer: bytes.proposer.map(|index| index as usize),
        })
    }
}

/// A change to one validator's power, as returned by the application from
/// [`end_block`](crate::app::App::end_block) or `init_chain`.
#[derive(Clone)]
pub struct ValidatorUpdate {
    pub pub_key: VerifyingKey,
    /// The validator's new power. 0 removes the validator from the set.
    pub power: Power,
}

/// Intermediate representation of [`ValidatorUpdate`] for Borsh.
#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct ValidatorUpdateBytes {
    pub pub_key: [u8; 32],
    pub power: Power,
}

impl From<&ValidatorUpdate> for ValidatorUpdateBytes {
    fn from(update: &ValidatorUpdate) -> Self {
        Self {
            pub_key: update.pub_key.to_bytes(),
            power: update.power,
        }
    }
}

impl TryFrom<ValidatorUpdateBytes> for ValidatorUpdate {
    type Error = ed25519_dalek::SignatureError;

    fn try_from(bytes: ValidatorUpdateBytes) -> Result<Self, Self::Error> {
        Ok(Self {
            pub_key: VerifyingKey::from_bytes(&bytes.pub_key)?,
            power: bytes.power,
        })
    }
}

/// Check that every update in `updates` carries a legal power.
pub fn validate_updates(updates: &[ValidatorUpdate]) -> Result<(), ValidatorSetUpdateError> {
    for update in updates {
        if update.power.int() > MAX_VOTING_POWER {
            return Err(ValidatorSetUpdateError::PowerOutOfRange {
                address: address_of(&update.pub_key),
                power: update.power,
            });
        }
    }
    Ok(())
}

/// Ways in which applying validator set updates can fail.
#[derive(Debug, PartialEq, Eq)]
pub enum ValidatorSetUpdateError {
    /// An update tried to remove a validator that is not in the set.
    RemoveNonMember { address: Address },
    /// An update carried a power above [`MAX_VOTING_POWER`].
    PowerOutOfRange { address: Address, power: Power },
    /// Applying the updates would push the set's total power above
    /// [`MAX_TOTAL_VOTING_POWER`].
    TotalPowerOverflow { total: u128 },
}

impl Display for ValidatorSetUpdateError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ValidatorSetUpdateError::RemoveNonMember { address } => {
                write!(f, "update removes validator {:?}, which is not in the set", address)
            }
            ValidatorSetUpdateError::PowerOutOfRange { address, power } => {
                write!(
                    f,
                    "update gives validator {:?} power {}, above the maximum {}",
                    address,
                    power.int(),
                    MAX_VOTING_POWER
                )
            }
            ValidatorSetUpdateError::TotalPowerOverflow { total } => {
                write!(
                    f,
                    "updates push the set's total power to {}, above the maximum {}",
                    total, MAX_TOTAL_VOTING_POWER
                )
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::SigningKey;
    use rand_core::OsRng;

    fn validator_set(powers: &[u64]) -> ValidatorSet {
        let validators = powers
            .iter()
            .map(|power| {
                let keypair = SigningKey::generate(&mut OsRng);
                Validator::new(keypair.verifying_key(), Power::new(*power))
            })
            .collect();
        ValidatorSet::new(validators)
    }

    #[test]
    fn quorum_is_strictly_more_than_two_thirds() {
        let validator_set = validator_set(&[1, 1, 1]);
        // With total power 3, two votes are a quorum and one is not.
        assert_eq!(validator_set.quorum(), TotalPower::new(3));

        let validator_set = self::validator_set(&[2, 2, 2]);
        assert_eq!(validator_set.quorum(), TotalPower::new(5));
    }

    #[test]
    fn rotation_is_power_weighted() {
        let mut validator_set = validator_set(&[2, 1]);
        let heavy = validator_set
            .iter()
            .find(|validator| validator.power == Power::new(2))
            .unwrap()
            .address;

        let mut turns_for_heavy = 0;
        for _ in 0..300 {
            validator_set.increment_proposer_priority(1);
            if validator_set.current_proposer().unwrap().address == heavy {
                turns_for_heavy += 1;
            }
        }
        assert_eq!(turns_for_heavy, 200);
    }

    #[test]
    fn updates_insert_change_and_remove() {
        let mut validator_set = validator_set(&[1, 1]);
        let newcomer = SigningKey::generate(&mut OsRng).verifying_key();

        validator_set
            .apply_updates(&[ValidatorUpdate {
                pub_key: newcomer,
                power: Power::new(3),
            }])
            .unwrap();
        assert_eq!(validator_set.len(), 3);
        assert_eq!(validator_set.total_power(), TotalPower::new(5));

        validator_set
            .apply_updates(&[ValidatorUpdate {
                pub_key: newcomer,
                power: Power::new(0),
            }])
            .unwrap();
        assert_eq!(validator_set.len(), 2);
        assert!(!validator_set.has_address(&address_of(&newcomer)));

        assert_eq!(
            validator_set.apply_updates(&[ValidatorUpdate {
                pub_key: newcomer,
                power: Power::new(0),
            }]),
            Err(ValidatorSetUpdateError::RemoveNonMember {
                address: address_of(&newcomer)
            })
        );
    }

    #[test]
    fn total_power_is_bounded() {
        // One validator at the per-validator maximum is fine, and the rotation arithmetic
        // must survive it.
        let mut validator_set = validator_set(&[MAX_VOTING_POWER]);
        validator_set.increment_proposer_priority(3);
        assert!(validator_set.current_proposer().is_some());

        // A second update that pushes the total over the bound is rejected even though each
        // individual power is legal.
        let newcomer = SigningKey::generate(&mut OsRng).verifying_key();
        let result = validator_set.apply_updates(&[ValidatorUpdate {
            pub_key: newcomer,
            power: Power::new(MAX_VOTING_POWER),
        }]);
        assert_eq!(
            result,
            Err(ValidatorSetUpdateError::TotalPowerOverflow {
                total: 2 * MAX_VOTING_POWER as u128
            })
        );
    }

    #[test]
    fn hash_ignores_rotation_state() {
        let mut validator_set = validator_set(&[1, 2, 3]);
        let hash_before = validator_set.hash();
        validator_set.increment_proposer_priority(5);
        assert_eq!(validator_set.hash(), hash_before);
    }
}
