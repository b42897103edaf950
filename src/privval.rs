/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The file-backed private validator: signs votes and proposals, and refuses to sign anything
//! that could be used as evidence of equivocation.
//!
//! The signer persists the (height, round, step) and sign-bytes of its last signature *before*
//! releasing the signature. On restart it reloads that record, so even a replica that crashes
//! mid-round and recovers with amnesia about its vote cannot be tricked into signing a
//! conflicting one. Signing for a (height, round, step) at or before the recorded one is only
//! allowed when the sign-bytes are identical (the stored signature is returned) or differ only
//! in their timestamp (the stored signature and timestamp are reused).

use std::fmt::{self, Display, Formatter};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use borsh::{BorshDeserialize, BorshSerialize};
use ed25519_dalek::{Signer, SigningKey, VerifyingKey};
use rand_core::OsRng;

use crate::types::basic::{Address, ChainId, Height, Round, SignatureBytes};
use crate::types::proposal::{CanonicalProposal, Proposal};
use crate::types::validators::address_of;
use crate::types::vote::{CanonicalVote, Vote, VoteType};

/// Which kind of message the signer last signed. Ordered: within one (height, round), a
/// validator signs at most one proposal, then at most one prevote, then at most one precommit.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, BorshDeserialize, BorshSerialize,
)]
pub enum SignStep {
    None,
    Propose,
    Prevote,
    Precommit,
}

impl SignStep {
    fn for_vote_type(vote_type: VoteType) -> Self {
        match vote_type {
            VoteType::Prevote => SignStep::Prevote,
            VoteType::Precommit => SignStep::Precommit,
        }
    }
}

/// The validator's long-lived signing key, kept in its own file.
pub struct FilePvKey {
    pub address: Address,
    signing_key: SigningKey,
    path: PathBuf,
}

#[derive(BorshDeserialize, BorshSerialize)]
struct FilePvKeyBytes {
    priv_key: [u8; 32],
}

impl FilePvKey {
    fn from_signing_key(signing_key: SigningKey, path: PathBuf) -> Self {
        Self {
            address: address_of(&signing_key.verifying_key()),
            signing_key,
            path,
        }
    }

    pub fn pub_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    fn save(&self) -> Result<(), SignerError> {
        let bytes = FilePvKeyBytes {
            priv_key: self.signing_key.to_bytes(),
        };
        write_atomically(&self.path, &bytes.try_to_vec().unwrap()).map_err(SignerError::Io)
    }

    fn load(path: &Path) -> Result<Self, SignerError> {
        let bytes = fs::read(path).map_err(SignerError::Io)?;
        let key_bytes =
            FilePvKeyBytes::deserialize(&mut bytes.as_slice()).map_err(SignerError::Decode)?;
        let signing_key = SigningKey::from_bytes(&key_bytes.priv_key);
        Ok(Self::from_signing_key(signing_key, path.to_path_buf()))
    }
}

/// The record of the last signature released, persisted before the signature leaves the signer.
pub struct LastSignState {
    pub height: Height,
    pub round: Round,
    pub step: SignStep,
    pub signature: Option<SignatureBytes>,
    pub sign_bytes: Vec<u8>,
    path: PathBuf,
}

#[derive(BorshDeserialize, BorshSerialize)]
struct LastSignStateBytes {
    height: Height,
    round: Round,
    step: SignStep,
    signature: Option<SignatureBytes>,
    sign_bytes: Vec<u8>,
}

impl LastSignState {
    fn fresh(path: PathBuf) -> Self {
        Self {
            height: Height::new(0),
            round: Round::new(0),
            step: SignStep::None,
            signature: None,
            sign_bytes: Vec::new(),
            path,
        }
    }

    fn load_or_fresh(path: &Path) -> Result<Self, SignerError> {
        match fs::read(path) {
            Ok(bytes) => {
                let state_bytes = LastSignStateBytes::deserialize(&mut bytes.as_slice())
                    .map_err(SignerError::Decode)?;
                Ok(Self {
                    height: state_bytes.height,
                    round: state_bytes.round,
                    step: state_bytes.step,
                    signature: state_bytes.signature,
                    sign_bytes: state_bytes.sign_bytes,
                    path: path.to_path_buf(),
                })
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(Self::fresh(path.to_path_buf())),
            Err(err) => Err(SignerError::Io(err)),
        }
    }

    fn save(&self) -> Result<(), SignerError> {
        let bytes = LastSignStateBytes {
            height: self.height,
            round: self.round,
            step: self.step,
            signature: self.signature,
            sign_bytes: self.sign_bytes.clone(),
        };
        write_atomically(&self.path, &bytes.try_to_vec().unwrap()).map_err(SignerError::Io)
    }

    /// Compare (height, round, step) against the last signature. `Ok(true)` means "same point,
    /// a regression-free re-sign attempt"; `Ok(false)` means "strictly later, free to sign".
    fn check_hrs(&self, height: Height, round: Round, step: SignStep) -> Result<bool, SignerError> {
        let last = (self.height, self.round, self.step);
        let new = (height, round, step);
        if new < last {
            return Err(SignerError::Regression { last, new });
        }
        if new == last {
            if self.sign_bytes.is_empty() {
                return Err(SignerError::CorruptState);
            }
            return Ok(true);
        }
        Ok(false)
    }
}

/// A private validator backed by two files: one for the key, one for the last-sign state.
pub struct FilePv {
    pub key: FilePvKey,
    pub last_sign_state: LastSignState,
}

impl FilePv {
    /// Generate a fresh key at `key_path` with an empty last-sign state at `state_path`.
    pub fn generate(key_path: &Path, state_path: &Path) -> Result<Self, SignerError> {
        let key = FilePvKey::from_signing_key(SigningKey::generate(&mut OsRng), key_path.to_path_buf());
        key.save()?;
        let last_sign_state = LastSignState::fresh(state_path.to_path_buf());
        last_sign_state.save()?;
        Ok(Self {
            key,
            last_sign_state,
        })
    }

    /// Load the key from `key_path` and the last-sign state from `state_path`. A missing state
    /// file is treated as empty; a missing key file is an error.
    pub fn load(key_path: &Path, state_path: &Path) -> Result<Self, SignerError> {
        Ok(Self {
            key: FilePvKey::load(key_path)?,
            last_sign_state: LastSignState::load_or_fresh(state_path)?,
        })
    }

    pub fn address(&self) -> Address {
        self.key.address
    }

    pub fn pub_key(&self) -> VerifyingKey {
        self.key.pub_key()
    }

    /// Sign `vote`, filling in its `signature` (and possibly rewinding its `timestamp` to match
    /// an earlier signature over the same content).
    pub fn sign_vote(&mut self, chain_id: &ChainId, vote: &mut Vote) -> Result<(), SignerError> {
        let step = SignStep::for_vote_type(vote.vote_type);
        let same_hrs = self
            .last_sign_state
            .check_hrs(vote.height, vote.round, step)?;
        let sign_bytes = vote.sign_bytes(chain_id);

        if same_hrs {
            if sign_bytes == self.last_sign_state.sign_bytes {
                vote.signature = self.last_sign_state.signature.ok_or(SignerError::CorruptState)?;
                return Ok(());
            }
            let last_canonical =
                CanonicalVote::deserialize(&mut self.last_sign_state.sign_bytes.as_slice())
                    .map_err(SignerError::Decode)?;
            let new_canonical = CanonicalVote::from_vote(vote, chain_id);
            if last_canonical.eq_ignoring_timestamp(&new_canonical) {
                vote.timestamp = last_canonical.timestamp;
                vote.signature = self.last_sign_state.signature.ok_or(SignerError::CorruptState)?;
                return Ok(());
            }
            return Err(SignerError::DoubleSign {
                height: vote.height,
                round: vote.round,
                step,
            });
        }

        let signature = SignatureBytes::new(self.key.signing_key.sign(&sign_bytes).to_bytes());
        self.save_signed(vote.height, vote.round, step, sign_bytes, signature)?;
        vote.signature = signature;
        Ok(())
    }

    /// Sign `proposal`, filling in its `signature`.
    pub fn sign_proposal(
        &mut self,
        chain_id: &ChainId,
        proposal: &mut Proposal,
    ) -> Result<(), SignerError> {
        let same_hrs =
            self.last_sign_state
                .check_hrs(proposal.height, proposal.round, SignStep::Propose)?;
        let sign_bytes = proposal.sign_bytes(chain_id);

        if same_hrs {
            if sign_bytes == self.last_sign_state.sign_bytes {
                proposal.signature =
                    self.last_sign_state.signature.ok_or(SignerError::CorruptState)?;
                return Ok(());
            }
            let last_canonical =
                CanonicalProposal::deserialize(&mut self.last_sign_state.sign_bytes.as_slice())
                    .map_err(SignerError::Decode)?;
            let new_canonical = CanonicalProposal::from_proposal(proposal, chain_id);
            if last_canonical.eq_ignoring_timestamp(&new_canonical) {
                proposal.timestamp = last_canonical.timestamp;
                proposal.signature =
                    self.last_sign_state.signature.ok_or(SignerError::CorruptState)?;
                return Ok(());
            }
            return Err(SignerError::DoubleSign {
                height: proposal.height,
                round: proposal.round,
                step: SignStep::Propose,
            });
        }

        let signature = SignatureBytes::new(self.key.signing_key.sign(&sign_bytes).to_bytes());
        self.save_signed(
            proposal.height,
            proposal.round,
            SignStep::Propose,
            sign_bytes,
            signature,
        )?;
        proposal.signature = signature;
        Ok(())
    }

    /// Record what is about to be signed and persist the record. Must complete before the
    /// signature is released to the caller.
    fn save_signed(
        &mut self,
        height: Height,
        round: Round,
        step: SignStep,
        sign_bytes: Vec<u8>,
        signature: SignatureBytes,
    ) -> Result<(), SignerError> {
        self.last_sign_state.height = height;
        self.last_sign_state.round = round;
        self.last_sign_state.step = step;
        self.last_sign_state.sign_bytes = sign_bytes;
        self.last_sign_state.signature = Some(signature);
        self.last_sign_state.save()
    }
}

/// Write `bytes` to a temporary file next to `path`, then rename it into place.
fn write_atomically(path: &Path, bytes: &[u8]) -> Result<(), io::Error> {
    let mut tmp_path = path.to_path_buf();
    tmp_path.set_extension("tmp");
    fs::write(&tmp_path, bytes)?;
    fs::rename(&tmp_path, path)
}

/// Ways in which signing can fail.
#[derive(Debug)]
pub enum SignerError {
    /// Asked to sign for a (height, round, step) before the last one signed.
    Regression {
        last: (Height, Round, SignStep),
        new: (Height, Round, SignStep),
    },
    /// Asked to sign conflicting content for an already-signed (height, round, step).
    DoubleSign {
        height: Height,
        round: Round,
        step: SignStep,
    },
    /// The persisted last-sign state contradicts itself.
    CorruptState,
    Io(io::Error),
    Decode(io::Error),
}

impl Display for SignerError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            SignerError::Regression { last, new } => write!(
                f,
                "sign request for {:?} regresses behind the last signed {:?}",
                new, last
            ),
            SignerError::DoubleSign {
                height,
                round,
                step,
            } => write!(
                f,
                "refusing to double-sign at height {} round {} step {:?}",
                height, round, step
            ),
            SignerError::CorruptState => write!(f, "last-sign state file is corrupt"),
            SignerError::Io(source) => write!(f, "signer io error: {}", source),
            SignerError::Decode(source) => write!(f, "signer state decode error: {}", source),
        }
    }
}
