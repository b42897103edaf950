/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The [`KVStore`] trait, which specifies the required interface for the key-value store
//! provided by the user, and the errors reads through it can produce.

use std::fmt::{self, Display, Formatter};

/// A key-value store that can be written atomically.
///
/// `clone`s of a `KVStore` must observe each other's writes; they are handles onto the same
/// underlying store.
pub trait KVStore: KVGet + Clone + Send + 'static {
    type WriteBatch: WriteBatch;

    /// Apply `wb` atomically: either every operation in the batch becomes visible, or none does.
    fn write(&mut self, wb: Self::WriteBatch);
}

/// Types that can get the value mapped to a key.
pub trait KVGet {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>>;
}

/// An ordered set of put and delete operations that a [`KVStore`] applies atomically.
pub trait WriteBatch {
    fn new() -> Self;
    fn set(&mut self, key: &[u8], value: &[u8]);
    fn delete(&mut self, key: &[u8]);
}

/// Concatenate two key fragments.
pub(crate) fn combine(fragment_1: &[u8], fragment_2: &[u8]) -> Vec<u8> {
    let mut combined = Vec::with_capacity(fragment_1.len() + fragment_2.len());
    combined.extend_from_slice(fragment_1);
    combined.extend_from_slice(fragment_2);
    combined
}

/// Ways in which reading a typed value out of the key-value store can fail.
#[derive(Debug)]
pub enum StoreError {
    /// The bytes under a key did not decode as the type the key should map to.
    DeserializeValue {
        key: &'static str,
        source: std::io::Error,
    },
    /// A stored public key is not a valid Ed25519 point.
    InvalidPublicKey(ed25519_dalek::SignatureError),
}

impl Display for StoreError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::DeserializeValue { key, source } => {
                write!(f, "failed to deserialize the value under {}: {}", key, source)
            }
            StoreError::InvalidPublicKey(source) => {
                write!(f, "stored public key is invalid: {}", source)
            }
        }
    }
}

impl From<ed25519_dalek::SignatureError> for StoreError {
    fn from(source: ed25519_dalek::SignatureError) -> Self {
        StoreError::InvalidPublicKey(source)
    }
}
