/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Persistent storage: the key-value store contract the user provides, and the block and state
//! stores layered on top of it.
//!
//! The crate does not bundle a storage engine. Users implement [`KVStore`] over their engine of
//! choice; the engine must apply a [`WriteBatch`] atomically.

pub mod kv_store;

pub(crate) mod paths;

pub mod block_store;

pub mod state_store;

pub use block_store::{BlockMeta, BlockStore, BlockStoreState};
pub use kv_store::{KVGet, KVStore, StoreError, WriteBatch};
pub use state_store::StateStore;
