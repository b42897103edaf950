/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Height-indexed storage of committed blocks, their metadata, and their commits.

use borsh::{BorshDeserialize, BorshSerialize};

use crate::types::basic::Height;
use crate::types::block::{Block, BlockId, Commit, Header};

use super::kv_store::{combine, KVStore, StoreError, WriteBatch};
use super::paths;

/// Summary of a stored block, loadable without decoding the block's transactions.
#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct BlockMeta {
    pub block_id: BlockId,
    pub header: Header,
    /// Size of the encoded block in bytes.
    pub size: u64,
    pub num_txs: u32,
}

/// The contiguous range of heights present in the block store. `base` rises as old blocks are
/// pruned; `height` rises as new blocks are committed. Both are 0 while the store is empty.
#[derive(Clone, Copy, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct BlockStoreState {
    pub base: Height,
    pub height: Height,
}

/// Storage of committed blocks, keyed by height.
#[derive(Clone)]
pub struct BlockStore<K: KVStore> {
    kv: K,
}

impl<K: KVStore> BlockStore<K> {
    pub fn new(kv: K) -> Self {
        Self { kv }
    }

    /// The range of heights currently stored.
    pub fn state(&self) -> Result<BlockStoreState, StoreError> {
        match self.kv.get(&paths::BLOCK_STORE_STATE) {
            Some(bytes) => BlockStoreState::deserialize(&mut bytes.as_slice()).map_err(|err| {
                StoreError::DeserializeValue {
                    key: "block store state",
                    source: err,
                }
            }),
            None => Ok(BlockStoreState {
                base: Height::new(0),
                height: Height::new(0),
            }),
        }
    }

    /// Height of the highest stored block, or 0 if the store is empty.
    pub fn height(&self) -> Result<Height, StoreError> {
        Ok(self.state()?.height)
    }

    /// Height of the lowest stored block, or 0 if the store is empty.
    pub fn base(&self) -> Result<Height, StoreError> {
        Ok(self.state()?.base)
    }

    /// Store a committed block together with the +2/3 precommits this replica saw for it.
    ///
    /// The block's own `last_commit` is also indexed as the canonical commit *for* the previous
    /// height; `seen_commit` is the provisional commit for `block` itself, replaced once the next
    /// block embeds its canonical form.
    pub fn save_block(
        &mut self,
        block: &Block,
        block_id: &BlockId,
        seen_commit: &Commit,
    ) -> Result<(), StoreError> {
        let height = block.header.height;
        let block_bytes = block.try_to_vec().unwrap();
        let meta = BlockMeta {
            block_id: block_id.clone(),
            header: block.header.clone(),
            size: block_bytes.len() as u64,
            num_txs: block.data.len() as u32,
        };

        let mut state = self.state()?;
        state.height = height;
        if state.base.int() == 0 {
            state.base = height;
        }

        let mut wb = K::WriteBatch::new();
        wb.set(&height_key(&paths::BLOCK, height), &block_bytes);
        wb.set(
            &height_key(&paths::BLOCK_META, height),
            &meta.try_to_vec().unwrap(),
        );
        wb.set(
            &height_key(&paths::SEEN_COMMIT, height),
            &seen_commit.try_to_vec().unwrap(),
        );
        if !block.last_commit.is_empty() {
            wb.set(
                &height_key(&paths::BLOCK_COMMIT, block.last_commit.height),
                &block.last_commit.try_to_vec().unwrap(),
            );
        }
        wb.set(&paths::BLOCK_STORE_STATE, &state.try_to_vec().unwrap());
        self.kv.write(wb);
        Ok(())
    }

    pub fn load_block(&self, height: Height) -> Result<Option<Block>, StoreError> {
        load_at_height(&self.kv, &paths::BLOCK, height, "block")
    }

    pub fn load_block_meta(&self, height: Height) -> Result<Option<BlockMeta>, StoreError> {
        load_at_height(&self.kv, &paths::BLOCK_META, height, "block meta")
    }

    /// The canonical commit for the block at `height`, taken from the `last_commit` of the block
    /// at `height + 1`. Absent for the highest stored block.
    pub fn load_block_commit(&self, height: Height) -> Result<Option<Commit>, StoreError> {
        load_at_height(&self.kv, &paths::BLOCK_COMMIT, height, "block commit")
    }

    /// The +2/3 precommits this replica itself collected for the block at `height`.
    pub fn load_seen_commit(&self, height: Height) -> Result<Option<Commit>, StoreError> {
        load_at_height(&self.kv, &paths::SEEN_COMMIT, height, "seen commit")
    }

    /// Delete every block below `retain_height` and raise the store's base to it. Returns the
    /// number of blocks pruned.
    pub fn prune_blocks(&mut self, retain_height: Height) -> Result<u64, StoreError> {
        let mut state = self.state()?;
        if retain_height <= state.base || state.height.int() == 0 {
            return Ok(0);
        }
        let stop = retain_height.min(state.height);
        let mut pruned = 0;
        let mut wb = K::WriteBatch::new();
        let mut height = state.base;
        while height < stop {
            wb.delete(&height_key(&paths::BLOCK, height));
            wb.delete(&height_key(&paths::BLOCK_META, height));
            wb.delete(&height_key(&paths::BLOCK_COMMIT, height));
            wb.delete(&height_key(&paths::SEEN_COMMIT, height));
            pruned += 1;
            height += 1;
        }
        state.base = stop;
        wb.set(&paths::BLOCK_STORE_STATE, &state.try_to_vec().unwrap());
        self.kv.write(wb);
        Ok(pruned)
    }
}

pub(crate) fn height_key(prefix: &[u8], height: Height) -> Vec<u8> {
    combine(prefix, &height.int().to_be_bytes())
}

pub(crate) fn load_at_height<K: KVStore, T: BorshDeserialize>(
    kv: &K,
    prefix: &[u8],
    height: Height,
    key_name: &'static str,
) -> Result<Option<T>, StoreError> {
    match kv.get(&height_key(prefix, height)) {
        Some(bytes) => T::deserialize(&mut bytes.as_slice())
            .map(Some)
            .map_err(|err| StoreError::DeserializeValue {
                key: key_name,
                source: err,
            }),
        None => Ok(None),
    }
}
