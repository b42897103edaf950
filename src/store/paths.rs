/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Key prefixes under which each persisted variable lives. Height-indexed variables append the
//! height's big-endian bytes to the prefix.

pub(crate) const BLOCK: [u8; 1] = [0];
pub(crate) const BLOCK_META: [u8; 1] = [1];
pub(crate) const BLOCK_COMMIT: [u8; 1] = [2];
pub(crate) const SEEN_COMMIT: [u8; 1] = [3];
pub(crate) const BLOCK_STORE_STATE: [u8; 1] = [4];

pub(crate) const STATE: [u8; 1] = [5];
pub(crate) const VALIDATORS: [u8; 1] = [6];
pub(crate) const EXECUTION_RESULTS: [u8; 1] = [7];
