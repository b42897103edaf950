/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Data types shared by the consensus engine and the structures it persists and gossips.

pub mod basic;

pub mod bit_vector;

pub mod block;

pub mod part_set;

pub mod proposal;

pub mod validators;

pub mod vote;
