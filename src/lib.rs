/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! A Rust implementation of Tendermint-style Byzantine fault tolerant state machine
//! replication.
//!
//! This crate is the consensus core of a replicated state machine: it orders blocks of opaque
//! transactions among a set of validators, of which fewer than one third (by voting power) may
//! be faulty, and drives a user-provided [application](crate::app) through the committed blocks
//! in the same order on every replica.
//!
//! The crate deliberately excludes networking, transaction mempools, and storage engines. The
//! user brings:
//! - an [`App`](crate::app::App): the state machine being replicated,
//! - a [`KVStore`](crate::store::KVStore): the persistence layer,
//! - a transport: messages the node wants delivered come out of a channel, and messages
//!   received from peers go in through [`Node::handle_message`](crate::node::Node::handle_message).
//!
//! To get started, build a [`NodeSpec`](crate::node::NodeSpec) and call
//! [`start`](crate::node::NodeSpec::start) on it.

pub mod app;

pub mod config;

pub mod consensus;

pub(crate) mod event_bus;

pub mod events;

pub mod executor;

pub mod genesis;

pub(crate) mod logging;

pub mod merkle;

pub mod messages;

pub mod node;

pub mod privval;

pub mod state;

pub mod store;

pub mod types;
