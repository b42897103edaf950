/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! User-defined parameters of the consensus engine.
//!
//! The timeouts come in (base, delta) pairs: the timeout for round `r` is `base + delta * r`, so
//! the longer the validators fail to decide, the more time they give each other. Every validator
//! in a chain should run with the same timeouts; differing timeouts do not threaten safety, but
//! they make liveness depend on the slowest configuration.
//!
//! ## Log Events
//!
//! This crate logs using the [log](https://docs.rs/log/latest/log/) crate. To get these messages
//! printed onto a terminal or to a file, set up a [logging
//! implementation](https://docs.rs/log/latest/log/#available-logging-implementations).

use std::time::Duration;

use typed_builder::TypedBuilder;

use crate::types::basic::Round;

#[derive(Clone, TypedBuilder)]
#[builder(builder_method(doc = "
    Create a builder for building a [Configuration]. On the builder call the following methods to construct a valid [Configuration].

    Required:
    - `.timeout_propose(...)`
    - `.timeout_propose_delta(...)`
    - `.timeout_prevote(...)`
    - `.timeout_prevote_delta(...)`
    - `.timeout_precommit(...)`
    - `.timeout_precommit_delta(...)`
    - `.timeout_commit(...)`
    - `.skip_timeout_commit(...)`
    - `.block_part_size(...)`
    - `.log_events(...)`
"))]
pub struct Configuration {
    #[builder(setter(doc = "Set how long to wait for a proposal in round 0 before prevoting nil. Required."))]
    pub timeout_propose: Duration,
    #[builder(setter(doc = "Set how much longer to wait for a proposal with each further round. Required."))]
    pub timeout_propose_delta: Duration,
    #[builder(setter(doc = "Set how long to wait for straggler prevotes after +2/3 prevotes arrived, in round 0. Required."))]
    pub timeout_prevote: Duration,
    #[builder(setter(doc = "Set how much longer to wait for straggler prevotes with each further round. Required."))]
    pub timeout_prevote_delta: Duration,
    #[builder(setter(doc = "Set how long to wait for straggler precommits after +2/3 precommits arrived, in round 0. Required."))]
    pub timeout_precommit: Duration,
    #[builder(setter(doc = "Set how much longer to wait for straggler precommits with each further round. Required."))]
    pub timeout_precommit_delta: Duration,
    #[builder(setter(doc = "Set how long to linger on a committed height collecting precommits before starting the next one. Required."))]
    pub timeout_commit: Duration,
    #[builder(setter(doc = "Set whether to start the next height as soon as every precommit of the committed round arrived, instead of always waiting out the commit timeout. Required."))]
    pub skip_timeout_commit: bool,
    #[builder(setter(doc = "Set the size in bytes of the parts a proposed block is split into for gossip. Required."))]
    pub block_part_size: u32,
    #[builder(setter(doc = "Enable logging? Required."))]
    pub log_events: bool,
}

impl Configuration {
    /// The default parameters: timeouts that suit a wide-area network and 64 KiB block parts.
    pub fn default_config() -> Self {
        Configuration::builder()
            .timeout_propose(Duration::from_millis(3000))
            .timeout_propose_delta(Duration::from_millis(500))
            .timeout_prevote(Duration::from_millis(1000))
            .timeout_prevote_delta(Duration::from_millis(500))
            .timeout_precommit(Duration::from_millis(1000))
            .timeout_precommit_delta(Duration::from_millis(500))
            .timeout_commit(Duration::from_millis(1000))
            .skip_timeout_commit(false)
            .block_part_size(65536)
            .log_events(true)
            .build()
    }

    /// How long to wait for a complete proposal in `round`.
    pub fn propose_timeout(&self, round: Round) -> Duration {
        scale(self.timeout_propose, self.timeout_propose_delta, round)
    }

    /// How long to wait for straggler prevotes in `round`.
    pub fn prevote_timeout(&self, round: Round) -> Duration {
        scale(self.timeout_prevote, self.timeout_prevote_delta, round)
    }

    /// How long to wait for straggler precommits in `round`.
    pub fn precommit_timeout(&self, round: Round) -> Duration {
        scale(self.timeout_precommit, self.timeout_precommit_delta, round)
    }
}

fn scale(base: Duration, delta: Duration, round: Round) -> Duration {
    base + delta * round.int().max(0) as u32
}
