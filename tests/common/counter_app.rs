//! [`CounterApp`], a simple implementation of [`App`] used in the integration tests.

use std::sync::{Arc, Mutex};

use borsh::{BorshDeserialize, BorshSerialize};
use ed25519_dalek::VerifyingKey;
use tenderbft::{
    app::{
        App, BeginBlockRequest, BeginBlockResponse, CommitResponse, DeliverTxRequest,
        DeliverTxResponse, EndBlockRequest, EndBlockResponse, InfoRequest, InfoResponse,
        InitChainRequest, InitChainResponse, PrepareProposalRequest, PrepareProposalResponse,
    },
    types::basic::{Height, Power, Transaction},
    types::validators::ValidatorUpdate,
};

/// Transactions that [`CounterApp`] executes.
#[derive(Clone, BorshDeserialize, BorshSerialize)]
pub(crate) enum CounterTransaction {
    /// Increase the number in the app state by 1.
    Increment,

    /// Add a new validator with the given verifying key and power, change an existing
    /// validator's power, or (with power 0) remove it.
    SetValidator([u8; 32], u64),
}

impl CounterTransaction {
    pub(crate) fn to_transaction(&self) -> Transaction {
        Transaction::new(self.try_to_vec().unwrap())
    }
}

/// A minimal replicated application: its whole state is one `u64`, incremented by
/// [`CounterTransaction::Increment`] transactions, and its `app_hash` is that number's
/// little-endian bytes.
///
/// The app pops transactions to propose from `tx_queue` and publishes the number as of the last
/// committed block into `committed`, so tests can submit work and observe progress from outside
/// the node's threads.
pub(crate) struct CounterApp {
    tx_queue: Arc<Mutex<Vec<CounterTransaction>>>,
    committed: Arc<Mutex<u64>>,
    working: u64,
    committed_height: Height,
    working_height: Height,
    pending_updates: Vec<ValidatorUpdate>,
}

impl CounterApp {
    pub(crate) fn new(
        tx_queue: Arc<Mutex<Vec<CounterTransaction>>>,
        committed: Arc<Mutex<u64>>,
    ) -> CounterApp {
        CounterApp {
            tx_queue,
            committed,
            working: 0,
            committed_height: Height::new(0),
            working_height: Height::new(0),
            pending_updates: Vec::new(),
        }
    }

    /// The app hash that corresponds to a committed number.
    pub(crate) fn app_hash_of(number: u64) -> Vec<u8> {
        number.to_le_bytes().to_vec()
    }
}

impl App for CounterApp {
    fn info(&mut self, _: InfoRequest) -> InfoResponse {
        InfoResponse {
            app_version: 0,
            last_block_height: self.committed_height,
            last_block_app_hash: Self::app_hash_of(*self.committed.lock().unwrap()),
        }
    }

    fn init_chain(&mut self, _: InitChainRequest) -> InitChainResponse {
        InitChainResponse {
            consensus_params: None,
            validators: Vec::new(),
            app_hash: Self::app_hash_of(0),
        }
    }

    fn prepare_proposal(&mut self, _: PrepareProposalRequest) -> PrepareProposalResponse {
        let mut tx_queue = self.tx_queue.lock().unwrap();
        let transactions = tx_queue
            .iter()
            .map(CounterTransaction::to_transaction)
            .collect();
        tx_queue.clear();
        PrepareProposalResponse { transactions }
    }

    fn begin_block(&mut self, request: BeginBlockRequest) -> BeginBlockResponse {
        self.working_height = request.header.height;
        self.pending_updates.clear();
        BeginBlockResponse {}
    }

    fn deliver_tx(&mut self, request: DeliverTxRequest) -> DeliverTxResponse {
        match CounterTransaction::deserialize(&mut request.tx.bytes().as_slice()) {
            Ok(CounterTransaction::Increment) => {
                self.working += 1;
                DeliverTxResponse {
                    code: 0,
                    data: self.working.to_le_bytes().to_vec(),
                    log: String::new(),
                }
            }
            Ok(CounterTransaction::SetValidator(pub_key_bytes, power)) => {
                match VerifyingKey::from_bytes(&pub_key_bytes) {
                    Ok(pub_key) => {
                        self.pending_updates.push(ValidatorUpdate {
                            pub_key,
                            power: Power::new(power),
                        });
                        DeliverTxResponse {
                            code: 0,
                            data: Vec::new(),
                            log: String::new(),
                        }
                    }
                    Err(_) => DeliverTxResponse {
                        code: 1,
                        data: Vec::new(),
                        log: "invalid validator public key".to_string(),
                    },
                }
            }
            Err(_) => DeliverTxResponse {
                code: 1,
                data: Vec::new(),
                log: "undecodable transaction".to_string(),
            },
        }
    }

    fn end_block(&mut self, _: EndBlockRequest) -> EndBlockResponse {
        EndBlockResponse {
            validator_updates: std::mem::take(&mut self.pending_updates),
            consensus_param_updates: None,
        }
    }

    fn commit(&mut self) -> CommitResponse {
        self.committed_height = self.working_height;
        *self.committed.lock().unwrap() = self.working;
        CommitResponse {
            app_hash: Self::app_hash_of(self.working),
            retain_height: Height::new(0),
        }
    }
}
