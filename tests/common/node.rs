//! Helpers for building fully-wired test nodes.
//!
//! Every node in a test network shares the same genesis document and configuration, and differs
//! in its signing key, its app instance, and its key-value store.

use std::{
    fs,
    path::PathBuf,
    process,
    sync::{
        atomic::{AtomicU64, Ordering},
        mpsc::{self, Receiver},
        Arc, Mutex,
    },
    time::Duration,
};

use tenderbft::{
    config::Configuration,
    genesis::{GenesisDoc, GenesisValidator},
    messages::Message,
    node::{Node, NodeSpec},
    privval::FilePv,
    state::ConsensusParams,
    types::basic::{ChainId, Height, PeerId, Power, Timestamp},
};

use crate::common::{
    counter_app::{CounterApp, CounterTransaction},
    mem_db::MemDB,
};

static NEXT_DIR: AtomicU64 = AtomicU64::new(0);

/// A fresh directory under the system temp dir for one signer's key and state files.
pub(crate) fn temp_dir() -> PathBuf {
    let dir = std::env::temp_dir().join(format!(
        "tenderbft_test_{}_{}",
        process::id(),
        NEXT_DIR.fetch_add(1, Ordering::Relaxed)
    ));
    fs::create_dir_all(&dir).unwrap();
    dir
}

/// Generate `n` private validators, each in its own temp directory.
pub(crate) fn generate_signers(n: usize) -> Vec<FilePv> {
    (0..n)
        .map(|_| {
            let dir = temp_dir();
            FilePv::generate(&dir.join("priv_key"), &dir.join("last_sign_state")).unwrap()
        })
        .collect()
}

/// A genesis document listing `signers` as the initial validators, with power 1 each.
pub(crate) fn genesis_doc(signers: &[FilePv]) -> GenesisDoc {
    GenesisDoc {
        genesis_time: Timestamp::now(),
        chain_id: ChainId::new("counter-chain"),
        initial_height: Height::new(1),
        consensus_params: ConsensusParams::default_params(),
        validators: signers
            .iter()
            .enumerate()
            .map(|(i, signer)| GenesisValidator {
                pub_key: signer.pub_key(),
                power: Power::new(1),
                name: format!("validator-{}", i),
            })
            .collect(),
        app_hash: CounterApp::app_hash_of(0),
        app_state: Vec::new(),
    }
}

/// Timeouts short enough that a test network decides heights in well under a second.
pub(crate) fn test_configuration() -> Configuration {
    Configuration::builder()
        .timeout_propose(Duration::from_millis(400))
        .timeout_propose_delta(Duration::from_millis(200))
        .timeout_prevote(Duration::from_millis(200))
        .timeout_prevote_delta(Duration::from_millis(200))
        .timeout_precommit(Duration::from_millis(200))
        .timeout_precommit_delta(Duration::from_millis(200))
        .timeout_commit(Duration::from_millis(100))
        .skip_timeout_commit(true)
        .block_part_size(4096)
        .log_events(false)
        .build()
}

/// The observable side of one test node. The node's own threads write into the shared cells;
/// the test polls them.
pub(crate) struct NodeHandle {
    pub(crate) peer_id: PeerId,
    pub(crate) tx_queue: Arc<Mutex<Vec<CounterTransaction>>>,
    pub(crate) committed_number: Arc<Mutex<u64>>,
    pub(crate) committed_heights: Arc<Mutex<Vec<u64>>>,
    pub(crate) validator_set_changes: Arc<Mutex<Vec<u64>>>,
}

impl NodeHandle {
    pub(crate) fn submit_transaction(&self, transaction: CounterTransaction) {
        self.tx_queue.lock().unwrap().push(transaction);
    }

    pub(crate) fn number(&self) -> u64 {
        *self.committed_number.lock().unwrap()
    }

    pub(crate) fn highest_committed_height(&self) -> u64 {
        self.committed_heights
            .lock()
            .unwrap()
            .last()
            .copied()
            .unwrap_or(0)
    }

    pub(crate) fn validator_set_changed(&self) -> bool {
        !self.validator_set_changes.lock().unwrap().is_empty()
    }
}

/// Start a node that signs with `signer`, and return its handle, the running [`Node`], and the
/// receiving end of its outbound channel.
pub(crate) fn start_node(
    signer: FilePv,
    genesis: GenesisDoc,
    configuration: Configuration,
) -> (NodeHandle, Node, Receiver<(Option<PeerId>, Message)>) {
    let peer_id = PeerId::new(signer.pub_key().to_bytes());
    let tx_queue = Arc::new(Mutex::new(Vec::new()));
    let committed_number = Arc::new(Mutex::new(0));
    let committed_heights: Arc<Mutex<Vec<u64>>> = Arc::new(Mutex::new(Vec::new()));
    let validator_set_changes: Arc<Mutex<Vec<u64>>> = Arc::new(Mutex::new(Vec::new()));

    let (outbound_sender, outbound_receiver) = mpsc::channel();

    let commits = Arc::clone(&committed_heights);
    let changes = Arc::clone(&validator_set_changes);
    let node = NodeSpec::builder()
        .app(CounterApp::new(
            Arc::clone(&tx_queue),
            Arc::clone(&committed_number),
        ))
        .kv_store(MemDB::new())
        .genesis(genesis)
        .configuration(configuration)
        .outbound(outbound_sender)
        .private_validator(signer)
        .on_commit_block(move |event| commits.lock().unwrap().push(event.height.int()))
        .on_update_validator_set(move |event| changes.lock().unwrap().push(event.height.int()))
        .build()
        .start()
        .unwrap();

    let handle = NodeHandle {
        peer_id,
        tx_queue,
        committed_number,
        committed_heights,
        validator_set_changes,
    };
    (handle, node, outbound_receiver)
}
