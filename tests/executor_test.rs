//! Tests that drive the block executor directly, without running a consensus engine.

mod common;

use std::sync::{Arc, Mutex};

use log::LevelFilter;

use tenderbft::{
    consensus::vote_set::VoteSet,
    executor::{BlockExecutor, ExecutionError},
    genesis::GenesisDoc,
    privval::FilePv,
    state::State,
    store::{BlockStore, StateStore},
    types::basic::{Address, Height, Round, Timestamp},
    types::block::{Block, BlockId, Commit},
    types::part_set::PartSet,
    types::vote::{Vote, VoteType},
};

use common::counter_app::{CounterApp, CounterTransaction};
use common::logging::setup_logger;
use common::mem_db::MemDB;
use common::node::{generate_signers, genesis_doc};

struct Fixture {
    executor: BlockExecutor<MemDB, CounterApp>,
    state: State,
    genesis: GenesisDoc,
    signers: Vec<FilePv>,
    tx_queue: Arc<Mutex<Vec<CounterTransaction>>>,
    committed: Arc<Mutex<u64>>,
    kv_store: MemDB,
}

fn fixture(num_validators: usize) -> Fixture {
    setup_logger(LevelFilter::Warn);

    let signers = generate_signers(num_validators);
    let mut genesis = genesis_doc(&signers);
    genesis.validate_and_complete().unwrap();
    let state = State::from_genesis(&genesis);

    let kv_store = MemDB::new();
    let tx_queue = Arc::new(Mutex::new(Vec::new()));
    let committed = Arc::new(Mutex::new(0));
    let executor = BlockExecutor::new(
        CounterApp::new(Arc::clone(&tx_queue), Arc::clone(&committed)),
        BlockStore::new(kv_store.clone()),
        StateStore::new(kv_store.clone()),
    );
    Fixture {
        executor,
        state,
        genesis,
        signers,
        tx_queue,
        committed,
        kv_store,
    }
}

fn proposer_of(state: &State) -> Address {
    state.validators.current_proposer().unwrap().address
}

fn id_of(block: &Block) -> BlockId {
    let parts = PartSet::from_block(block, 4096);
    BlockId::new(block.hash(), *parts.header())
}

/// A +2/3 commit of `block_id`, signed by the first signer (tests using this run with one
/// genesis validator, so one precommit is a quorum).
fn commit_for(fixture: &mut Fixture, height: Height, block_id: &BlockId, state: &State) -> Commit {
    let signer = &mut fixture.signers[0];
    let mut vote = Vote::new_unsigned(
        VoteType::Precommit,
        height,
        Round::new(0),
        block_id.clone(),
        Timestamp::now(),
        signer.address(),
        0,
    );
    signer.sign_vote(&fixture.genesis.chain_id, &mut vote).unwrap();

    let mut vote_set = VoteSet::new(
        fixture.genesis.chain_id.clone(),
        height,
        Round::new(0),
        VoteType::Precommit,
        Arc::new(state.validators.clone()),
    );
    vote_set.add_vote(vote).unwrap();
    vote_set.make_commit().unwrap()
}

#[test]
fn applying_a_block_advances_the_state_and_the_app() {
    let mut fixture = fixture(1);
    fixture.tx_queue.lock().unwrap().extend([
        CounterTransaction::Increment,
        CounterTransaction::Increment,
    ]);

    let height = fixture.state.next_height();
    let proposer = proposer_of(&fixture.state);
    let block = fixture
        .executor
        .create_proposal_block(height, &fixture.state, Commit::empty(), proposer);
    assert_eq!(block.data.len(), 2);
    let block_id = id_of(&block);

    let new_state = fixture
        .executor
        .apply_block(&fixture.state, &block_id, &block)
        .unwrap();

    assert_eq!(new_state.last_block_height, Height::new(1));
    assert_eq!(new_state.last_block_id, block_id);
    assert_eq!(new_state.app_hash, CounterApp::app_hash_of(2));
    assert_eq!(*fixture.committed.lock().unwrap(), 2);
    assert_ne!(new_state.last_results_hash, fixture.state.last_results_hash);
}

#[test]
fn validator_updates_take_effect_with_a_one_block_delay() {
    let mut fixture = fixture(1);
    let newcomer = generate_signers(1).remove(0);
    fixture
        .tx_queue
        .lock()
        .unwrap()
        .push(CounterTransaction::SetValidator(
            newcomer.pub_key().to_bytes(),
            1,
        ));

    // Block 1 carries the update.
    let state0 = fixture.state.clone();
    let block1 = fixture.executor.create_proposal_block(
        Height::new(1),
        &state0,
        Commit::empty(),
        proposer_of(&state0),
    );
    let block1_id = id_of(&block1);
    let state1 = fixture
        .executor
        .apply_block(&state0, &block1_id, &block1)
        .unwrap();

    // The update lands in next_validators only; the active set at height 2 is unchanged.
    assert_eq!(state1.validators.len(), 1);
    assert_eq!(state1.next_validators.len(), 2);
    assert_eq!(state1.last_height_validators_changed, Height::new(3));

    // Block 2 activates it.
    let commit1 = commit_for(&mut fixture, Height::new(1), &block1_id, &state0);
    let block2 = fixture.executor.create_proposal_block(
        Height::new(2),
        &state1,
        commit1,
        proposer_of(&state1),
    );
    let block2_id = id_of(&block2);
    let state2 = fixture
        .executor
        .apply_block(&state1, &block2_id, &block2)
        .unwrap();

    assert_eq!(state2.validators.len(), 2);
    assert_eq!(state2.last_validators.len(), 1);
    assert_eq!(state2.last_height_validators_changed, Height::new(3));
}

#[test]
fn blocks_that_do_not_extend_the_state_are_rejected() {
    let mut fixture = fixture(1);

    let proposer = proposer_of(&fixture.state);
    let good = fixture.executor.create_proposal_block(
        Height::new(1),
        &fixture.state,
        Commit::empty(),
        proposer,
    );

    // Wrong height.
    let mut wrong_height = good.clone();
    wrong_height.header.height = Height::new(2);
    let result = fixture
        .executor
        .apply_block(&fixture.state, &id_of(&wrong_height), &wrong_height);
    assert!(matches!(result, Err(ExecutionError::InvalidBlock(_))));

    // Wrong app hash.
    let mut wrong_app_hash = good.clone();
    wrong_app_hash.header.app_hash = CounterApp::app_hash_of(99);
    let result = fixture
        .executor
        .apply_block(&fixture.state, &id_of(&wrong_app_hash), &wrong_app_hash);
    assert!(matches!(result, Err(ExecutionError::InvalidBlock(_))));

    // A first block must carry an empty last commit.
    let mut nonempty_commit = good.clone();
    nonempty_commit.last_commit = Commit {
        height: Height::new(0),
        round: Round::new(0),
        block_id: BlockId::zero(),
        signatures: vec![tenderbft::types::block::CommitSig::absent()],
    };
    nonempty_commit.header.last_commit_hash = nonempty_commit.last_commit.hash();
    let result = fixture
        .executor
        .apply_block(&fixture.state, &id_of(&nonempty_commit), &nonempty_commit);
    assert!(matches!(result, Err(ExecutionError::InvalidBlock(_))));

    // The untampered block still applies.
    fixture
        .executor
        .apply_block(&fixture.state, &id_of(&good), &good)
        .unwrap();
}

#[test]
fn pruning_deletes_blocks_below_the_retain_height() {
    let mut fixture = fixture(1);
    let mut block_store = BlockStore::new(fixture.kv_store.clone());

    // Commit and store a chain of three blocks.
    let mut state = fixture.state.clone();
    let mut last_commit = Commit::empty();
    for height in 1..=3u64 {
        let height = Height::new(height);
        let block = fixture.executor.create_proposal_block(
            height,
            &state,
            last_commit.clone(),
            proposer_of(&state),
        );
        let block_id = id_of(&block);
        let seen_commit = commit_for(&mut fixture, height, &block_id, &state);
        block_store
            .save_block(&block, &block_id, &seen_commit)
            .unwrap();
        state = fixture
            .executor
            .apply_block(&state, &block_id, &block)
            .unwrap();
        last_commit = seen_commit;
    }
    assert_eq!(block_store.base().unwrap(), Height::new(1));
    assert_eq!(block_store.height().unwrap(), Height::new(3));

    // A retain height at or below the base prunes nothing.
    assert_eq!(block_store.prune_blocks(Height::new(1)).unwrap(), 0);
    assert_eq!(block_store.base().unwrap(), Height::new(1));

    // Retaining from height 3 deletes blocks 1 and 2 and raises the base.
    assert_eq!(block_store.prune_blocks(Height::new(3)).unwrap(), 2);
    assert_eq!(block_store.base().unwrap(), Height::new(3));
    assert!(block_store.load_block(Height::new(1)).unwrap().is_none());
    assert!(block_store
        .load_block_meta(Height::new(2))
        .unwrap()
        .is_none());
    assert!(block_store
        .load_seen_commit(Height::new(2))
        .unwrap()
        .is_none());
    assert!(block_store.load_block(Height::new(3)).unwrap().is_some());
    assert!(block_store
        .load_seen_commit(Height::new(3))
        .unwrap()
        .is_some());
}
