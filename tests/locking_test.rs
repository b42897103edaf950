//! Tests of the lock rules, driving a single node with scripted peer votes: a polka locks the
//! node on a block, the lock holds into the next round, and only a newer polka for a different
//! block releases it.

mod common;

use std::{
    sync::{
        mpsc::{self, Receiver},
        Arc, Mutex,
    },
    thread,
    time::{Duration, Instant},
};

use log::LevelFilter;

use tenderbft::{
    messages::{ConsensusMessage, Message},
    node::{Node, NodeSpec},
    privval::FilePv,
    types::basic::{ChainId, CryptoHash, Height, PeerId, Round, Timestamp},
    types::block::{BlockId, PartSetHeader},
    types::vote::{Vote, VoteType},
};

use common::counter_app::CounterApp;
use common::logging::setup_logger;
use common::mem_db::MemDB;
use common::node::{generate_signers, genesis_doc, test_configuration};

/// Poll until `condition` holds, panicking with `what` if it does not within `timeout`.
fn wait_until(timeout: Duration, what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + timeout;
    while !condition() {
        if Instant::now() > deadline {
            panic!("timed out waiting until: {}", what);
        }
        thread::sleep(Duration::from_millis(50));
    }
}

/// Receive outbound messages until `extract` matches one, skipping everything else.
fn wait_for<T>(
    outbound: &Receiver<(Option<PeerId>, Message)>,
    what: &str,
    mut extract: impl FnMut(&ConsensusMessage) -> Option<T>,
) -> T {
    let deadline = Instant::now() + Duration::from_secs(30);
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let (_, message) = outbound
            .recv_timeout(remaining)
            .unwrap_or_else(|_| panic!("timed out waiting for: {}", what));
        if let Message::Consensus(message) = message {
            if let Some(extracted) = extract(&message) {
                return extracted;
            }
        }
    }
}

/// Sign a vote as the peer validator at `index` and feed it into the node.
fn deliver_vote(
    node: &Node,
    signer: &mut FilePv,
    chain_id: &ChainId,
    index: u32,
    vote_type: VoteType,
    round: i32,
    block_id: BlockId,
) {
    let mut vote = Vote::new_unsigned(
        vote_type,
        Height::new(1),
        Round::new(round),
        block_id,
        Timestamp::now(),
        signer.address(),
        index,
    );
    signer.sign_vote(chain_id, &mut vote).unwrap();
    assert!(node.handle_message(
        Message::Consensus(ConsensusMessage::Vote(vote)),
        PeerId::new([index as u8; 32]),
    ));
}

#[test]
fn a_polka_locks_and_only_a_newer_polka_for_another_block_unlocks() {
    setup_logger(LevelFilter::Warn);

    // Four equal-power validators: the node under test plus three scripted peers, so the quorum
    // is 3. The node gets the lowest address, which makes it the proposer of rounds 0 and 1
    // (equal powers tie in the rotation, and ties go to the lowest address).
    let mut signers = generate_signers(4);
    signers.sort_by_key(|signer| signer.address());
    let genesis = genesis_doc(&signers);
    let chain_id = genesis.chain_id.clone();
    let node_signer = signers.remove(0);
    // `signers[i]` is now the validator at index `i + 1`.
    let mut peers = signers;

    let locks: Arc<Mutex<Vec<(i32, BlockId)>>> = Arc::new(Mutex::new(Vec::new()));
    let unlocks: Arc<Mutex<Vec<i32>>> = Arc::new(Mutex::new(Vec::new()));
    let (outbound_sender, outbound) = mpsc::channel();

    let locks_sink = Arc::clone(&locks);
    let unlocks_sink = Arc::clone(&unlocks);
    let node = NodeSpec::builder()
        .app(CounterApp::new(
            Arc::new(Mutex::new(Vec::new())),
            Arc::new(Mutex::new(0)),
        ))
        .kv_store(MemDB::new())
        .genesis(genesis)
        .configuration(test_configuration())
        .outbound(outbound_sender)
        .private_validator(node_signer)
        .on_lock(move |event| {
            locks_sink
                .lock()
                .unwrap()
                .push((event.round.int(), event.block_id.clone()))
        })
        .on_unlock(move |event| unlocks_sink.lock().unwrap().push(event.round.int()))
        .build()
        .start()
        .unwrap();

    // The node proposes some block A for round 0.
    let block_a = wait_for(&outbound, "the round 0 proposal", |message| match message {
        ConsensusMessage::Proposal(proposal) if proposal.round == Round::new(0) => {
            Some(proposal.block_id.clone())
        }
        _ => None,
    });

    // Two peer prevotes for A complete a polka (the node's own prevote is the third), so the
    // node locks on A.
    for (offset, peer) in peers.iter_mut().take(2).enumerate() {
        deliver_vote(
            &node,
            peer,
            &chain_id,
            offset as u32 + 1,
            VoteType::Prevote,
            0,
            block_a.clone(),
        );
    }
    wait_until(Duration::from_secs(30), "the node locks on block A", || {
        locks.lock().unwrap().contains(&(0, block_a.clone()))
    });

    // The same two peers precommit nil: +2/3 precommitted but nothing has a majority, so the
    // round fails and the node moves to round 1.
    for (offset, peer) in peers.iter_mut().take(2).enumerate() {
        deliver_vote(
            &node,
            peer,
            &chain_id,
            offset as u32 + 1,
            VoteType::Precommit,
            0,
            BlockId::zero(),
        );
    }

    // The lock must survive into round 1: the node prevotes A again.
    let round_1_prevote = wait_for(&outbound, "the node's round 1 prevote", |message| {
        match message {
            ConsensusMessage::Vote(vote)
                if vote.vote_type == VoteType::Prevote && vote.round == Round::new(1) =>
            {
                Some(vote.block_id.clone())
            }
            _ => None,
        }
    });
    assert_eq!(round_1_prevote, block_a);
    assert!(unlocks.lock().unwrap().is_empty());

    // All three peers prevote some other block B in round 1. That is a newer polka for a
    // different block, the one thing that releases the lock.
    let block_b = BlockId::new(
        CryptoHash::new([7u8; 32]),
        PartSetHeader {
            total: 1,
            hash: CryptoHash::new([7u8; 32]),
        },
    );
    for (offset, peer) in peers.iter_mut().enumerate() {
        deliver_vote(
            &node,
            peer,
            &chain_id,
            offset as u32 + 1,
            VoteType::Prevote,
            1,
            block_b.clone(),
        );
    }
    wait_until(Duration::from_secs(30), "the node releases its lock", || {
        !unlocks.lock().unwrap().is_empty()
    });

    // Unlocked but without block B's contents, the node precommits nil in round 1.
    let round_1_precommit = wait_for(&outbound, "the node's round 1 precommit", |message| {
        match message {
            ConsensusMessage::Vote(vote)
                if vote.vote_type == VoteType::Precommit && vote.round == Round::new(1) =>
            {
                Some(vote.block_id.clone())
            }
            _ => None,
        }
    });
    assert!(round_1_precommit.is_zero());

    drop(node);
}
