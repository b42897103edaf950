//! Tests of the file-backed private validator's double-sign protection.

mod common;

use tenderbft::{
    privval::{FilePv, SignStep, SignerError},
    types::basic::{ChainId, CryptoHash, Height, Round, Timestamp},
    types::block::{BlockId, PartSetHeader},
    types::proposal::Proposal,
    types::vote::{Vote, VoteType},
};

use common::node::temp_dir;

fn chain_id() -> ChainId {
    ChainId::new("signer-test-chain")
}

fn block_id(tag: u8) -> BlockId {
    BlockId::new(
        CryptoHash::new([tag; 32]),
        PartSetHeader {
            total: 1,
            hash: CryptoHash::new([tag; 32]),
        },
    )
}

fn prevote(signer: &FilePv, height: u64, round: i32, block_id: BlockId, millis: i64) -> Vote {
    Vote::new_unsigned(
        VoteType::Prevote,
        Height::new(height),
        Round::new(round),
        block_id,
        Timestamp::new(millis),
        signer.address(),
        0,
    )
}

fn generate_in_temp_dir() -> (FilePv, std::path::PathBuf) {
    let dir = temp_dir();
    let signer = FilePv::generate(&dir.join("priv_key"), &dir.join("last_sign_state")).unwrap();
    (signer, dir)
}

#[test]
fn re_signing_the_identical_vote_returns_the_same_signature() {
    let (mut signer, _dir) = generate_in_temp_dir();

    let mut vote = prevote(&signer, 1, 0, block_id(1), 1000);
    signer.sign_vote(&chain_id(), &mut vote).unwrap();
    let first_signature = vote.signature;

    let mut again = prevote(&signer, 1, 0, block_id(1), 1000);
    signer.sign_vote(&chain_id(), &mut again).unwrap();
    assert_eq!(again.signature, first_signature);
}

#[test]
fn votes_differing_only_in_time_reuse_the_previous_signature_and_time() {
    let (mut signer, _dir) = generate_in_temp_dir();

    let mut vote = prevote(&signer, 1, 0, block_id(1), 1000);
    signer.sign_vote(&chain_id(), &mut vote).unwrap();

    let mut later = prevote(&signer, 1, 0, block_id(1), 2000);
    signer.sign_vote(&chain_id(), &mut later).unwrap();

    // The vote is rewound to the already-signed content, so the signature still verifies.
    assert_eq!(later.timestamp, Timestamp::new(1000));
    assert_eq!(later.signature, vote.signature);
    assert!(later.verify_signature(&chain_id(), &signer.pub_key()));
}

#[test]
fn conflicting_votes_at_the_same_point_are_refused() {
    let (mut signer, _dir) = generate_in_temp_dir();

    let mut vote = prevote(&signer, 1, 0, block_id(1), 1000);
    signer.sign_vote(&chain_id(), &mut vote).unwrap();

    let mut conflicting = prevote(&signer, 1, 0, block_id(2), 1000);
    assert!(matches!(
        signer.sign_vote(&chain_id(), &mut conflicting),
        Err(SignerError::DoubleSign {
            step: SignStep::Prevote,
            ..
        })
    ));

    // A vote for the next round is fine.
    let mut next_round = prevote(&signer, 1, 1, block_id(2), 1000);
    signer.sign_vote(&chain_id(), &mut next_round).unwrap();
}

#[test]
fn protection_survives_a_restart() {
    let dir = temp_dir();
    let key_path = dir.join("priv_key");
    let state_path = dir.join("last_sign_state");

    let mut signer = FilePv::generate(&key_path, &state_path).unwrap();
    let mut vote = prevote(&signer, 5, 2, block_id(1), 1000);
    signer.sign_vote(&chain_id(), &mut vote).unwrap();
    drop(signer);

    let mut reloaded = FilePv::load(&key_path, &state_path).unwrap();

    // Conflicting content at the recorded point is still refused.
    let mut conflicting = prevote(&reloaded, 5, 2, block_id(2), 1000);
    assert!(matches!(
        reloaded.sign_vote(&chain_id(), &mut conflicting),
        Err(SignerError::DoubleSign { .. })
    ));

    // So is anything before it.
    let mut earlier = prevote(&reloaded, 4, 0, block_id(2), 1000);
    assert!(matches!(
        reloaded.sign_vote(&chain_id(), &mut earlier),
        Err(SignerError::Regression { .. })
    ));

    // The identical vote is re-signed with the identical signature.
    let mut again = prevote(&reloaded, 5, 2, block_id(1), 1000);
    reloaded.sign_vote(&chain_id(), &mut again).unwrap();
    assert_eq!(again.signature, vote.signature);
}

#[test]
fn the_steps_of_a_round_must_be_signed_in_order() {
    let (mut signer, _dir) = generate_in_temp_dir();

    let mut proposal = Proposal::new_unsigned(
        Height::new(1),
        Round::new(0),
        Round::NONE,
        block_id(1),
        Timestamp::new(1000),
    );
    signer.sign_proposal(&chain_id(), &mut proposal).unwrap();

    // Propose then prevote within the same round is in order.
    let mut vote = prevote(&signer, 1, 0, block_id(1), 1000);
    signer.sign_vote(&chain_id(), &mut vote).unwrap();

    // A proposal after the prevote regresses.
    let mut late_proposal = Proposal::new_unsigned(
        Height::new(1),
        Round::new(0),
        Round::NONE,
        block_id(2),
        Timestamp::new(1000),
    );
    assert!(matches!(
        signer.sign_proposal(&chain_id(), &mut late_proposal),
        Err(SignerError::Regression { .. })
    ));
}

#[test]
fn sign_bytes_lead_with_the_message_kind() {
    let (signer, _dir) = generate_in_temp_dir();

    // A proposal and the two vote kinds over the same height, round, block, and time must
    // produce sign-bytes in disjoint domains, so a signature over one can never be replayed as
    // another. The leading byte is the domain tag.
    let proposal = Proposal::new_unsigned(
        Height::new(1),
        Round::new(0),
        Round::NONE,
        block_id(1),
        Timestamp::new(1000),
    );
    let prevote = prevote(&signer, 1, 0, block_id(1), 1000);
    let mut precommit = prevote.clone();
    precommit.vote_type = VoteType::Precommit;

    let proposal_bytes = proposal.sign_bytes(&chain_id());
    let prevote_bytes = prevote.sign_bytes(&chain_id());
    let precommit_bytes = precommit.sign_bytes(&chain_id());

    assert_ne!(proposal_bytes[0], prevote_bytes[0]);
    assert_ne!(proposal_bytes[0], precommit_bytes[0]);
    assert_ne!(prevote_bytes[0], precommit_bytes[0]);
}
