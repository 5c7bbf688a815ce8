use std::sync::Arc;

use assert_matches::assert_matches;
use parity_scale_codec::Encode;
use parking_lot::Mutex;

use filament_chain::test_utils::{add_blocks, genesis_block_state, genesis_header};
use filament_chain::BlockState;
use filament_crypto::{GlobalKeystore, Keypair};
use filament_primitives::network::{PeerId, ReputationChange};
use filament_primitives::{AuthorityId, Hash, Header};
use filament_store::Store;

use super::*;

/// Network double recording every unicast commit message.
#[derive(Default)]
struct RecordingNetwork {
    commits: Mutex<Vec<(PeerId, CommitMessage)>>,
    reports: Mutex<Vec<(PeerId, ReputationChange)>>,
}

impl Network for RecordingNetwork {
    fn send_message(&self, to: &PeerId, message: CommitMessage) -> std::io::Result<()> {
        self.commits.lock().push((to.clone(), message));
        Ok(())
    }

    fn report_peer(&self, peer: &PeerId, change: ReputationChange) {
        self.reports.lock().push((peer.clone(), change));
    }
}

#[derive(Default)]
struct RecordingTelemetry {
    events: Mutex<Vec<TelemetryEvent>>,
}

impl Telemetry for RecordingTelemetry {
    fn send(&self, event: TelemetryEvent) {
        self.events.lock().push(event);
    }
}

struct TestService {
    service: Arc<GrandpaService>,
    network: Arc<RecordingNetwork>,
    telemetry: Arc<RecordingTelemetry>,
    block_state: Arc<BlockState>,
    /// Voter keypairs; index 0 is our own key.
    keypairs: Vec<Keypair>,
}

const ROUND: u64 = 5;
const SET_ID: u64 = 1;

fn keypair(index: u8) -> Keypair {
    Keypair::from_seed(&[index + 1; 32])
}

fn new_test_service() -> TestService {
    let keypairs: Vec<Keypair> = (0..3).map(keypair).collect();
    let voters: Vec<Voter> = keypairs
        .iter()
        .enumerate()
        .map(|(id, kp)| Voter { key: kp.public().into(), id: id as u64 })
        .collect();

    let keystore = GlobalKeystore::new();
    keystore.insert_key("gran", keypairs[0].clone()).unwrap();

    let block_state = genesis_block_state(Store::test_store());
    let network = Arc::new(RecordingNetwork::default());
    let telemetry = Arc::new(RecordingTelemetry::default());
    let service = GrandpaService::new(
        block_state.clone(),
        network.clone(),
        telemetry.clone(),
        &keystore,
        voters,
        ROUND,
        SET_ID,
    )
    .unwrap();

    TestService {
        service: Arc::new(service),
        network,
        telemetry,
        block_state,
        keypairs,
    }
}

fn vote_message(
    keypair: &Keypair,
    stage: Subround,
    vote: Vote,
    round: u64,
    set_id: u64,
) -> VoteMessage {
    let full_vote = FullVote { stage, vote, round, set_id };
    let signature = keypair.sign(&full_vote.encode());
    VoteMessage {
        round,
        set_id,
        message: SignedMessage {
            stage,
            block_hash: vote.hash,
            number: vote.number,
            signature: signature.0,
            authority_id: keypair.public().into(),
        },
    }
}

fn peer(name: &str) -> PeerId {
    PeerId::new(name)
}

/// Extends the chain with three blocks and returns their headers.
fn grow_chain(test: &TestService) -> Vec<Header> {
    add_blocks(&test.block_state, &genesis_header(), 3, 0xa)
}

#[test]
fn valid_prevote_is_accepted_and_stored() {
    let test = new_test_service();
    let chain = grow_chain(&test);
    let vote = Vote::from_header(&chain[2]);

    let message = vote_message(&test.keypairs[1], Subround::Prevote, vote, ROUND, SET_ID);
    let accepted =
        test.service.validate_vote_message(&peer("alice"), &message).unwrap().unwrap();

    assert_eq!(accepted, vote);
    let authority = AuthorityId::from(test.keypairs[1].public());
    assert_eq!(test.service.prevote_for(&authority).unwrap().vote, vote);
    assert_eq!(test.service.prevote_count(), 1);
}

#[test]
fn precommits_are_stored_separately() {
    let test = new_test_service();
    let chain = grow_chain(&test);
    let vote = Vote::from_header(&chain[1]);

    let message = vote_message(&test.keypairs[2], Subround::Precommit, vote, ROUND, SET_ID);
    test.service.validate_vote_message(&peer("bob"), &message).unwrap().unwrap();

    let authority = AuthorityId::from(test.keypairs[2].public());
    assert!(test.service.precommit_for(&authority).is_some());
    assert_eq!(test.service.prevote_count(), 0);
}

#[test]
fn invalid_signature_is_rejected() {
    let test = new_test_service();
    let chain = grow_chain(&test);
    let vote = Vote::from_header(&chain[0]);

    let mut message = vote_message(&test.keypairs[1], Subround::Prevote, vote, ROUND, SET_ID);
    message.message.signature[0] ^= 0xff;
    let err = test.service.validate_vote_message(&peer("alice"), &message).unwrap_err();
    assert_matches!(err, Error::InvalidSignature);
}

#[test]
fn signature_must_cover_the_claimed_round() {
    let test = new_test_service();
    let chain = grow_chain(&test);
    let vote = Vote::from_header(&chain[0]);

    // Signed for round 4 but claimed as round 5.
    let mut message = vote_message(&test.keypairs[1], Subround::Prevote, vote, ROUND - 1, SET_ID);
    message.round = ROUND;
    let err = test.service.validate_vote_message(&peer("alice"), &message).unwrap_err();
    assert_matches!(err, Error::InvalidSignature);
}

#[test]
fn set_id_mismatch_is_rejected() {
    let test = new_test_service();
    let chain = grow_chain(&test);
    let vote = Vote::from_header(&chain[0]);

    let message = vote_message(&test.keypairs[1], Subround::Prevote, vote, ROUND, SET_ID + 1);
    let err = test.service.validate_vote_message(&peer("alice"), &message).unwrap_err();
    assert_matches!(err, Error::SetIdMismatch);
}

#[test]
fn rounds_outside_the_window_are_dropped_silently() {
    let test = new_test_service();
    let chain = grow_chain(&test);
    let vote = Vote::from_header(&chain[0]);

    for round in [ROUND - 2, ROUND + 2] {
        let message = vote_message(&test.keypairs[1], Subround::Prevote, vote, round, SET_ID);
        let result = test.service.validate_vote_message(&peer("alice"), &message).unwrap();
        assert_eq!(result, None, "round {round}");
    }
    assert_eq!(test.service.prevote_count(), 0);
    assert!(test.network.commits.lock().is_empty());
}

#[test]
fn lagging_round_gets_a_commit_reply() {
    // End-to-end scenario: state {round 5, set 1}, a precommit for round 4
    // arrives; the sender is answered with a commit naming the block
    // finalised in round 4.
    let test = new_test_service();
    let chain = grow_chain(&test);
    let finalised = &chain[1];
    test.block_state.set_finalised_hash(&finalised.hash(), ROUND - 1, SET_ID).unwrap();

    let justifying = SignedVote {
        vote: Vote::from_header(finalised),
        signature: [3; 64],
        authority_id: AuthorityId::from(test.keypairs[2].public()),
    };
    test.service.record_justification(ROUND - 1, SET_ID, vec![justifying]);

    let vote = Vote::from_header(finalised);
    let message =
        vote_message(&test.keypairs[1], Subround::Precommit, vote, ROUND - 1, SET_ID);
    let err = test.service.validate_vote_message(&peer("laggard"), &message).unwrap_err();
    assert_matches!(err, Error::RoundMismatch { got, expected } if got == ROUND - 1 && expected == ROUND);

    let commits = test.network.commits.lock();
    assert_eq!(commits.len(), 1);
    let (to, commit) = &commits[0];
    assert_eq!(to, &peer("laggard"));
    assert_eq!(commit.round, ROUND - 1);
    assert_eq!(commit.set_id, SET_ID);
    assert_eq!(commit.vote.hash, finalised.hash());
    assert_eq!(commit.precommits, vec![justifying]);
}

#[test]
fn ahead_round_is_deferred_to_the_tracker() {
    let test = new_test_service();
    let chain = grow_chain(&test);
    let vote = Vote::from_header(&chain[2]);

    let message = vote_message(&test.keypairs[1], Subround::Prevote, vote, ROUND + 1, SET_ID);
    let err = test.service.validate_vote_message(&peer("early"), &message).unwrap_err();
    assert_matches!(err, Error::RoundMismatch { got, .. } if got == ROUND + 1);
    assert_eq!(test.service.deferred_round_votes(ROUND + 1), 1);

    // Once the round catches up the vote goes through on the retry.
    test.service.advance_to_round(ROUND + 1).unwrap();
    assert_eq!(test.service.deferred_round_votes(ROUND + 1), 0);
    assert_eq!(test.service.prevote_count(), 1);
}

#[test]
fn vote_from_self_is_rejected() {
    let test = new_test_service();
    let chain = grow_chain(&test);
    let vote = Vote::from_header(&chain[0]);

    let message = vote_message(&test.keypairs[0], Subround::Prevote, vote, ROUND, SET_ID);
    let err = test.service.validate_vote_message(&peer("echo"), &message).unwrap_err();
    assert_matches!(err, Error::VoteFromSelf);
}

#[test]
fn authority_outside_the_set_is_rejected() {
    let test = new_test_service();
    let chain = grow_chain(&test);
    let vote = Vote::from_header(&chain[0]);

    let outsider = keypair(9);
    let message = vote_message(&outsider, Subround::Prevote, vote, ROUND, SET_ID);
    let err = test.service.validate_vote_message(&peer("alice"), &message).unwrap_err();
    assert_matches!(err, Error::AuthorityNotInSet(_));
}

#[test]
fn unknown_block_defers_and_reports() {
    let test = new_test_service();
    let unknown = Hash::hash_bytes(b"not imported yet");
    let vote = Vote::new(unknown, 12);

    let message = vote_message(&test.keypairs[1], Subround::Prevote, vote, ROUND, SET_ID);
    let err = test.service.validate_vote_message(&peer("alice"), &message).unwrap_err();
    assert_matches!(err, Error::BlockDoesNotExist(hash) if hash == unknown);
    assert_eq!(test.service.deferred_block_votes(&unknown), 1);
}

#[test]
fn deferred_vote_is_retried_when_the_block_arrives() {
    let test = new_test_service();
    // Build the block but do not import it yet.
    let header = filament_chain::test_utils::child_header(&genesis_header(), 1);
    let vote = Vote::from_header(&header);

    let message = vote_message(&test.keypairs[1], Subround::Prevote, vote, ROUND, SET_ID);
    let _ = test.service.validate_vote_message(&peer("alice"), &message).unwrap_err();
    assert_eq!(test.service.deferred_block_votes(&header.hash()), 1);

    test.block_state
        .add_block(&filament_chain::test_utils::block_with_body(header.clone(), vec![]))
        .unwrap();
    test.service.handle_imported_block(header.hash());

    assert_eq!(test.service.deferred_block_votes(&header.hash()), 0);
    assert_eq!(test.service.prevote_count(), 1);
}

#[test]
fn vote_for_non_descendant_of_head_is_rejected() {
    let test = new_test_service();
    let chain = grow_chain(&test);
    // Finalise block 2 and move to the next round so the head advances.
    test.block_state.set_finalised_hash(&chain[1].hash(), ROUND, SET_ID).unwrap();
    test.service.advance_to_round(ROUND + 1).unwrap();

    // A dead branch off genesis does not descend from the new head.
    let dead = add_blocks(&test.block_state, &genesis_header(), 1, 0xd);
    let vote = Vote::from_header(&dead[0]);
    let message =
        vote_message(&test.keypairs[1], Subround::Prevote, vote, ROUND + 1, SET_ID);
    let err = test.service.validate_vote_message(&peer("alice"), &message).unwrap_err();
    assert_matches!(err, Error::VoteBlockMismatch);
}

#[test]
fn equivocation_moves_both_votes_out_of_the_tally() {
    // End-to-end scenario: authority B prevotes block A then block B in the
    // same round.
    let test = new_test_service();
    let chain = grow_chain(&test);
    let fork = add_blocks(&test.block_state, &chain[1], 1, 0xe);

    let authority = AuthorityId::from(test.keypairs[1].public());
    let first_vote = Vote::from_header(&chain[2]);
    let second_vote = Vote::from_header(&fork[0]);

    let first =
        vote_message(&test.keypairs[1], Subround::Prevote, first_vote, ROUND, SET_ID);
    test.service.validate_vote_message(&peer("alice"), &first).unwrap().unwrap();
    assert!(test.service.prevote_for(&authority).is_some());

    let second =
        vote_message(&test.keypairs[1], Subround::Prevote, second_vote, ROUND, SET_ID);
    let err = test.service.validate_vote_message(&peer("alice"), &second).unwrap_err();
    assert_matches!(err, Error::Equivocation);

    // The ordinary store no longer contains the voter at all.
    assert!(test.service.prevote_for(&authority).is_none());
    let equivocations = test.service.prevote_equivocations_for(&authority);
    assert_eq!(equivocations.len(), 2);
    assert_eq!(equivocations[0].vote, first_vote);
    assert_eq!(equivocations[1].vote, second_vote);

    // A third vote from the known equivocator is appended directly.
    let third = vote_message(&test.keypairs[1], Subround::Prevote, first_vote, ROUND, SET_ID);
    let err = test.service.validate_vote_message(&peer("alice"), &third).unwrap_err();
    assert_matches!(err, Error::Equivocation);
    assert_eq!(test.service.prevote_equivocations_for(&authority).len(), 3);
}

#[test]
fn repeated_identical_vote_is_not_an_equivocation() {
    let test = new_test_service();
    let chain = grow_chain(&test);
    let vote = Vote::from_header(&chain[2]);

    let message = vote_message(&test.keypairs[1], Subround::Prevote, vote, ROUND, SET_ID);
    test.service.validate_vote_message(&peer("alice"), &message).unwrap().unwrap();
    let again = test.service.validate_vote_message(&peer("alice"), &message).unwrap();
    assert_eq!(again, Some(vote));
    assert_eq!(test.service.prevote_count(), 1);
}

#[tokio::test]
async fn receive_loop_validates_and_emits_telemetry() {
    let test = new_test_service();
    let chain = grow_chain(&test);
    let vote = Vote::from_header(&chain[2]);

    let (tx, rx) = tokio::sync::mpsc::channel(8);
    let (ready_tx, ready_rx) = tokio::sync::oneshot::channel();
    let (done_tx, done_rx) = tokio::sync::oneshot::channel();
    let cancel = tokio_util::sync::CancellationToken::new();

    let handle = tokio::spawn(receive_vote_messages(
        test.service.clone(),
        rx,
        cancel.clone(),
        ready_tx,
        done_tx,
    ));
    ready_rx.await.expect("loop announces readiness");

    let prevote = vote_message(&test.keypairs[1], Subround::Prevote, vote, ROUND, SET_ID);
    let precommit = vote_message(&test.keypairs[2], Subround::Precommit, vote, ROUND, SET_ID);
    tx.send((peer("alice"), prevote)).await.unwrap();
    tx.send((peer("bob"), precommit)).await.unwrap();

    // Closing the channel ends the loop; `done` carries no error.
    drop(tx);
    let terminal = done_rx.await.expect("loop reports completion");
    assert!(terminal.is_none());
    handle.await.unwrap();

    assert_eq!(test.service.prevote_count(), 1);
    assert_eq!(test.service.precommit_count(), 1);

    let events = test.telemetry.events.lock();
    assert_eq!(events.len(), 2);
    assert_matches!(&events[0], TelemetryEvent::AfgReceivedPrevote { target_hash, .. }
        if *target_hash == vote.hash.to_string());
    assert_matches!(&events[1], TelemetryEvent::AfgReceivedPrecommit { .. });
}

#[tokio::test]
async fn receive_loop_cancels_promptly() {
    let test = new_test_service();

    let (tx, rx) = tokio::sync::mpsc::channel::<(PeerId, VoteMessage)>(8);
    let (ready_tx, ready_rx) = tokio::sync::oneshot::channel();
    let (done_tx, done_rx) = tokio::sync::oneshot::channel();
    let cancel = tokio_util::sync::CancellationToken::new();

    let handle = tokio::spawn(receive_vote_messages(
        test.service.clone(),
        rx,
        cancel.clone(),
        ready_tx,
        done_tx,
    ));
    ready_rx.await.expect("loop announces readiness");

    cancel.cancel();
    let terminal = done_rx.await.expect("loop reports completion");
    assert!(terminal.is_none());
    handle.await.unwrap();
    drop(tx);
}
