use std::sync::Arc;

use assert_matches::assert_matches;
use parity_scale_codec::Encode;

use filament_chain::test_utils::{block_with_body, genesis_block_state, genesis_header};
use filament_chain::BlockState;
use filament_primitives::babe::{
    AuthorityRaw, BabeConsensusLog, BabePreDigest, NextConfigData, NextEpochData,
    SecondarySlots,
};
use filament_primitives::header::{DigestItem, BABE_ENGINE_ID};
use filament_primitives::{AuthorityId, Digest, Hash, Header, Slot};
use filament_store::{Store, EMPTY_TRIE_HASH};

use super::*;

const EPOCH_LENGTH: u64 = 100;

fn genesis_config() -> BabeConfiguration {
    BabeConfiguration {
        slot_duration: 6000,
        epoch_length: EPOCH_LENGTH,
        c1: 1,
        c2: 4,
        genesis_authorities: vec![AuthorityRaw { key: AuthorityId([1; 32]), weight: 1 }],
        randomness: [7; 32],
        secondary_slots: SecondarySlots::Plain,
    }
}

fn new_epoch_state() -> (EpochState, Arc<BlockState>) {
    let store = Store::test_store();
    let block_state = genesis_block_state(store.clone());
    let epoch_state =
        EpochState::new_from_genesis(store, block_state.clone(), &genesis_config()).unwrap();
    (epoch_state, block_state)
}

/// A child header claiming `slot` with a secondary-plain pre-digest,
/// optionally carrying BABE consensus digests.
fn babe_child(parent: &Header, slot: Slot, seed: u8, logs: Vec<BabeConsensusLog>) -> Header {
    let pre_digest =
        BabePreDigest::SecondaryPlain { authority_index: 0, slot_number: slot };
    let mut digest = Digest::default();
    digest.push(DigestItem::PreRuntime(BABE_ENGINE_ID, pre_digest.encode()));
    for log in logs {
        digest.push(DigestItem::Consensus(BABE_ENGINE_ID, log.encode()));
    }
    Header::new(
        parent.hash(),
        parent.number + 1,
        Hash::hash_bytes(&[seed]),
        *EMPTY_TRIE_HASH,
        digest,
    )
}

fn next_epoch_announcement(tag: u8) -> NextEpochData {
    NextEpochData {
        authorities: vec![AuthorityRaw { key: AuthorityId([tag; 32]), weight: 1 }],
        randomness: [tag; 32],
    }
}

#[test]
fn genesis_bootstrap_persists_first_epoch() {
    let (epoch_state, _) = new_epoch_state();
    assert_eq!(epoch_state.current_epoch().unwrap(), 0);
    assert_eq!(epoch_state.epoch_length(), EPOCH_LENGTH);
    assert_eq!(epoch_state.slot_duration().unwrap().as_millis(), 6000);

    let epoch_data = epoch_state.get_epoch_data(0, None).unwrap().unwrap();
    assert_eq!(epoch_data, genesis_config().epoch_data());
    let config_data = epoch_state.get_config_data(0, None).unwrap().unwrap();
    assert_eq!(config_data, genesis_config().config_data());
    assert_eq!(epoch_state.latest_config_data().unwrap(), Some(config_data));
    assert_eq!(epoch_state.start_slot_for_epoch(2).unwrap(), 1 + 2 * EPOCH_LENGTH);
}

#[test]
fn zero_epoch_length_is_rejected() {
    let store = Store::test_store();
    let block_state = genesis_block_state(store.clone());
    let mut config = genesis_config();
    config.epoch_length = 0;
    let err = EpochState::new_from_genesis(store, block_state, &config).unwrap_err();
    assert_matches!(err, Error::ZeroEpochLength);
}

#[test]
fn epoch_for_block_follows_the_slot_arithmetic() {
    let (epoch_state, _) = new_epoch_state();
    let genesis = genesis_header();

    // With first slot 1: epoch(h) == (slot - 1) / epoch_length.
    for (slot, expected) in
        [(1u64, 0u64), (2, 0), (EPOCH_LENGTH, 0), (EPOCH_LENGTH + 1, 1), (345, 3)]
    {
        let header = babe_child(&genesis, slot, slot as u8, vec![]);
        assert_eq!(epoch_state.epoch_for_block(&header).unwrap(), expected, "slot {slot}");
    }

    // Slots before the first slot belong to epoch 0.
    epoch_state.set_first_slot(50).unwrap();
    let header = babe_child(&genesis, 10, 1, vec![]);
    assert_eq!(epoch_state.epoch_for_block(&header).unwrap(), 0);
    let header = babe_child(&genesis, 50 + EPOCH_LENGTH, 2, vec![]);
    assert_eq!(epoch_state.epoch_for_block(&header).unwrap(), 1);
}

#[test]
fn header_without_pre_runtime_digest_is_an_error() {
    let (epoch_state, _) = new_epoch_state();
    let err = epoch_state.epoch_for_block(&genesis_header()).unwrap_err();
    assert_matches!(err, Error::NoPreRuntimeDigest);
}

#[test]
fn first_slot_is_frozen_once_block_one_is_finalised() {
    let (epoch_state, block_state) = new_epoch_state();
    epoch_state.set_first_slot(42).unwrap();

    let block1 = babe_child(&genesis_header(), 42, 1, vec![]);
    block_state.add_block(&block_with_body(block1.clone(), vec![])).unwrap();
    block_state.set_finalised_hash(&block1.hash(), 1, 0).unwrap();

    let err = epoch_state.set_first_slot(43).unwrap_err();
    assert_matches!(err, Error::FirstSlotAlreadySet);
}

#[test]
fn babe_digests_are_staged_for_the_next_epoch() {
    let (epoch_state, block_state) = new_epoch_state();
    let announcement = next_epoch_announcement(9);
    let block1 = babe_child(
        &genesis_header(),
        5,
        1,
        vec![BabeConsensusLog::NextEpochData(announcement.clone())],
    );
    block_state.add_block(&block_with_body(block1.clone(), vec![])).unwrap();
    epoch_state.handle_babe_digests(&block1).unwrap();

    // Block of epoch 0 announces data for epoch 1.
    assert!(epoch_state.has_epoch_data(1).unwrap());
    assert_eq!(epoch_state.pending_epoch_entries(1), 1);

    // Visible through the header-assisted lookup for descendants.
    let block2 = babe_child(&block1, 6, 2, vec![]);
    block_state.add_block(&block_with_body(block2.clone(), vec![])).unwrap();
    let data = epoch_state.get_epoch_data(1, Some(&block2)).unwrap().unwrap();
    assert_eq!(data, announcement.into());

    // A header on another branch cannot see the staged entry.
    let other = babe_child(&genesis_header(), 7, 3, vec![]);
    block_state.add_block(&block_with_body(other.clone(), vec![])).unwrap();
    let err = epoch_state.get_epoch_data(1, Some(&other)).unwrap_err();
    assert_matches!(err, Error::HashNotInMemory(_));
}

#[test]
fn finalisation_promotes_the_announcement_on_the_finalised_chain() {
    let (epoch_state, block_state) = new_epoch_state();
    let genesis = genesis_header();

    // Canonical chain B1..B5, with B3 announcing epoch 1.
    let canonical_announcement = next_epoch_announcement(0xca);
    let mut parent = genesis.clone();
    let mut canonical = Vec::new();
    for i in 1..=5u64 {
        let logs = if i == 3 {
            vec![BabeConsensusLog::NextEpochData(canonical_announcement.clone())]
        } else {
            vec![]
        };
        let header = babe_child(&parent, i, 0xa0 + i as u8, logs);
        block_state.add_block(&block_with_body(header.clone(), vec![])).unwrap();
        epoch_state.handle_babe_digests(&header).unwrap();
        parent = header.clone();
        canonical.push(header);
    }

    // A dead branch carries a competing announcement.
    let dead = babe_child(
        &genesis,
        9,
        0xdd,
        vec![BabeConsensusLog::NextEpochData(next_epoch_announcement(0xdd))],
    );
    block_state.add_block(&block_with_body(dead.clone(), vec![])).unwrap();
    epoch_state.handle_babe_digests(&dead).unwrap();
    assert_eq!(epoch_state.pending_epoch_entries(1), 2);

    // Finalising B3 (epoch 0) promotes exactly the canonical announcement.
    block_state.set_finalised_hash(&canonical[2].hash(), 1, 0).unwrap();
    epoch_state.finalize_babe_next_epoch_data(&canonical[2]).unwrap();

    let promoted = epoch_state.get_epoch_data(1, None).unwrap().unwrap();
    assert_eq!(promoted, canonical_announcement.into());
    // Every staged epoch <= 1 was purged.
    assert_eq!(epoch_state.pending_epoch_entries(1), 0);

    // Re-finalising is a no-op even with the staging area empty.
    epoch_state.finalize_babe_next_epoch_data(&canonical[2]).unwrap();
}

#[test]
fn finalisation_without_staged_epoch_data_is_fatal() {
    let (epoch_state, block_state) = new_epoch_state();
    let block1 = babe_child(&genesis_header(), 1, 1, vec![]);
    block_state.add_block(&block_with_body(block1.clone(), vec![])).unwrap();
    block_state.set_finalised_hash(&block1.hash(), 1, 0).unwrap();

    let err = epoch_state.finalize_babe_next_epoch_data(&block1).unwrap_err();
    assert_matches!(err, Error::EpochNotInMemory(1));
}

#[test]
fn finalisation_without_staged_config_data_is_tolerated() {
    let (epoch_state, block_state) = new_epoch_state();
    let block1 = babe_child(&genesis_header(), 1, 1, vec![]);
    block_state.add_block(&block_with_body(block1.clone(), vec![])).unwrap();
    block_state.set_finalised_hash(&block1.hash(), 1, 0).unwrap();

    // Not every epoch carries a config change.
    epoch_state.finalize_babe_next_config_data(&block1).unwrap();
    assert_eq!(epoch_state.get_config_data(1, None).unwrap(), None);
}

#[test]
fn finalisation_with_only_unpersisted_announcers_fails() {
    let (epoch_state, block_state) = new_epoch_state();

    // The announcement lives on a branch that never gets finalised.
    let dead = babe_child(
        &genesis_header(),
        3,
        0xdd,
        vec![BabeConsensusLog::NextEpochData(next_epoch_announcement(0xdd))],
    );
    block_state.add_block(&block_with_body(dead.clone(), vec![])).unwrap();
    epoch_state.handle_babe_digests(&dead).unwrap();

    // Finalise a different block of epoch 0.
    let block1 = babe_child(&genesis_header(), 1, 1, vec![]);
    block_state.add_block(&block_with_body(block1.clone(), vec![])).unwrap();
    block_state.set_finalised_hash(&block1.hash(), 1, 0).unwrap();

    let err = epoch_state.finalize_babe_next_epoch_data(&block1).unwrap_err();
    assert_matches!(err, Error::HashNotPersisted);
}

#[test]
fn config_announcements_promote_like_epoch_data() {
    let (epoch_state, block_state) = new_epoch_state();
    let config = NextConfigData { c1: 1, c2: 2, secondary_slots: SecondarySlots::Vrf };
    let block1 = babe_child(
        &genesis_header(),
        1,
        1,
        vec![BabeConsensusLog::NextConfigData(config)],
    );
    block_state.add_block(&block_with_body(block1.clone(), vec![])).unwrap();
    epoch_state.handle_babe_digests(&block1).unwrap();

    block_state.set_finalised_hash(&block1.hash(), 1, 0).unwrap();
    epoch_state.finalize_babe_next_config_data(&block1).unwrap();

    assert_eq!(epoch_state.get_config_data(1, None).unwrap(), Some(config.into()));
    // The latest-config pointer followed.
    assert_eq!(epoch_state.latest_config_data().unwrap(), Some(config.into()));
}

#[test]
fn skip_verify_honours_the_skip_to_marker() {
    let (epoch_state, _) = new_epoch_state();
    let header = babe_child(&genesis_header(), 5, 1, vec![]);
    assert!(!epoch_state.skip_verify(&header).unwrap());
}
