//! Epoch state: tracks per-epoch authority sets and VRF configuration,
//! computes which epoch a block belongs to from its pre-runtime digest, and
//! finalises next-epoch announcements once their announcing block is on the
//! finalised chain.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use parity_scale_codec::Decode;
use parking_lot::RwLock;

use filament_chain::BlockState;
use filament_primitives::babe::{
    BabeConsensusLog, BabePreDigest, NextConfigData, NextEpochData,
};
use filament_primitives::header::BABE_ENGINE_ID;
use filament_primitives::{EpochNumber, Hash, Header, Slot};
use filament_store::{DBCol, Store};

pub mod types;

pub use types::{BabeConfiguration, ConfigData, EpochData};

const EPOCH_LENGTH_KEY: &[u8] = b"epochlength";
const CURRENT_EPOCH_KEY: &[u8] = b"current";
const FIRST_SLOT_KEY: &[u8] = b"firstslot";
const SLOT_DURATION_KEY: &[u8] = b"slotduration";
const LATEST_CONFIG_DATA_KEY: &[u8] = b"lcfginfo";
const SKIP_TO_KEY: &[u8] = b"skipto";

const EPOCH_DATA_PREFIX: &[u8] = b"epochinfo";
const CONFIG_DATA_PREFIX: &[u8] = b"configinfo";

fn epoch_data_key(epoch: EpochNumber) -> Vec<u8> {
    let mut key = EPOCH_DATA_PREFIX.to_vec();
    key.extend_from_slice(&epoch.to_le_bytes());
    key
}

fn config_data_key(epoch: EpochNumber) -> Vec<u8> {
    let mut key = CONFIG_DATA_PREFIX.to_vec();
    key.extend_from_slice(&epoch.to_le_bytes());
    key
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("epoch not found in memory map: {0}")]
    EpochNotInMemory(EpochNumber),
    #[error("hash not found in memory map: {0}")]
    HashNotInMemory(Hash),
    #[error("hash with next epoch not found in database")]
    HashNotPersisted,
    #[error("first slot has already been set")]
    FirstSlotAlreadySet,
    #[error("header does not contain pre-runtime digest")]
    NoPreRuntimeDigest,
    #[error("cannot decode babe pre-digest: {0}")]
    DecodePreDigest(parity_scale_codec::Error),
    #[error("epoch length is 0")]
    ZeroEpochLength,
    #[error("epoch state not initialised: {0} missing")]
    NotInitialised(&'static str),
    #[error(transparent)]
    Chain(#[from] filament_chain::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

type PendingMap<T> = RwLock<BTreeMap<EpochNumber, HashMap<Hash, T>>>;

/// Tracks information related to each epoch.
#[derive(Debug)]
pub struct EpochState {
    store: Store,
    block_state: Arc<BlockState>,
    /// Epoch length measured in slots.
    epoch_length: u64,
    skip_to_epoch: EpochNumber,

    /// Next-epoch data announced via consensus digests, keyed by the epoch
    /// it configures and the announcing block. Entries become canonical
    /// only when the announcing block is finalised.
    next_epoch_data: PendingMap<NextEpochData>,
    next_config_data: PendingMap<NextConfigData>,
}

impl EpochState {
    /// Creates epoch state from the first-epoch configuration fetched from
    /// the genesis runtime.
    pub fn new_from_genesis(
        store: Store,
        block_state: Arc<BlockState>,
        genesis_config: &BabeConfiguration,
    ) -> Result<Self, Error> {
        if genesis_config.epoch_length == 0 {
            return Err(Error::ZeroEpochLength);
        }

        let state = Self {
            store,
            block_state,
            epoch_length: genesis_config.epoch_length,
            skip_to_epoch: 0,
            next_epoch_data: RwLock::new(BTreeMap::new()),
            next_config_data: RwLock::new(BTreeMap::new()),
        };

        let mut update = state.store.store_update();
        // The first slot is refined once the first block is imported.
        update.set_ser(DBCol::Epoch, FIRST_SLOT_KEY, &1u64);
        update.set_ser(DBCol::Epoch, CURRENT_EPOCH_KEY, &0u64);
        update.set_ser(DBCol::Epoch, EPOCH_LENGTH_KEY, &genesis_config.epoch_length);
        update.set_ser(DBCol::Epoch, SLOT_DURATION_KEY, &genesis_config.slot_duration);
        update.set_ser(DBCol::Epoch, SKIP_TO_KEY, &0u64);
        update.commit()?;

        state.set_epoch_data(0, &genesis_config.epoch_data())?;
        state.set_config_data(0, &genesis_config.config_data())?;
        Ok(state)
    }

    /// Reopens epoch state over an existing database.
    pub fn new(store: Store, block_state: Arc<BlockState>) -> Result<Self, Error> {
        let epoch_length = store
            .get_ser::<u64>(DBCol::Epoch, EPOCH_LENGTH_KEY)?
            .ok_or(Error::NotInitialised("epoch length"))?;
        let skip_to_epoch =
            store.get_ser::<u64>(DBCol::Epoch, SKIP_TO_KEY)?.unwrap_or_default();
        Ok(Self {
            store,
            block_state,
            epoch_length,
            skip_to_epoch,
            next_epoch_data: RwLock::new(BTreeMap::new()),
            next_config_data: RwLock::new(BTreeMap::new()),
        })
    }

    pub fn epoch_length(&self) -> u64 {
        self.epoch_length
    }

    pub fn slot_duration(&self) -> Result<Duration, Error> {
        let millis = self
            .store
            .get_ser::<u64>(DBCol::Epoch, SLOT_DURATION_KEY)?
            .ok_or(Error::NotInitialised("slot duration"))?;
        Ok(Duration::from_millis(millis))
    }

    pub fn set_current_epoch(&self, epoch: EpochNumber) -> Result<(), Error> {
        let mut update = self.store.store_update();
        update.set_ser(DBCol::Epoch, CURRENT_EPOCH_KEY, &epoch);
        Ok(update.commit()?)
    }

    pub fn current_epoch(&self) -> Result<EpochNumber, Error> {
        Ok(self
            .store
            .get_ser::<u64>(DBCol::Epoch, CURRENT_EPOCH_KEY)?
            .ok_or(Error::NotInitialised("current epoch"))?)
    }

    fn first_slot(&self) -> Result<Slot, Error> {
        Ok(self
            .store
            .get_ser::<u64>(DBCol::Epoch, FIRST_SLOT_KEY)?
            .ok_or(Error::NotInitialised("first slot"))?)
    }

    /// Sets the slot number of block 1. Only allowed while nothing past
    /// genesis has been finalised, since all epoch arithmetic derives from
    /// this value.
    pub fn set_first_slot(&self, slot: Slot) -> Result<(), Error> {
        let finalised_head = self.block_state.get_highest_finalised_header()?;
        if finalised_head.number >= 1 {
            return Err(Error::FirstSlotAlreadySet);
        }
        let mut update = self.store.store_update();
        update.set_ser(DBCol::Epoch, FIRST_SLOT_KEY, &slot);
        Ok(update.commit()?)
    }

    /// The first slot of the given epoch.
    pub fn start_slot_for_epoch(&self, epoch: EpochNumber) -> Result<Slot, Error> {
        Ok(self.first_slot()? + self.epoch_length * epoch)
    }

    /// Determines the epoch a block belongs to from the slot number carried
    /// in its BABE pre-runtime digest.
    pub fn epoch_for_block(&self, header: &Header) -> Result<EpochNumber, Error> {
        let slot = self.slot_for_block(header)?;
        let first_slot = self.first_slot()?;
        if slot < first_slot {
            return Ok(0);
        }
        Ok((slot - first_slot) / self.epoch_length)
    }

    fn slot_for_block(&self, header: &Header) -> Result<Slot, Error> {
        let (_, data) = header.digest.pre_runtime().ok_or(Error::NoPreRuntimeDigest)?;
        let pre_digest =
            BabePreDigest::decode(&mut &data[..]).map_err(Error::DecodePreDigest)?;
        Ok(pre_digest.slot_number())
    }

    /// Whether verification for the given header should be skipped. Only
    /// used when replaying an imported state whose earlier epochs lack
    /// authority material.
    pub fn skip_verify(&self, header: &Header) -> Result<bool, Error> {
        Ok(self.epoch_for_block(header)? < self.skip_to_epoch)
    }

    pub fn set_epoch_data(&self, epoch: EpochNumber, data: &EpochData) -> Result<(), Error> {
        let mut update = self.store.store_update();
        update.set_ser(DBCol::Epoch, &epoch_data_key(epoch), data);
        Ok(update.commit()?)
    }

    pub fn set_config_data(&self, epoch: EpochNumber, data: &ConfigData) -> Result<(), Error> {
        let mut update = self.store.store_update();
        update.set_ser(DBCol::Epoch, &config_data_key(epoch), data);
        // The most recently set config data is the highest on the chain.
        update.set_ser(DBCol::Epoch, LATEST_CONFIG_DATA_KEY, &epoch);
        Ok(update.commit()?)
    }

    fn epoch_data_from_database(&self, epoch: EpochNumber) -> Result<Option<EpochData>, Error> {
        Ok(self.store.get_ser(DBCol::Epoch, &epoch_data_key(epoch))?)
    }

    fn config_data_from_database(
        &self,
        epoch: EpochNumber,
    ) -> Result<Option<ConfigData>, Error> {
        Ok(self.store.get_ser(DBCol::Epoch, &config_data_key(epoch))?)
    }

    /// Epoch data for the given epoch. The database is consulted first;
    /// when the epoch is not yet persisted and a header is given, the
    /// pending announcements are searched for the entry whose announcing
    /// block is an ancestor of that header.
    pub fn get_epoch_data(
        &self,
        epoch: EpochNumber,
        header: Option<&Header>,
    ) -> Result<Option<EpochData>, Error> {
        if let Some(data) = self.epoch_data_from_database(epoch)? {
            return Ok(Some(data));
        }
        let Some(header) = header else { return Ok(None) };
        let pending = self.next_epoch_data.read();
        Ok(Some(self.pending_for_header(&pending, epoch, header)?.into()))
    }

    /// Same lookup as [`EpochState::get_epoch_data`] for config data.
    pub fn get_config_data(
        &self,
        epoch: EpochNumber,
        header: Option<&Header>,
    ) -> Result<Option<ConfigData>, Error> {
        if let Some(data) = self.config_data_from_database(epoch)? {
            return Ok(Some(data));
        }
        let Some(header) = header else { return Ok(None) };
        let pending = self.next_config_data.read();
        Ok(Some(self.pending_for_header(&pending, epoch, header)?.into()))
    }

    /// The most recently persisted config data.
    pub fn latest_config_data(&self) -> Result<Option<ConfigData>, Error> {
        match self.store.get_ser::<u64>(DBCol::Epoch, LATEST_CONFIG_DATA_KEY)? {
            Some(epoch) => self.config_data_from_database(epoch),
            None => Ok(None),
        }
    }

    pub fn has_epoch_data(&self, epoch: EpochNumber) -> Result<bool, Error> {
        if self.store.exists(DBCol::Epoch, &epoch_data_key(epoch))? {
            return Ok(true);
        }
        Ok(self.next_epoch_data.read().contains_key(&epoch))
    }

    pub fn has_config_data(&self, epoch: EpochNumber) -> Result<bool, Error> {
        if self.store.exists(DBCol::Epoch, &config_data_key(epoch))? {
            return Ok(true);
        }
        Ok(self.next_config_data.read().contains_key(&epoch))
    }

    /// Searches the pending entries of `epoch` for the one announced by an
    /// ancestor of `header`.
    fn pending_for_header<T: Clone>(
        &self,
        pending: &BTreeMap<EpochNumber, HashMap<Hash, T>>,
        epoch: EpochNumber,
        header: &Header,
    ) -> Result<T, Error> {
        let entries = pending.get(&epoch).ok_or(Error::EpochNotInMemory(epoch))?;
        let header_hash = header.hash();
        for (announcing_hash, value) in entries {
            if *announcing_hash == header_hash
                || self.block_state.is_descendant_of(announcing_hash, &header_hash)?
            {
                return Ok(value.clone());
            }
        }
        Err(Error::HashNotInMemory(header_hash))
    }

    /// Stages next-epoch data announced by `announcing_block` for `epoch`.
    pub fn store_babe_next_epoch_data(
        &self,
        epoch: EpochNumber,
        announcing_block: Hash,
        data: NextEpochData,
    ) {
        self.next_epoch_data.write().entry(epoch).or_default().insert(announcing_block, data);
    }

    /// Stages next-config data announced by `announcing_block` for `epoch`.
    pub fn store_babe_next_config_data(
        &self,
        epoch: EpochNumber,
        announcing_block: Hash,
        data: NextConfigData,
    ) {
        self.next_config_data.write().entry(epoch).or_default().insert(announcing_block, data);
    }

    /// Records the BABE consensus digests of a freshly imported header into
    /// the pending maps. Announcements configure the epoch after the one
    /// the block belongs to.
    pub fn handle_babe_digests(&self, header: &Header) -> Result<(), Error> {
        for payload in header.digest.consensus(BABE_ENGINE_ID) {
            let log = match BabeConsensusLog::decode(&mut &payload[..]) {
                Ok(log) => log,
                Err(err) => {
                    tracing::warn!(
                        target: "epoch",
                        block = %header.hash(),
                        %err,
                        "undecodable BABE consensus digest",
                    );
                    continue;
                }
            };
            let epoch = self.epoch_for_block(header)? + 1;
            match log {
                BabeConsensusLog::NextEpochData(data) => {
                    self.store_babe_next_epoch_data(epoch, header.hash(), data);
                }
                BabeConsensusLog::NextConfigData(data) => {
                    self.store_babe_next_config_data(epoch, header.hash(), data);
                }
                BabeConsensusLog::OnDisabled(_) => {}
            }
        }
        Ok(())
    }

    /// Promotes the pending next-epoch data announced on the newly
    /// finalised chain: the entry whose announcing block made it into the
    /// header database is persisted for `epoch(finalised) + 1`, and all
    /// staged epochs up to and including it are dropped from memory.
    pub fn finalize_babe_next_epoch_data(&self, finalized_header: &Header) -> Result<(), Error> {
        let mut pending = self.next_epoch_data.write();

        let finalized_epoch = self.epoch_for_block(finalized_header)?;
        let next_epoch = finalized_epoch + 1;

        if self.epoch_data_from_database(next_epoch)?.is_some() {
            return Ok(());
        }

        let data = Self::find_finalised_entry(&pending, &self.block_state, next_epoch)?;
        self.set_epoch_data(next_epoch, &data.into())?;

        pending.retain(|epoch, _| *epoch > next_epoch);
        Ok(())
    }

    /// Same as [`EpochState::finalize_babe_next_epoch_data`] for config
    /// data, except a missing staged entry is not an error since not every
    /// epoch carries a config change.
    pub fn finalize_babe_next_config_data(&self, finalized_header: &Header) -> Result<(), Error> {
        let mut pending = self.next_config_data.write();

        let finalized_epoch = self.epoch_for_block(finalized_header)?;
        let next_epoch = finalized_epoch + 1;

        if self.config_data_from_database(next_epoch)?.is_some() {
            return Ok(());
        }

        let data = match Self::find_finalised_entry(&pending, &self.block_state, next_epoch) {
            Ok(data) => data,
            Err(Error::EpochNotInMemory(_)) => {
                tracing::debug!(
                    target: "epoch",
                    epoch = next_epoch,
                    "no pending config data for epoch",
                );
                return Ok(());
            }
            Err(err) => return Err(err),
        };
        self.set_config_data(next_epoch, &data.into())?;

        pending.retain(|epoch, _| *epoch > next_epoch);
        Ok(())
    }

    /// Out of the entries staged for `epoch`, picks one whose announcing
    /// block made it into the header database, i.e. onto the finalised
    /// chain.
    fn find_finalised_entry<T: Clone>(
        pending: &BTreeMap<EpochNumber, HashMap<Hash, T>>,
        block_state: &BlockState,
        epoch: EpochNumber,
    ) -> Result<T, Error> {
        let entries = pending.get(&epoch).ok_or(Error::EpochNotInMemory(epoch))?;
        for (announcing_hash, value) in entries {
            if block_state.has_header_in_database(announcing_hash)? {
                return Ok(value.clone());
            }
        }
        Err(Error::HashNotPersisted)
    }

    #[cfg(test)]
    fn pending_epoch_entries(&self, epoch: EpochNumber) -> usize {
        self.next_epoch_data.read().get(&epoch).map_or(0, HashMap::len)
    }
}

#[cfg(test)]
mod tests;
