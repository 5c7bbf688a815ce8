use parity_scale_codec::{Decode, Encode};
use serde::{Deserialize, Serialize};

use filament_primitives::babe::{AuthorityRaw, NextConfigData, NextEpochData, SecondarySlots};

/// Authority set and randomness for one epoch, as persisted under the
/// `epochinfo` keys.
#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub struct EpochData {
    pub authorities: Vec<AuthorityRaw>,
    pub randomness: [u8; 32],
}

impl From<NextEpochData> for EpochData {
    fn from(next: NextEpochData) -> Self {
        Self { authorities: next.authorities, randomness: next.randomness }
    }
}

/// VRF configuration for one epoch, as persisted under the `configinfo`
/// keys. `c1/c2` is the probability an authority wins a primary slot.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub struct ConfigData {
    pub c1: u64,
    pub c2: u64,
    pub secondary_slots: SecondarySlots,
}

impl From<NextConfigData> for ConfigData {
    fn from(next: NextConfigData) -> Self {
        Self { c1: next.c1, c2: next.c2, secondary_slots: next.secondary_slots }
    }
}

/// First-epoch BABE parameters, fetched from the genesis runtime.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BabeConfiguration {
    /// Slot duration in milliseconds.
    pub slot_duration: u64,
    /// Epoch length measured in slots.
    pub epoch_length: u64,
    pub c1: u64,
    pub c2: u64,
    pub genesis_authorities: Vec<AuthorityRaw>,
    pub randomness: [u8; 32],
    pub secondary_slots: SecondarySlots,
}

impl BabeConfiguration {
    pub fn epoch_data(&self) -> EpochData {
        EpochData {
            authorities: self.genesis_authorities.clone(),
            randomness: self.randomness,
        }
    }

    pub fn config_data(&self) -> ConfigData {
        ConfigData { c1: self.c1, c2: self.c2, secondary_slots: self.secondary_slots }
    }
}
