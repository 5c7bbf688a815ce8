use parity_scale_codec::{Decode, Encode};
use serde::{Deserialize, Serialize};

use crate::{AuthorityId, Slot};

/// VRF output and proof carried by primary and secondary-VRF pre-digests.
/// The core only routes these bytes; verification happens in the authoring
/// collaborator.
pub const VRF_OUTPUT_LENGTH: usize = 32;
pub const VRF_PROOF_LENGTH: usize = 64;

/// BABE authority public key paired with its voting weight.
#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode, Serialize, Deserialize)]
pub struct AuthorityRaw {
    pub key: AuthorityId,
    pub weight: u64,
}

/// The pre-runtime digest a block author writes to claim a slot.
#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub enum BabePreDigest {
    #[codec(index = 1)]
    Primary {
        authority_index: u32,
        slot_number: Slot,
        vrf_output: [u8; VRF_OUTPUT_LENGTH],
        vrf_proof: [u8; VRF_PROOF_LENGTH],
    },
    #[codec(index = 2)]
    SecondaryPlain { authority_index: u32, slot_number: Slot },
    #[codec(index = 3)]
    SecondaryVrf {
        authority_index: u32,
        slot_number: Slot,
        vrf_output: [u8; VRF_OUTPUT_LENGTH],
        vrf_proof: [u8; VRF_PROOF_LENGTH],
    },
}

impl BabePreDigest {
    pub fn slot_number(&self) -> Slot {
        match self {
            Self::Primary { slot_number, .. }
            | Self::SecondaryPlain { slot_number, .. }
            | Self::SecondaryVrf { slot_number, .. } => *slot_number,
        }
    }

    pub fn authority_index(&self) -> u32 {
        match self {
            Self::Primary { authority_index, .. }
            | Self::SecondaryPlain { authority_index, .. }
            | Self::SecondaryVrf { authority_index, .. } => *authority_index,
        }
    }
}

/// Which non-primary slot claims an epoch permits.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Encode, Decode, Serialize, Deserialize)]
pub enum SecondarySlots {
    #[codec(index = 0)]
    None,
    #[codec(index = 1)]
    Plain,
    #[codec(index = 2)]
    Vrf,
}

/// Next-epoch authority set and randomness, announced one epoch ahead via a
/// consensus digest and only promoted once the announcing block is finalised.
#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub struct NextEpochData {
    pub authorities: Vec<AuthorityRaw>,
    pub randomness: [u8; 32],
}

/// Next-epoch VRF configuration, announced the same way as [`NextEpochData`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub struct NextConfigData {
    pub c1: u64,
    pub c2: u64,
    pub secondary_slots: SecondarySlots,
}

/// BABE consensus digest payloads. Variant indices match the wire format;
/// `OnDisabled` is decoded but ignored by the core.
#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub enum BabeConsensusLog {
    #[codec(index = 1)]
    NextEpochData(NextEpochData),
    #[codec(index = 2)]
    OnDisabled(u32),
    #[codec(index = 3)]
    NextConfigData(NextConfigData),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pre_digest_slot_extraction() {
        let digest = BabePreDigest::SecondaryPlain { authority_index: 0, slot_number: 17 };
        assert_eq!(digest.slot_number(), 17);

        let digest = BabePreDigest::Primary {
            authority_index: 3,
            slot_number: 999,
            vrf_output: [0; VRF_OUTPUT_LENGTH],
            vrf_proof: [0; VRF_PROOF_LENGTH],
        };
        assert_eq!(digest.slot_number(), 999);
        assert_eq!(digest.authority_index(), 3);
    }

    #[test]
    fn consensus_log_round_trips() {
        let log = BabeConsensusLog::NextEpochData(NextEpochData {
            authorities: vec![AuthorityRaw { key: AuthorityId([7; 32]), weight: 1 }],
            randomness: [9; 32],
        });
        let encoded = log.encode();
        assert_eq!(encoded[0], 1);
        assert_eq!(BabeConsensusLog::decode(&mut &encoded[..]).unwrap(), log);
    }

    #[test]
    fn secondary_plain_pre_digest_encoding() {
        // authority index 1, slot 0xf55a50ef: layout is enum index, u32 LE, u64 LE.
        let digest = BabePreDigest::SecondaryPlain { authority_index: 1, slot_number: 0x0f55_a5ef };
        let encoded = digest.encode();
        assert_eq!(encoded[0], 2);
        assert_eq!(encoded.len(), 1 + 4 + 8);
        assert_eq!(BabePreDigest::decode(&mut &encoded[..]).unwrap(), digest);
    }
}
