use parity_scale_codec::{Decode, Encode};

use crate::hash::Hash;
use crate::BlockNumber;

/// Identifies the consensus engine a digest item belongs to.
pub type ConsensusEngineId = [u8; 4];

pub const BABE_ENGINE_ID: ConsensusEngineId = *b"BABE";
pub const GRANDPA_ENGINE_ID: ConsensusEngineId = *b"FRNK";

/// A block header.
///
/// The hash of a header is the Blake2b-256 of its SCALE encoding; the block
/// number is compact-encoded on the wire.
#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub struct Header {
    pub parent_hash: Hash,
    #[codec(compact)]
    pub number: BlockNumber,
    pub state_root: Hash,
    pub extrinsics_root: Hash,
    pub digest: Digest,
}

impl Header {
    pub fn new(
        parent_hash: Hash,
        number: BlockNumber,
        state_root: Hash,
        extrinsics_root: Hash,
        digest: Digest,
    ) -> Self {
        Self { parent_hash, number, state_root, extrinsics_root, digest }
    }

    pub fn hash(&self) -> Hash {
        Hash::hash_of(self)
    }
}

/// Ordered sequence of digest items attached to a header.
#[derive(Clone, Debug, Default, PartialEq, Eq, Encode, Decode)]
pub struct Digest {
    pub logs: Vec<DigestItem>,
}

impl Digest {
    pub fn push(&mut self, item: DigestItem) {
        self.logs.push(item);
    }

    /// The first pre-runtime digest item, if any.
    pub fn pre_runtime(&self) -> Option<(&ConsensusEngineId, &[u8])> {
        self.logs.iter().find_map(|item| match item {
            DigestItem::PreRuntime(id, data) => Some((id, data.as_slice())),
            _ => None,
        })
    }

    /// Iterates over consensus digest payloads for the given engine.
    pub fn consensus(&self, engine: ConsensusEngineId) -> impl Iterator<Item = &[u8]> {
        self.logs.iter().filter_map(move |item| match item {
            DigestItem::Consensus(id, data) if *id == engine => Some(data.as_slice()),
            _ => None,
        })
    }
}

impl FromIterator<DigestItem> for Digest {
    fn from_iter<I: IntoIterator<Item = DigestItem>>(iter: I) -> Self {
        Self { logs: iter.into_iter().collect() }
    }
}

/// A typed header digest item. Variant indices follow the wire format shared
/// with other hosts, so mixed-client chains decode each other's headers.
#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub enum DigestItem {
    #[codec(index = 6)]
    PreRuntime(ConsensusEngineId, Vec<u8>),
    #[codec(index = 4)]
    Consensus(ConsensusEngineId, Vec<u8>),
    #[codec(index = 5)]
    Seal(ConsensusEngineId, Vec<u8>),
}
