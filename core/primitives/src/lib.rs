//! Core protocol types shared by every subsystem of the host: hashes,
//! headers, blocks, BABE digests, transaction validity and wire messages.

use parity_scale_codec::{Decode, Encode};

pub mod babe;
pub mod block;
pub mod hash;
pub mod header;
pub mod messages;
pub mod network;
pub mod transaction;

pub use block::{Block, Body, Extrinsic};
pub use hash::Hash;
pub use header::{Digest, DigestItem, Header};

/// Block height. u32 on the wire, like the rest of the protocol family.
pub type BlockNumber = u32;

/// BABE slot number.
pub type Slot = u64;

/// Epoch index.
pub type EpochNumber = u64;

/// Storage key under which the runtime WASM blob lives in the state trie.
pub const CODE_KEY: &[u8] = b":code";

/// Consensus authority public key. Both BABE and GRANDPA identify
/// authorities by a 32 byte public key; the core treats it as opaque.
#[derive(
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    Encode,
    Decode,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct AuthorityId(pub [u8; 32]);

impl AuthorityId {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<[u8; 32]> for AuthorityId {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl std::fmt::Display for AuthorityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl std::fmt::Debug for AuthorityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{}…", hex::encode(&self.0[..4]))
    }
}
