use std::fmt;
use std::str::FromStr;

use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};
use parity_scale_codec::{Decode, Encode};

/// Blake2b with a 256 bit digest, the hash function used everywhere in the
/// protocol (headers, trie nodes, runtime code).
type Blake2b256 = Blake2b<U32>;

/// A 32 byte hash. Equality and ordering are byte-wise.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Encode, Decode)]
pub struct Hash(pub [u8; 32]);

impl Hash {
    pub const LENGTH: usize = 32;

    /// Hashes the given bytes with Blake2b-256.
    pub fn hash_bytes(bytes: &[u8]) -> Self {
        let mut hasher = Blake2b256::new();
        hasher.update(bytes);
        Self(hasher.finalize().into())
    }

    /// Hashes the SCALE encoding of the given value.
    pub fn hash_of<T: Encode>(value: &T) -> Self {
        Self::hash_bytes(&value.encode())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Builds a hash from a slice, returning `None` unless it is exactly
    /// 32 bytes long.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let bytes: [u8; 32] = bytes.try_into().ok()?;
        Some(Self(bytes))
    }
}

impl From<[u8; 32]> for Hash {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for Hash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Truncated form, full hashes make logs unreadable.
        write!(f, "0x{}…{}", hex::encode(&self.0[..4]), hex::encode(&self.0[28..]))
    }
}

impl FromStr for Hash {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.strip_prefix("0x").unwrap_or(s);
        let bytes = hex::decode(s)?;
        Self::from_slice(&bytes).ok_or(hex::FromHexError::InvalidStringLength)
    }
}

/// Convenience free function mirroring the common `hash(&data)` call sites.
pub fn hash(bytes: &[u8]) -> Hash {
    Hash::hash_bytes(bytes)
}
