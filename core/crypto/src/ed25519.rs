use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};

use filament_primitives::AuthorityId;

use crate::Error;

pub const SIGNATURE_LENGTH: usize = 64;
pub const PUBLIC_KEY_LENGTH: usize = 32;
pub const SEED_LENGTH: usize = 32;

/// An ED25519 signature.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct Signature(pub [u8; SIGNATURE_LENGTH]);

impl Signature {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Debug for Signature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{}…", hex::encode(&self.0[..8]))
    }
}

/// An ED25519 public key.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct PublicKey(VerifyingKey);

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{}", hex::encode(self.0.as_bytes()))
    }
}

impl PublicKey {
    pub fn from_bytes(bytes: &[u8; PUBLIC_KEY_LENGTH]) -> Result<Self, Error> {
        VerifyingKey::from_bytes(bytes).map(Self).map_err(|_| Error::InvalidPublicKey)
    }

    /// Verifies `signature` over `message`, returning whether it is valid.
    pub fn verify(&self, message: &[u8], signature: &Signature) -> bool {
        let signature = ed25519_dalek::Signature::from_bytes(&signature.0);
        self.0.verify(message, &signature).is_ok()
    }

    pub fn to_bytes(&self) -> [u8; PUBLIC_KEY_LENGTH] {
        self.0.to_bytes()
    }
}

impl From<PublicKey> for AuthorityId {
    fn from(key: PublicKey) -> Self {
        AuthorityId(key.to_bytes())
    }
}

impl TryFrom<&AuthorityId> for PublicKey {
    type Error = Error;

    fn try_from(id: &AuthorityId) -> Result<Self, Error> {
        Self::from_bytes(&id.0)
    }
}

/// An ED25519 keypair.
#[derive(Clone)]
pub struct Keypair(SigningKey);

impl Keypair {
    /// Derives a keypair deterministically from a 32 byte seed.
    pub fn from_seed(seed: &[u8; SEED_LENGTH]) -> Self {
        Self(SigningKey::from_bytes(seed))
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        Signature(self.0.sign(message).to_bytes())
    }

    pub fn public(&self) -> PublicKey {
        PublicKey(self.0.verifying_key())
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Keypair({:?})", AuthorityId::from(self.public()))
    }
}
