//! Signing primitives and key management.
//!
//! The host only verifies ED25519 signatures itself (GRANDPA votes); every
//! other scheme lives behind the runtime boundary. The keystore routes keys
//! into typed namespaces so a GRANDPA key can never be used for authoring.

pub mod ed25519;
pub mod keystore;

pub use ed25519::{Keypair, PublicKey, Signature};
pub use keystore::{GlobalKeystore, KeyType, Keystore};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid public key bytes")]
    InvalidPublicKey,
    #[error("invalid keystore name: {0}")]
    InvalidKeystoreName(String),
    #[error("key type not supported: {0}")]
    KeyTypeNotSupported(String),
}
