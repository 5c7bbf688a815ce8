//! Shared fakes and builders for tests across the workspace.

use std::sync::Arc;

use parking_lot::Mutex;

use filament_primitives::transaction::{TransactionValidityError, Validity};
use filament_primitives::{Block, Body, Digest, Extrinsic, Hash, Header};
use filament_store::{Store, TrieState, EMPTY_TRIE_HASH};

use crate::block_state::BlockState;
use crate::error::RuntimeError;
use crate::runtime::{Runtime, RuntimeInstantiator, RuntimeVersion};

type ValidateFn =
    dyn Fn(&Extrinsic) -> Result<Validity, TransactionValidityError> + Send + Sync;

/// A fake runtime. By default every extrinsic validates with priority 1;
/// tests override the behaviour with [`MockRuntime::with_validator`].
pub struct MockRuntime {
    version: RuntimeVersion,
    code_hash: Hash,
    validate: Box<ValidateFn>,
    context: Mutex<Option<TrieState>>,
}

impl MockRuntime {
    pub fn new(spec_version: u32) -> Self {
        Self {
            version: RuntimeVersion {
                spec_name: "mock".to_string(),
                impl_name: "filament-mock".to_string(),
                authoring_version: 1,
                spec_version,
                impl_version: 1,
                transaction_version: 1,
            },
            code_hash: Hash::hash_bytes(&spec_version.to_le_bytes()),
            validate: Box::new(|_| Ok(Validity::new(1))),
            context: Mutex::new(None),
        }
    }

    pub fn with_code_hash(mut self, code_hash: Hash) -> Self {
        self.code_hash = code_hash;
        self
    }

    pub fn with_validator(
        mut self,
        validate: impl Fn(&Extrinsic) -> Result<Validity, TransactionValidityError>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        self.validate = Box::new(validate);
        self
    }
}

impl Runtime for MockRuntime {
    fn version(&self) -> RuntimeVersion {
        self.version.clone()
    }

    fn metadata(&self) -> Vec<u8> {
        b"mock metadata".to_vec()
    }

    fn validate_transaction(
        &self,
        extrinsic: &Extrinsic,
    ) -> Result<Validity, TransactionValidityError> {
        (self.validate)(extrinsic)
    }

    fn set_context_storage(&self, trie_state: TrieState) {
        *self.context.lock() = Some(trie_state);
    }

    fn code_hash(&self) -> Hash {
        self.code_hash
    }
}

/// Instantiator used by tests: the runtime's spec version is read out of
/// the first four bytes of the "WASM" blob, its code hash is the real
/// Blake2b-256 of the blob.
pub struct MockInstantiator;

impl RuntimeInstantiator for MockInstantiator {
    fn instantiate(&self, code: &[u8]) -> Result<Arc<dyn Runtime>, RuntimeError> {
        if code.is_empty() {
            return Err(RuntimeError("empty code blob".to_string()));
        }
        let spec_version = match code.get(..4) {
            Some(bytes) => u32::from_le_bytes(bytes.try_into().expect("slice of four")),
            None => 0,
        };
        Ok(Arc::new(
            MockRuntime::new(spec_version).with_code_hash(Hash::hash_bytes(code)),
        ))
    }
}

/// A "WASM blob" whose [`MockInstantiator`] runtime reports `spec_version`.
pub fn code_with_spec_version(spec_version: u32) -> Vec<u8> {
    let mut code = spec_version.to_le_bytes().to_vec();
    code.extend_from_slice(b"mock wasm body");
    code
}

pub fn genesis_header() -> Header {
    Header::new(Hash::default(), 0, *EMPTY_TRIE_HASH, *EMPTY_TRIE_HASH, Digest::default())
}

/// A child header for the given parent, with a distinguishing state root so
/// sibling headers hash differently.
pub fn child_header(parent: &Header, seed: u8) -> Header {
    Header::new(
        parent.hash(),
        parent.number + 1,
        Hash::hash_bytes(&[seed]),
        *EMPTY_TRIE_HASH,
        Digest::default(),
    )
}

pub fn block_with_body(header: Header, extrinsics: Vec<Extrinsic>) -> Block {
    Block::new(header, Body(extrinsics))
}

/// Block state bootstrapped from the test genesis with a mock runtime.
pub fn genesis_block_state(store: Store) -> Arc<BlockState> {
    let genesis_runtime = Arc::new(
        MockRuntime::new(1).with_code_hash(Hash::hash_bytes(&code_with_spec_version(1))),
    );
    Arc::new(
        BlockState::new_from_genesis(
            store,
            &genesis_header(),
            genesis_runtime,
            Arc::new(MockInstantiator),
        )
        .expect("genesis bootstrap succeeds"),
    )
}

/// Extends the chain with `count` empty blocks on top of `parent`,
/// returning the headers produced.
pub fn add_blocks(block_state: &BlockState, parent: &Header, count: u32, seed: u8) -> Vec<Header> {
    let mut headers = Vec::new();
    let mut parent = parent.clone();
    for _ in 0..count {
        let header = child_header(&parent, seed);
        block_state
            .add_block(&block_with_body(header.clone(), vec![]))
            .expect("parent is known");
        parent = header.clone();
        headers.push(header);
    }
    headers
}
