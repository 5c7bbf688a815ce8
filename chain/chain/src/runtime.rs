use std::sync::Arc;

use filament_primitives::transaction::{TransactionValidityError, Validity};
use filament_primitives::{Extrinsic, Hash};
use filament_store::TrieState;

use crate::error::RuntimeError;

/// Version information reported by a runtime.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RuntimeVersion {
    pub spec_name: String,
    pub impl_name: String,
    pub authoring_version: u32,
    pub spec_version: u32,
    pub impl_version: u32,
    pub transaction_version: u32,
}

/// Interface of an instantiated WASM runtime. The executor itself lives
/// behind this boundary; the core only routes calls into it.
pub trait Runtime: Send + Sync {
    fn version(&self) -> RuntimeVersion;

    fn metadata(&self) -> Vec<u8>;

    /// Asks the runtime whether `extrinsic` is valid under the storage
    /// context previously set with [`Runtime::set_context_storage`].
    fn validate_transaction(
        &self,
        extrinsic: &Extrinsic,
    ) -> Result<Validity, TransactionValidityError>;

    /// Points the runtime's host storage interface at the given trie state.
    fn set_context_storage(&self, trie_state: TrieState);

    /// Blake2b-256 of the WASM blob this runtime was instantiated from.
    fn code_hash(&self) -> Hash;
}

impl std::fmt::Debug for dyn Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime").field("code_hash", &self.code_hash()).finish()
    }
}

/// Creates runtime instances from WASM blobs. The production implementation
/// wraps the WASM host; tests inject lightweight fakes.
pub trait RuntimeInstantiator: Send + Sync {
    fn instantiate(&self, code: &[u8]) -> Result<Arc<dyn Runtime>, RuntimeError>;
}

impl std::fmt::Debug for dyn RuntimeInstantiator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeInstantiator").finish_non_exhaustive()
    }
}

impl<F> RuntimeInstantiator for F
where
    F: Fn(&[u8]) -> Result<Arc<dyn Runtime>, RuntimeError> + Send + Sync,
{
    fn instantiate(&self, code: &[u8]) -> Result<Arc<dyn Runtime>, RuntimeError> {
        self(code)
    }
}
