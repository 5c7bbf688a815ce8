use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use filament_primitives::Hash;
use filament_store::{Store, Trie, TrieState};

use crate::block_state::BlockState;
use crate::error::Error;

/// Storage state: snapshot tries keyed by their state root, one per
/// imported block, plus load-on-demand from the backing store.
pub struct StorageState {
    store: Store,
    block_state: Arc<BlockState>,
    tries: RwLock<HashMap<Hash, Trie>>,
}

impl StorageState {
    pub fn new(store: Store, block_state: Arc<BlockState>) -> Self {
        Self { store, block_state, tries: RwLock::new(HashMap::new()) }
    }

    /// Registers a trie snapshot without touching the database. Used for
    /// the genesis trie, which is stored wholesale elsewhere.
    pub fn register_trie(&self, trie: &mut Trie) {
        let root = trie.hash();
        self.tries.write().insert(root, trie.snapshot());
    }

    /// Persists the dirty nodes of a post-state trie and caches a snapshot
    /// of it under its root. Returns the root.
    pub fn store_trie(&self, trie_state: &mut TrieState) -> Result<Hash, Error> {
        let trie = trie_state.trie_mut();
        trie.write_dirty(&self.store)?;
        let root = trie.hash();
        self.tries.write().insert(root, trie.snapshot());
        tracing::trace!(target: "storage", state_root = %root, "trie stored");
        Ok(root)
    }

    /// A mutable trie state over the snapshot with the given root, or over
    /// the best block's post-state when `root` is `None`. The handle is a
    /// copy-on-write view; the cached snapshot stays intact.
    pub fn trie_state(&self, root: Option<Hash>) -> Result<TrieState, Error> {
        let root = match root {
            Some(root) => root,
            None => self.block_state.best_block_state_root()?,
        };
        if let Some(trie) = self.tries.read().get(&root) {
            return Ok(TrieState::new(trie.snapshot()));
        }
        let trie = self.load_from_db(root)?;
        Ok(TrieState::new(trie))
    }

    /// Reconstructs the trie with the given root from the database and
    /// caches it.
    pub fn load_from_db(&self, root: Hash) -> Result<Trie, Error> {
        let trie = Trie::load(&self.store, root)?;
        self.tries.write().insert(root, trie.snapshot());
        Ok(trie)
    }

    /// Reads a single storage key at the given state root, going through
    /// the cache when possible and the database otherwise.
    pub fn get_storage(&self, root: Hash, key: &[u8]) -> Result<Option<Vec<u8>>, Error> {
        if let Some(trie) = self.tries.read().get(&root) {
            return Ok(trie.get(key).map(<[u8]>::to_vec));
        }
        Ok(Trie::get_from_db(&self.store, root, key)?)
    }
}

#[cfg(test)]
mod tests {
    use filament_store::EMPTY_TRIE_HASH;

    use super::*;
    use crate::test_utils::{genesis_block_state, genesis_header};

    fn storage_state() -> StorageState {
        let store = Store::test_store();
        let block_state = genesis_block_state(store.clone());
        StorageState::new(store, block_state)
    }

    #[test]
    fn store_then_reopen_round_trips() {
        let storage = storage_state();
        let mut trie_state = TrieState::default();
        trie_state.set(b"key", b"value").unwrap();
        let root = storage.store_trie(&mut trie_state).unwrap();

        let reopened = storage.trie_state(Some(root)).unwrap();
        assert_eq!(reopened.get(b"key"), Some(b"value".as_slice()));
        assert_eq!(storage.get_storage(root, b"key").unwrap(), Some(b"value".to_vec()));
    }

    #[test]
    fn trie_state_defaults_to_best_block_root() {
        let storage = storage_state();
        // The genesis state root is the empty trie.
        assert_eq!(genesis_header().state_root, *EMPTY_TRIE_HASH);
        let state = storage.trie_state(None).unwrap();
        assert_eq!(state.get(b"anything"), None);
    }

    #[test]
    fn handed_out_states_do_not_alias_the_snapshot() {
        let storage = storage_state();
        let mut trie_state = TrieState::default();
        trie_state.set(b"key", b"original").unwrap();
        let root = storage.store_trie(&mut trie_state).unwrap();

        let mut first = storage.trie_state(Some(root)).unwrap();
        first.set(b"key", b"mutated").unwrap();

        let second = storage.trie_state(Some(root)).unwrap();
        assert_eq!(second.get(b"key"), Some(b"original".as_slice()));
    }
}
