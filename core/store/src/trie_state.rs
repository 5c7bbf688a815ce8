use filament_primitives::Hash;

use crate::trie::{Trie, TrieError};

/// Mutable handle on a state trie snapshot, used while executing a block.
///
/// A `TrieState` owns its trie; cloning is cheap and yields an independent
/// copy-on-write view, which is how the same pre-state is handed to several
/// consumers (runtime execution, RPC queries) without interference.
#[derive(Clone, Default)]
pub struct TrieState {
    trie: Trie,
}

impl TrieState {
    pub fn new(trie: Trie) -> Self {
        Self { trie }
    }

    pub fn get(&self, key: &[u8]) -> Option<&[u8]> {
        self.trie.get(key)
    }

    pub fn set(&mut self, key: &[u8], value: &[u8]) -> Result<(), TrieError> {
        self.trie.put(key, value)
    }

    pub fn delete(&mut self, key: &[u8]) -> Result<(), TrieError> {
        self.trie.delete(key)
    }

    pub fn clear_prefix(&mut self, prefix: &[u8]) -> Result<(), TrieError> {
        self.trie.clear_prefix(prefix)
    }

    pub fn root(&mut self) -> Hash {
        self.trie.hash()
    }

    pub fn get_keys_with_prefix(&self, prefix: &[u8]) -> Vec<Vec<u8>> {
        self.trie.get_keys_with_prefix(prefix)
    }

    pub fn trie(&self) -> &Trie {
        &self.trie
    }

    pub fn trie_mut(&mut self) -> &mut Trie {
        &mut self.trie
    }

    pub fn into_trie(self) -> Trie {
        self.trie
    }
}
