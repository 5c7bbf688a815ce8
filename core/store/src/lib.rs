//! The node's storage layer: a columnar key/value facade with atomic batched
//! writes, and the Merkle-Patricia trie that is the canonical state
//! representation.

use std::io;
use std::sync::Arc;

use parity_scale_codec::{Decode, Encode};

mod columns;
pub mod db;
pub mod trie;
pub mod trie_state;

pub use columns::DBCol;
pub use db::{DBTransaction, Database, TestDB};
pub use trie::{Trie, TrieError, EMPTY_TRIE_HASH};
pub use trie_state::TrieState;

/// The node's single storage source. Cheap to clone; all clones share the
/// same backend.
#[derive(Clone)]
pub struct Store {
    pub(crate) storage: Arc<dyn Database>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").finish_non_exhaustive()
    }
}

impl Store {
    pub fn new(storage: Arc<dyn Database>) -> Self {
        Self { storage }
    }

    /// An in-memory store, used by tests and one-off tooling.
    pub fn test_store() -> Self {
        Self::new(Arc::new(TestDB::new()))
    }

    /// Fetches a value from the given column.
    ///
    /// Returns `None` when the key does not exist; `Err` is reserved for
    /// real I/O failures so callers can tell the two apart.
    pub fn get(&self, column: DBCol, key: &[u8]) -> io::Result<Option<Vec<u8>>> {
        let value = self.storage.get_raw_bytes(column, key)?;
        tracing::trace!(
            target: "store",
            db_op = "get",
            col = %column,
            key = %hex::encode(key),
            size = value.as_deref().map(<[u8]>::len),
        );
        Ok(value)
    }

    pub fn get_ser<T: Decode>(&self, column: DBCol, key: &[u8]) -> io::Result<Option<T>> {
        self.get(column, key)?
            .map(|bytes| {
                T::decode(&mut bytes.as_slice())
                    .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
            })
            .transpose()
    }

    pub fn exists(&self, column: DBCol, key: &[u8]) -> io::Result<bool> {
        self.get(column, key).map(|value| value.is_some())
    }

    pub fn store_update(&self) -> StoreUpdate {
        StoreUpdate { transaction: DBTransaction::new(), store: self.clone() }
    }

    pub fn iter<'a>(&'a self, col: DBCol) -> db::DBIterator<'a> {
        self.storage.iter(col)
    }

    pub fn iter_prefix<'a>(&'a self, col: DBCol, key_prefix: &'a [u8]) -> db::DBIterator<'a> {
        self.storage.iter_prefix(col, key_prefix)
    }

    pub fn iter_prefix_ser<'a, T: Decode>(
        &'a self,
        col: DBCol,
        key_prefix: &'a [u8],
    ) -> impl Iterator<Item = io::Result<(Box<[u8]>, T)>> + 'a {
        self.storage.iter_prefix(col, key_prefix).map(|item| {
            item.and_then(|(key, value)| {
                let value = T::decode(&mut value.as_ref())
                    .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
                Ok((key, value))
            })
        })
    }

    pub fn flush(&self) -> io::Result<()> {
        self.storage.flush()
    }
}

/// Accumulates changes and commits them to the database atomically.
///
/// Dropping an update without calling [`StoreUpdate::commit`] discards every
/// staged mutation, which is how a failed batch build rolls back.
pub struct StoreUpdate {
    transaction: DBTransaction,
    store: Store,
}

impl StoreUpdate {
    pub fn set(&mut self, column: DBCol, key: &[u8], value: &[u8]) {
        self.transaction.set(column, key.to_vec(), value.to_vec());
    }

    /// Stages the SCALE encoding of a value.
    pub fn set_ser<T: Encode + ?Sized>(&mut self, column: DBCol, key: &[u8], value: &T) {
        self.set(column, key, &value.encode());
    }

    pub fn delete(&mut self, column: DBCol, key: &[u8]) {
        self.transaction.delete(column, key.to_vec());
    }

    /// Discards all staged operations, leaving the update reusable.
    pub fn reset(&mut self) {
        self.transaction = DBTransaction::new();
    }

    pub fn merge(&mut self, other: StoreUpdate) {
        assert!(std::ptr::eq(
            Arc::as_ptr(&self.store.storage) as *const (),
            Arc::as_ptr(&other.store.storage) as *const (),
        ));
        self.transaction.merge(other.transaction);
    }

    pub fn is_empty(&self) -> bool {
        self.transaction.is_empty()
    }

    pub fn commit(self) -> io::Result<()> {
        tracing::trace!(
            target: "store",
            db_op = "commit",
            ops = self.transaction.ops.len(),
        );
        self.store.storage.write(self.transaction)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_ser_round_trips() {
        let store = Store::test_store();
        let mut update = store.store_update();
        update.set_ser(DBCol::BlockMeta, b"answer", &42u64);
        update.commit().unwrap();

        let value: Option<u64> = store.get_ser(DBCol::BlockMeta, b"answer").unwrap();
        assert_eq!(value, Some(42));
    }

    #[test]
    fn dropped_update_writes_nothing() {
        let store = Store::test_store();
        let mut update = store.store_update();
        update.set(DBCol::BlockMeta, b"key", b"value");
        drop(update);

        assert!(!store.exists(DBCol::BlockMeta, b"key").unwrap());
    }

    #[test]
    fn reset_discards_staged_ops() {
        let store = Store::test_store();
        let mut update = store.store_update();
        update.set(DBCol::BlockMeta, b"key", b"value");
        update.reset();
        assert!(update.is_empty());
        update.commit().unwrap();

        assert!(!store.exists(DBCol::BlockMeta, b"key").unwrap());
    }

    #[test]
    fn missing_key_is_none_not_error() {
        let store = Store::test_store();
        assert_eq!(store.get(DBCol::State, b"nope").unwrap(), None);
    }
}
