use std::collections::BTreeMap;
use std::io;

use parking_lot::RwLock;

use crate::db::{DBIterator, DBOp, DBTransaction, Database};
use crate::DBCol;

/// In-memory database backend. Holds one ordered map per column so prefix
/// iteration behaves like the on-disk backend.
#[derive(Default)]
pub struct TestDB {
    columns: RwLock<[BTreeMap<Vec<u8>, Vec<u8>>; DBCol::COUNT]>,
}

impl TestDB {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Database for TestDB {
    fn get_raw_bytes(&self, col: DBCol, key: &[u8]) -> io::Result<Option<Vec<u8>>> {
        Ok(self.columns.read()[col as usize].get(key).cloned())
    }

    fn iter<'a>(&'a self, col: DBCol) -> DBIterator<'a> {
        // Snapshot the column; iterators must not observe later writes.
        let items: Vec<_> = self.columns.read()[col as usize]
            .iter()
            .map(|(k, v)| Ok((k.clone().into_boxed_slice(), v.clone().into_boxed_slice())))
            .collect();
        Box::new(items.into_iter())
    }

    fn iter_prefix<'a>(&'a self, col: DBCol, key_prefix: &'a [u8]) -> DBIterator<'a> {
        let items: Vec<_> = self.columns.read()[col as usize]
            .range(key_prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(key_prefix))
            .map(|(k, v)| Ok((k.clone().into_boxed_slice(), v.clone().into_boxed_slice())))
            .collect();
        Box::new(items.into_iter())
    }

    fn write(&self, batch: DBTransaction) -> io::Result<()> {
        let mut columns = self.columns.write();
        for op in batch.ops {
            match op {
                DBOp::Set { col, key, value } => {
                    columns[col as usize].insert(key, value);
                }
                DBOp::Delete { col, key } => {
                    columns[col as usize].remove(&key);
                }
            }
        }
        Ok(())
    }

    fn flush(&self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_is_atomic_per_batch() {
        let db = TestDB::new();
        let mut batch = DBTransaction::new();
        batch.set(DBCol::State, vec![1], vec![10]);
        batch.set(DBCol::State, vec![2], vec![20]);
        db.write(batch).unwrap();

        assert_eq!(db.get_raw_bytes(DBCol::State, &[1]).unwrap(), Some(vec![10]));
        assert_eq!(db.get_raw_bytes(DBCol::State, &[2]).unwrap(), Some(vec![20]));
        assert_eq!(db.get_raw_bytes(DBCol::State, &[3]).unwrap(), None);
    }

    #[test]
    fn prefix_iteration_is_scoped() {
        let db = TestDB::new();
        let mut batch = DBTransaction::new();
        batch.set(DBCol::Epoch, b"epochinfo\x01".to_vec(), vec![1]);
        batch.set(DBCol::Epoch, b"epochinfo\x02".to_vec(), vec![2]);
        batch.set(DBCol::Epoch, b"configinfo\x01".to_vec(), vec![3]);
        db.write(batch).unwrap();

        let found: Vec<_> =
            db.iter_prefix(DBCol::Epoch, b"epochinfo").map(|item| item.unwrap().1).collect();
        assert_eq!(found, vec![vec![1].into_boxed_slice(), vec![2].into_boxed_slice()]);
    }

    #[test]
    fn columns_are_independent() {
        let db = TestDB::new();
        let mut batch = DBTransaction::new();
        batch.set(DBCol::BlockHeader, vec![9], vec![1]);
        db.write(batch).unwrap();

        assert_eq!(db.get_raw_bytes(DBCol::BlockBody, &[9]).unwrap(), None);
    }
}
