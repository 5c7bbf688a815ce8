//! Transaction pool: keeps track of extrinsics that were validated but not
//! yet included in a block.

use std::collections::{BTreeMap, HashMap};

use filament_primitives::transaction::Validity;
use filament_primitives::{Extrinsic, Hash};

/// An extrinsic together with the validity the runtime assigned to it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValidTransaction {
    pub extrinsic: Extrinsic,
    pub validity: Validity,
}

impl ValidTransaction {
    pub fn new(extrinsic: Extrinsic, validity: Validity) -> Self {
        Self { extrinsic, validity }
    }

    pub fn hash(&self) -> Hash {
        Hash::hash_bytes(self.extrinsic.as_bytes())
    }
}

/// Ordering key: highest priority first, then first-in-first-out among equal
/// priorities. `BTreeMap::pop_last` yields the best transaction.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug)]
struct PoolKey {
    priority: u64,
    order: std::cmp::Reverse<u64>,
}

/// Priority-ordered set of valid transactions.
///
/// Not internally synchronised; the core service owns the pool behind its
/// own lock.
#[derive(Default)]
pub struct TransactionPool {
    transactions: BTreeMap<PoolKey, ValidTransaction>,
    /// Extrinsic hash to ordering key, for removal by extrinsic bytes and
    /// duplicate suppression.
    by_extrinsic: HashMap<Hash, PoolKey>,
    next_order: u64,
}

impl TransactionPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a transaction that passed validation. Re-inserting the same
    /// extrinsic replaces its validity (and hence its position).
    pub fn insert(&mut self, transaction: ValidTransaction) -> Hash {
        let hash = transaction.hash();
        if let Some(previous) = self.by_extrinsic.remove(&hash) {
            self.transactions.remove(&previous);
        }
        let key = PoolKey {
            priority: transaction.validity.priority,
            order: std::cmp::Reverse(self.next_order),
        };
        self.next_order += 1;
        tracing::trace!(target: "txpool", tx = %hash, priority = key.priority, "pool insert");
        self.by_extrinsic.insert(hash, key);
        self.transactions.insert(key, transaction);
        hash
    }

    /// Removes and returns the highest-priority transaction.
    pub fn pop(&mut self) -> Option<ValidTransaction> {
        let (_, transaction) = self.transactions.pop_last()?;
        self.by_extrinsic.remove(&transaction.hash());
        Some(transaction)
    }

    /// Looks at the highest-priority transaction without removing it.
    pub fn peek(&self) -> Option<&ValidTransaction> {
        self.transactions.last_key_value().map(|(_, transaction)| transaction)
    }

    /// Removes the transaction carrying exactly these extrinsic bytes, e.g.
    /// because a block including it was imported.
    pub fn remove_extrinsic(&mut self, extrinsic: &Extrinsic) -> Option<ValidTransaction> {
        let hash = Hash::hash_bytes(extrinsic.as_bytes());
        let key = self.by_extrinsic.remove(&hash)?;
        self.transactions.remove(&key)
    }

    /// All pooled transactions, best first.
    pub fn pending(&self) -> Vec<ValidTransaction> {
        self.transactions.values().rev().cloned().collect()
    }

    pub fn contains(&self, extrinsic: &Extrinsic) -> bool {
        self.by_extrinsic.contains_key(&Hash::hash_bytes(extrinsic.as_bytes()))
    }

    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }
}
