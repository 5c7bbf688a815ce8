use std::num::NonZeroUsize;

use lru::LruCache;

use filament_primitives::network::PeerId;
use filament_primitives::Hash;

use crate::messages::VoteMessage;

const TRACKER_CAPACITY: usize = 1000;

/// Bounded holding area for votes that cannot be validated yet: votes for
/// blocks we have not imported, and votes for rounds ahead of ours. Entries
/// are re-fed through validation when the block arrives or the round
/// advances; the LRU bound means the oldest block/round buckets are shed
/// under pressure.
pub(crate) struct VoteTracker {
    by_block: LruCache<Hash, Vec<(PeerId, VoteMessage)>>,
    by_round: LruCache<u64, Vec<(PeerId, VoteMessage)>>,
}

impl VoteTracker {
    pub(crate) fn new() -> Self {
        let capacity = NonZeroUsize::new(TRACKER_CAPACITY).expect("capacity is non-zero");
        Self { by_block: LruCache::new(capacity), by_round: LruCache::new(capacity) }
    }

    /// Defers a vote until its block is imported.
    pub(crate) fn add_block_vote(&mut self, from: PeerId, message: VoteMessage) {
        let block_hash = message.message.block_hash;
        match self.by_block.get_mut(&block_hash) {
            Some(entries) => entries.push((from, message)),
            None => {
                self.by_block.put(block_hash, vec![(from, message)]);
            }
        }
    }

    /// Defers a vote until our round catches up with the message's round.
    pub(crate) fn add_round_vote(&mut self, from: PeerId, message: VoteMessage) {
        let round = message.round;
        match self.by_round.get_mut(&round) {
            Some(entries) => entries.push((from, message)),
            None => {
                self.by_round.put(round, vec![(from, message)]);
            }
        }
    }

    /// Takes all votes deferred on the given block.
    pub(crate) fn drain_block_votes(&mut self, block_hash: &Hash) -> Vec<(PeerId, VoteMessage)> {
        self.by_block.pop(block_hash).unwrap_or_default()
    }

    /// Takes all votes deferred on rounds up to and including `round`.
    pub(crate) fn drain_round_votes(&mut self, round: u64) -> Vec<(PeerId, VoteMessage)> {
        let rounds: Vec<u64> =
            self.by_round.iter().map(|(round, _)| *round).filter(|r| *r <= round).collect();
        let mut drained = Vec::new();
        for round in rounds {
            if let Some(entries) = self.by_round.pop(&round) {
                drained.extend(entries);
            }
        }
        drained
    }

    #[cfg(test)]
    pub(crate) fn deferred_for_block(&self, block_hash: &Hash) -> usize {
        self.by_block.peek(block_hash).map_or(0, Vec::len)
    }

    #[cfg(test)]
    pub(crate) fn deferred_for_round(&self, round: u64) -> usize {
        self.by_round.peek(&round).map_or(0, Vec::len)
    }
}
