use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use filament_primitives::{Block, BlockNumber, Body, Hash, Header, CODE_KEY};
use filament_store::{DBCol, Store, TrieState};

use crate::error::Error;
use crate::runtime::{Runtime, RuntimeInstantiator};

const GENESIS_HASH_KEY: &[u8] = b"genesis_hash";
const HIGHEST_ROUND_AND_SET_ID_KEY: &[u8] = b"hfin";

fn finalised_hash_key(round: u64, set_id: u64) -> Vec<u8> {
    let mut key = b"finalised".to_vec();
    key.extend_from_slice(&round.to_le_bytes());
    key.extend_from_slice(&set_id.to_le_bytes());
    key
}

/// Unfinalised part of the chain, held in memory. Headers and bodies only
/// reach the database once their block is on the finalised chain, so a
/// database hit doubles as an "on the finalised chain" check.
#[derive(Default, Debug)]
struct Unfinalised {
    headers: HashMap<Hash, Header>,
    bodies: HashMap<Hash, Body>,
    /// Blocks without known children, mapped to their number. The best
    /// chain is the leaf of greatest number, ties broken by smallest hash.
    leaves: HashMap<Hash, BlockNumber>,
}

/// Tracks blocks, their ancestry and the runtime responsible for each.
#[derive(Debug)]
pub struct BlockState {
    store: Store,
    genesis_hash: Hash,
    unfinalised: RwLock<Unfinalised>,
    runtimes: RwLock<HashMap<Hash, Arc<dyn Runtime>>>,
    instantiator: Arc<dyn RuntimeInstantiator>,
}

impl BlockState {
    /// Bootstraps block state from a genesis header. The genesis block is
    /// persisted immediately and counts as finalised at `(round 0, set 0)`.
    pub fn new_from_genesis(
        store: Store,
        genesis_header: &Header,
        genesis_runtime: Arc<dyn Runtime>,
        instantiator: Arc<dyn RuntimeInstantiator>,
    ) -> Result<Self, Error> {
        let genesis_hash = genesis_header.hash();
        let mut update = store.store_update();
        update.set_ser(DBCol::BlockHeader, genesis_hash.as_bytes(), genesis_header);
        update.set_ser(DBCol::BlockBody, genesis_hash.as_bytes(), &Body::default());
        update.set_ser(DBCol::NumberToHash, &0u32.to_le_bytes(), &genesis_hash);
        update.set(DBCol::BlockMeta, GENESIS_HASH_KEY, genesis_hash.as_bytes());
        update.set_ser(DBCol::BlockMeta, &finalised_hash_key(0, 0), &genesis_hash);
        update.set_ser(DBCol::BlockMeta, HIGHEST_ROUND_AND_SET_ID_KEY, &(0u64, 0u64));
        update.commit()?;

        let state = Self {
            store,
            genesis_hash,
            unfinalised: RwLock::new(Unfinalised::default()),
            runtimes: RwLock::new(HashMap::new()),
            instantiator,
        };
        state.unfinalised.write().leaves.insert(genesis_hash, 0);
        state.store_runtime(genesis_hash, genesis_runtime);
        Ok(state)
    }

    /// Reopens block state over an existing database. The unfinalised tree
    /// restarts from the highest finalised block.
    pub fn new(store: Store, instantiator: Arc<dyn RuntimeInstantiator>) -> Result<Self, Error> {
        let genesis_hash = store
            .get(DBCol::BlockMeta, GENESIS_HASH_KEY)?
            .and_then(|bytes| Hash::from_slice(&bytes))
            .ok_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::NotFound, "genesis hash not in database")
            })?;
        let state = Self {
            store,
            genesis_hash,
            unfinalised: RwLock::new(Unfinalised::default()),
            runtimes: RwLock::new(HashMap::new()),
            instantiator,
        };
        let head = state.get_highest_finalised_header()?;
        state.unfinalised.write().leaves.insert(head.hash(), head.number);
        Ok(state)
    }

    pub fn genesis_hash(&self) -> Hash {
        self.genesis_hash
    }

    /// Adds a block to the unfinalised tree. Its parent must be known.
    pub fn add_block(&self, block: &Block) -> Result<(), Error> {
        let hash = block.header.hash();
        let parent = block.header.parent_hash;
        if !self.has_header(&parent)? {
            return Err(Error::ParentNotFound(parent));
        }
        let mut unfinalised = self.unfinalised.write();
        unfinalised.headers.insert(hash, block.header.clone());
        unfinalised.bodies.insert(hash, block.body.clone());
        unfinalised.leaves.remove(&parent);
        unfinalised.leaves.insert(hash, block.header.number);
        tracing::debug!(target: "chain", block = %hash, number = block.header.number, "block added");
        Ok(())
    }

    pub fn has_header(&self, hash: &Hash) -> Result<bool, Error> {
        if self.unfinalised.read().headers.contains_key(hash) {
            return Ok(true);
        }
        self.has_header_in_database(hash)
    }

    /// Whether the header was persisted, which only happens when the block
    /// is on the finalised chain.
    pub fn has_header_in_database(&self, hash: &Hash) -> Result<bool, Error> {
        Ok(self.store.exists(DBCol::BlockHeader, hash.as_bytes())?)
    }

    pub fn get_header(&self, hash: &Hash) -> Result<Header, Error> {
        if let Some(header) = self.unfinalised.read().headers.get(hash) {
            return Ok(header.clone());
        }
        self.store
            .get_ser::<Header>(DBCol::BlockHeader, hash.as_bytes())?
            .ok_or(Error::BlockDoesNotExist(*hash))
    }

    pub fn get_block_body(&self, hash: &Hash) -> Result<Body, Error> {
        if let Some(body) = self.unfinalised.read().bodies.get(hash) {
            return Ok(body.clone());
        }
        self.store
            .get_ser::<Body>(DBCol::BlockBody, hash.as_bytes())?
            .ok_or(Error::BodyNotFound(*hash))
    }

    /// Current leaves of the block tree.
    pub fn leaves(&self) -> Vec<Hash> {
        self.unfinalised.read().leaves.keys().copied().collect()
    }

    pub fn best_block_hash(&self) -> Hash {
        let unfinalised = self.unfinalised.read();
        unfinalised
            .leaves
            .iter()
            .max_by(|(hash_a, number_a), (hash_b, number_b)| {
                number_a.cmp(number_b).then_with(|| hash_b.cmp(hash_a))
            })
            .map(|(hash, _)| *hash)
            .unwrap_or(self.genesis_hash)
    }

    pub fn best_block_header(&self) -> Result<Header, Error> {
        self.get_header(&self.best_block_hash())
    }

    pub fn best_block_state_root(&self) -> Result<Hash, Error> {
        Ok(self.best_block_header()?.state_root)
    }

    /// Canonical block hash for a number, once that part of the chain was
    /// finalised; unfinalised numbers are resolved along the best chain.
    pub fn get_hash_by_number(&self, number: BlockNumber) -> Result<Hash, Error> {
        if let Some(hash) =
            self.store.get_ser::<Hash>(DBCol::NumberToHash, &number.to_le_bytes())?
        {
            return Ok(hash);
        }
        let mut header = self.best_block_header()?;
        loop {
            if header.number == number {
                return Ok(header.hash());
            }
            if header.number < number {
                return Err(Error::BlockDoesNotExist(self.best_block_hash()));
            }
            header = self.get_header(&header.parent_hash)?;
        }
    }

    /// Returns true iff `descendant` is reachable by walking parent
    /// pointers down to `ancestor`. A block is its own descendant.
    pub fn is_descendant_of(&self, ancestor: &Hash, descendant: &Hash) -> Result<bool, Error> {
        let ancestor_header = match self.get_header(ancestor) {
            Ok(header) => header,
            Err(Error::BlockDoesNotExist(hash)) => return Err(Error::StartNodeNotFound(hash)),
            Err(err) => return Err(err),
        };
        let mut current = match self.get_header(descendant) {
            Ok(header) => header,
            Err(Error::BlockDoesNotExist(hash)) => return Err(Error::EndNodeNotFound(hash)),
            Err(err) => return Err(err),
        };
        while current.number > ancestor_header.number {
            if current.parent_hash == *ancestor {
                return Ok(true);
            }
            current = self.get_header(&current.parent_hash)?;
        }
        Ok(current.hash() == *ancestor)
    }

    /// The common ancestor of `a` and `b` of greatest number.
    pub fn highest_common_ancestor(&self, a: &Hash, b: &Hash) -> Result<Hash, Error> {
        let mut header_a = match self.get_header(a) {
            Ok(header) => header,
            Err(Error::BlockDoesNotExist(hash)) => return Err(Error::StartNodeNotFound(hash)),
            Err(err) => return Err(err),
        };
        let mut header_b = match self.get_header(b) {
            Ok(header) => header,
            Err(Error::BlockDoesNotExist(hash)) => return Err(Error::EndNodeNotFound(hash)),
            Err(err) => return Err(err),
        };
        while header_a.number > header_b.number {
            header_a = self.get_header(&header_a.parent_hash)?;
        }
        while header_b.number > header_a.number {
            header_b = self.get_header(&header_b.parent_hash)?;
        }
        while header_a.hash() != header_b.hash() {
            if header_a.number == 0 {
                return Err(Error::DescendantNotFound { ancestor: *a, descendant: *b });
            }
            header_a = self.get_header(&header_a.parent_hash)?;
            header_b = self.get_header(&header_b.parent_hash)?;
        }
        Ok(header_a.hash())
    }

    /// Marks `hash` finalised for `(round, set_id)`: persists the chain
    /// from the previous finalised block up to `hash` and records the new
    /// finalised head.
    pub fn set_finalised_hash(&self, hash: &Hash, round: u64, set_id: u64) -> Result<(), Error> {
        let mut to_persist = Vec::new();
        let mut current = *hash;
        while !self.has_header_in_database(&current)? {
            let header = self.get_header(&current)?;
            let parent = header.parent_hash;
            to_persist.push(header);
            current = parent;
        }

        let unfinalised = self.unfinalised.read();
        let mut update = self.store.store_update();
        for header in &to_persist {
            let block_hash = header.hash();
            update.set_ser(DBCol::BlockHeader, block_hash.as_bytes(), header);
            if let Some(body) = unfinalised.bodies.get(&block_hash) {
                update.set_ser(DBCol::BlockBody, block_hash.as_bytes(), body);
            }
            update.set_ser(DBCol::NumberToHash, &header.number.to_le_bytes(), &block_hash);
        }
        update.set_ser(DBCol::BlockMeta, &finalised_hash_key(round, set_id), hash);
        update.set_ser(DBCol::BlockMeta, HIGHEST_ROUND_AND_SET_ID_KEY, &(round, set_id));
        update.commit()?;
        drop(unfinalised);

        tracing::info!(target: "chain", block = %hash, round, set_id, "block finalised");
        Ok(())
    }

    /// The block finalised in the given GRANDPA round.
    pub fn get_finalised_header(&self, round: u64, set_id: u64) -> Result<Header, Error> {
        let hash = self
            .store
            .get_ser::<Hash>(DBCol::BlockMeta, &finalised_hash_key(round, set_id))?
            .ok_or(Error::FinalisedHeadNotFound { round, set_id })?;
        self.get_header(&hash)
    }

    pub fn get_highest_finalised_header(&self) -> Result<Header, Error> {
        let (round, set_id) = self
            .store
            .get_ser::<(u64, u64)>(DBCol::BlockMeta, HIGHEST_ROUND_AND_SET_ID_KEY)?
            .ok_or(Error::FinalisedHeadNotFound { round: 0, set_id: 0 })?;
        self.get_finalised_header(round, set_id)
    }

    /// The runtime registered for the given block, or for the best block
    /// when `hash` is `None`. Falls back to the nearest ancestor with a
    /// registered runtime.
    pub fn get_runtime(&self, hash: Option<&Hash>) -> Result<Arc<dyn Runtime>, Error> {
        let start = hash.copied().unwrap_or_else(|| self.best_block_hash());
        let runtimes = self.runtimes.read();
        let mut current = start;
        loop {
            if let Some(runtime) = runtimes.get(&current) {
                return Ok(runtime.clone());
            }
            if current == self.genesis_hash {
                return Err(Error::RuntimeNotFound(start));
            }
            // get_header takes the unfinalised lock, not the runtimes lock,
            // so holding `runtimes` across it is fine.
            current = self.get_header(&current)?.parent_hash;
        }
    }

    pub fn store_runtime(&self, hash: Hash, runtime: Arc<dyn Runtime>) {
        self.runtimes.write().insert(hash, runtime);
    }

    /// Detects a runtime upgrade in the post-state of a freshly imported
    /// block: when the `:code` blob changed relative to the parent runtime,
    /// a new runtime is instantiated and registered for `block_hash`;
    /// otherwise the parent runtime is shared.
    pub fn handle_runtime_changes(
        &self,
        trie_state: &TrieState,
        parent_runtime: Arc<dyn Runtime>,
        block_hash: Hash,
    ) -> Result<(), Error> {
        let code = trie_state.get(CODE_KEY).ok_or(Error::CodeEmpty)?;
        let code_hash = Hash::hash_bytes(code);
        if code_hash == parent_runtime.code_hash() {
            self.store_runtime(block_hash, parent_runtime);
            return Ok(());
        }

        let new_runtime = self.instantiator.instantiate(code)?;
        tracing::info!(
            target: "chain",
            block = %block_hash,
            old_spec = parent_runtime.version().spec_version,
            new_spec = new_runtime.version().spec_version,
            "runtime upgraded",
        );
        self.store_runtime(block_hash, new_runtime);
        Ok(())
    }
}
