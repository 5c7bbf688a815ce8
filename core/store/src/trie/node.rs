use std::collections::HashSet;
use std::sync::Arc;

use filament_primitives::Hash;

/// Reference to a child node: either materialised in memory or known only by
/// its hash (partial tries reconstructed from proofs, unloaded state).
#[derive(Clone, Debug)]
pub enum NodeHandle {
    InMemory(Arc<Node>),
    Hash(Hash),
}

impl NodeHandle {
    pub fn as_node(&self) -> Option<&Arc<Node>> {
        match self {
            Self::InMemory(node) => Some(node),
            Self::Hash(_) => None,
        }
    }
}

/// Children of a branch node.
#[derive(Clone, Debug, Default)]
pub struct Children(pub [Option<NodeHandle>; 16]);

impl Children {
    /// Iterates over existing children; `None` entries are omitted.
    pub fn iter(&self) -> impl Iterator<Item = (u8, &NodeHandle)> {
        self.0.iter().enumerate().flat_map(|(i, el)| Some(i as u8).zip(el.as_ref()))
    }

    pub fn count(&self) -> usize {
        self.0.iter().filter(|child| child.is_some()).count()
    }

    /// The u16 bitmap of occupied slots, bit `i` for child `i`.
    pub fn bitmap(&self) -> u16 {
        let mut bitmap = 0u16;
        for (i, child) in self.0.iter().enumerate() {
            if child.is_some() {
                bitmap |= 1 << i;
            }
        }
        bitmap
    }
}

impl std::ops::Index<u8> for Children {
    type Output = Option<NodeHandle>;
    fn index(&self, index: u8) -> &Option<NodeHandle> {
        &self.0[usize::from(index)]
    }
}

impl std::ops::IndexMut<u8> for Children {
    fn index_mut(&mut self, index: u8) -> &mut Option<NodeHandle> {
        &mut self.0[usize::from(index)]
    }
}

/// Per-node bookkeeping: the dirty flag plus the cached encoding and merkle
/// value. Caches are only valid while the node is clean or untouched since
/// they were computed; any mutation clears them.
#[derive(Clone, Debug, Default)]
pub(crate) struct NodeCache {
    pub dirty: bool,
    pub encoding: Option<Vec<u8>>,
    /// Inline encoding when shorter than a hash, otherwise the 32 byte hash.
    pub merkle_value: Option<Vec<u8>>,
}

#[derive(Clone, Debug)]
pub struct Leaf {
    pub partial_key: Vec<u8>,
    pub value: Vec<u8>,
    pub(crate) cache: NodeCache,
}

#[derive(Clone, Debug)]
pub struct Branch {
    pub partial_key: Vec<u8>,
    pub value: Option<Vec<u8>>,
    pub children: Children,
    /// Number of nodes in this branch's subtree, excluding the branch.
    pub descendants: u32,
    pub(crate) cache: NodeCache,
}

/// A trie node. Keys are nibble paths; branches fan out over the nibble
/// after their partial key.
#[derive(Clone, Debug)]
pub enum Node {
    Leaf(Leaf),
    Branch(Branch),
}

impl Node {
    pub fn new_leaf(partial_key: Vec<u8>, value: Vec<u8>) -> Self {
        Self::Leaf(Leaf { partial_key, value, cache: NodeCache { dirty: true, ..Default::default() } })
    }

    pub fn new_branch(partial_key: Vec<u8>, value: Option<Vec<u8>>) -> Branch {
        Branch {
            partial_key,
            value,
            children: Children::default(),
            descendants: 0,
            cache: NodeCache { dirty: true, ..Default::default() },
        }
    }

    pub fn partial_key(&self) -> &[u8] {
        match self {
            Self::Leaf(leaf) => &leaf.partial_key,
            Self::Branch(branch) => &branch.partial_key,
        }
    }

    pub fn value(&self) -> Option<&[u8]> {
        match self {
            Self::Leaf(leaf) => Some(&leaf.value),
            Self::Branch(branch) => branch.value.as_deref(),
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.cache().dirty
    }

    pub(crate) fn cache(&self) -> &NodeCache {
        match self {
            Self::Leaf(leaf) => &leaf.cache,
            Self::Branch(branch) => &branch.cache,
        }
    }

    pub(crate) fn cache_mut(&mut self) -> &mut NodeCache {
        match self {
            Self::Leaf(leaf) => &mut leaf.cache,
            Self::Branch(branch) => &mut branch.cache,
        }
    }

    /// The cached 32 byte hash, if this node was hashed and is big enough to
    /// be referenced by hash rather than inlined.
    pub(crate) fn cached_hash(&self) -> Option<Hash> {
        self.cache().merkle_value.as_deref().and_then(Hash::from_slice)
    }

    /// Marks the whole node clean without touching the caches. Called after
    /// a successful database flush.
    pub(crate) fn set_clean(&mut self) {
        self.cache_mut().dirty = false;
    }

    /// Prepares the node for mutation: records the previous persisted hash
    /// in `deleted`, sets the dirty flag and clears the caches.
    pub(crate) fn on_mutate(&mut self, deleted: &mut HashSet<Hash>) {
        if !self.is_dirty() {
            if let Some(hash) = self.cached_hash() {
                deleted.insert(hash);
            }
        }
        let cache = self.cache_mut();
        cache.dirty = true;
        cache.encoding = None;
        cache.merkle_value = None;
    }

    /// Records the node's persisted hash when it is removed outright.
    pub(crate) fn on_remove(&self, deleted: &mut HashSet<Hash>) {
        if !self.is_dirty() {
            if let Some(hash) = self.cached_hash() {
                deleted.insert(hash);
            }
        }
    }
}
