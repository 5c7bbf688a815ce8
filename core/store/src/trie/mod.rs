//! In-memory base-16 Merkle-Patricia trie with copy-on-write snapshots.
//!
//! The trie owns a root node and a set of child tries keyed by their root
//! hash. Nodes are shared behind `Arc`; mutating operations duplicate only
//! the nodes on the path from the root to the edit site, so a snapshot taken
//! before the mutation keeps observing the old state.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use once_cell::sync::Lazy;

use filament_primitives::Hash;

mod codec;
mod database;
pub mod nibbles;
mod node;

pub use codec::DecodeError;
pub use node::{Branch, Children, Leaf, Node, NodeHandle};

use nibbles::{common_prefix_len, key_to_nibbles, nibbles_to_key};

/// Keys under this prefix in the main trie hold child trie root hashes.
pub const CHILD_STORAGE_PREFIX: &[u8] = b":child_storage:";

/// Hash of the empty trie: the Blake2b-256 of the empty node encoding.
pub static EMPTY_TRIE_HASH: Lazy<Hash> =
    Lazy::new(|| Hash::hash_bytes(&codec::EMPTY_NODE_ENCODING));

#[derive(Debug, thiserror::Error)]
pub enum TrieError {
    #[error("proof slice empty")]
    EmptyProof,
    #[error("cannot decode node: {0}")]
    DecodeNode(#[from] DecodeError),
    #[error("node {0} is not loaded in memory")]
    NodeNotLoaded(Hash),
    #[error("node {0} not found in database")]
    NodeNotFound(Hash),
    #[error("child trie root at key 0x{} is not a hash", hex::encode(.0))]
    BadChildTrieRoot(Vec<u8>),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Clone, Default, Debug)]
pub struct Trie {
    root: Option<Arc<Node>>,
    child_tries: HashMap<Hash, Trie>,
    /// Hashes of persisted nodes removed or replaced since the last
    /// snapshot.
    deleted: HashSet<Hash>,
}

/// Outcome of probing a node during insertion, decided before any
/// copy-on-write takes place.
enum InsertStep {
    /// Key and value already present as-is.
    Noop,
    /// Same key: overwrite the value in place.
    ReplaceValue,
    /// Leaf with a diverging key: restructure under a new branch.
    SplitLeaf { common: usize },
    /// The key ends exactly on this branch.
    SetBranchValue,
    /// The key continues below this branch.
    Descend { index: u8 },
    /// The key diverges inside this branch's partial key.
    SplitBranch { common: usize },
}

/// Outcome of probing a node during removal.
enum RemoveStep {
    Keep,
    RemoveLeaf,
    RemoveBranchValue,
    Descend { index: u8 },
    Unloaded(Hash),
}

/// How a branch restructures after a removal underneath it.
enum CollapseStep {
    Keep,
    /// No children and no value left: the branch vanishes.
    Vanish,
    /// No children but a value: the branch becomes a leaf.
    ToLeaf { partial_key: Vec<u8>, value: Vec<u8> },
    /// One child and no value: the child absorbs the branch.
    Merge { index: u8 },
}

impl Trie {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn from_root(root: Arc<Node>) -> Self {
        Self { root: Some(root), ..Default::default() }
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    pub fn root_node(&self) -> Option<&Arc<Node>> {
        self.root.as_ref()
    }

    /// A copy-on-write view of the current state. The snapshot shares all
    /// nodes with `self`; mutations on either side duplicate the affected
    /// path only. The snapshot starts a fresh deleted-hash generation.
    pub fn snapshot(&self) -> Trie {
        Trie {
            root: self.root.clone(),
            child_tries: self
                .child_tries
                .iter()
                .map(|(hash, trie)| (*hash, trie.snapshot()))
                .collect(),
            deleted: HashSet::new(),
        }
    }

    /// The merkle root of the trie.
    pub fn hash(&mut self) -> Hash {
        match &mut self.root {
            None => *EMPTY_TRIE_HASH,
            Some(root) => {
                let merkle_value = Arc::make_mut(root).merkle_value(true);
                Hash::from_slice(&merkle_value).expect("root merkle value is a full hash")
            }
        }
    }

    pub fn child_tries(&self) -> &HashMap<Hash, Trie> {
        &self.child_tries
    }

    pub fn insert_child_trie(&mut self, mut child: Trie) -> Hash {
        let hash = child.hash();
        self.child_tries.insert(hash, child);
        hash
    }

    /// Retrieves the value stored under `key`, if any. Children known only
    /// by hash (partial tries) are treated as absent; use
    /// [`Trie::get_from_db`] to look through the backing store.
    pub fn get(&self, key: &[u8]) -> Option<&[u8]> {
        let nibbles = key_to_nibbles(key);
        let mut node: &Node = self.root.as_deref()?;
        let mut remaining: &[u8] = &nibbles;
        loop {
            match node {
                Node::Leaf(leaf) => {
                    return (leaf.partial_key == remaining).then_some(leaf.value.as_slice());
                }
                Node::Branch(branch) => {
                    if remaining == branch.partial_key {
                        return branch.value.as_deref();
                    }
                    if remaining.len() < branch.partial_key.len()
                        || !remaining.starts_with(&branch.partial_key)
                    {
                        return None;
                    }
                    let index = remaining[branch.partial_key.len()];
                    match &branch.children[index] {
                        Some(NodeHandle::InMemory(child)) => {
                            node = child.as_ref();
                            remaining = &remaining[branch.partial_key.len() + 1..];
                        }
                        Some(NodeHandle::Hash(_)) | None => return None,
                    }
                }
            }
        }
    }

    /// Inserts `value` under `key`, replacing any previous value.
    pub fn put(&mut self, key: &[u8], value: &[u8]) -> Result<(), TrieError> {
        let nibbles = key_to_nibbles(key);
        let backup = self.root.clone();
        let handle = self.root.take().map(NodeHandle::InMemory);
        match Self::insert_at(handle, &nibbles, value.to_vec(), &mut self.deleted) {
            Ok((new_root, _added)) => {
                self.root = Some(new_root);
                Ok(())
            }
            Err(err) => {
                self.root = backup;
                Err(err)
            }
        }
    }

    /// Removes the value under `key`. Missing keys are a no-op.
    pub fn delete(&mut self, key: &[u8]) -> Result<(), TrieError> {
        let nibbles = key_to_nibbles(key);
        let Some(root) = self.root.clone() else { return Ok(()) };
        let (new_root, _removed) = Self::remove_at(root, &nibbles, &mut self.deleted)?;
        self.root = new_root;
        Ok(())
    }

    /// Deletes every key starting with `prefix`.
    pub fn clear_prefix(&mut self, prefix: &[u8]) -> Result<(), TrieError> {
        for key in self.get_keys_with_prefix(prefix) {
            self.delete(&key)?;
        }
        Ok(())
    }

    /// All key/value pairs, in lexicographical key order.
    pub fn entries(&self) -> Vec<(Vec<u8>, Vec<u8>)> {
        let mut out = Vec::new();
        if let Some(root) = &self.root {
            let mut path = Vec::new();
            Self::collect_entries(root, &mut path, &mut out);
        }
        out
    }

    pub fn get_keys_with_prefix(&self, prefix: &[u8]) -> Vec<Vec<u8>> {
        self.entries()
            .into_iter()
            .map(|(key, _)| key)
            .filter(|key| key.starts_with(prefix))
            .collect()
    }

    fn collect_entries(node: &Node, path: &mut Vec<u8>, out: &mut Vec<(Vec<u8>, Vec<u8>)>) {
        let depth = path.len();
        path.extend_from_slice(node.partial_key());
        match node {
            Node::Leaf(leaf) => {
                out.push((nibbles_to_key(path), leaf.value.clone()));
            }
            Node::Branch(branch) => {
                if let Some(value) = &branch.value {
                    out.push((nibbles_to_key(path), value.clone()));
                }
                for (index, handle) in branch.children.iter() {
                    if let Some(child) = handle.as_node() {
                        path.push(index);
                        Self::collect_entries(child, path, out);
                        path.pop();
                    }
                }
            }
        }
        path.truncate(depth);
    }

    /// Inserts into the subtree at `handle`, returning the new subtree root
    /// and the number of nodes the subtree grew by.
    fn insert_at(
        handle: Option<NodeHandle>,
        partial: &[u8],
        value: Vec<u8>,
        deleted: &mut HashSet<Hash>,
    ) -> Result<(Arc<Node>, u32), TrieError> {
        let mut node = match handle {
            None => return Ok((Arc::new(Node::new_leaf(partial.to_vec(), value)), 1)),
            Some(NodeHandle::Hash(hash)) => return Err(TrieError::NodeNotLoaded(hash)),
            Some(NodeHandle::InMemory(node)) => node,
        };

        let step = match &*node {
            Node::Leaf(leaf) => {
                if leaf.partial_key == partial {
                    if leaf.value == value {
                        InsertStep::Noop
                    } else {
                        InsertStep::ReplaceValue
                    }
                } else {
                    InsertStep::SplitLeaf {
                        common: common_prefix_len(&leaf.partial_key, partial),
                    }
                }
            }
            Node::Branch(branch) => {
                let common = common_prefix_len(&branch.partial_key, partial);
                if common < branch.partial_key.len() {
                    InsertStep::SplitBranch { common }
                } else if partial.len() == common {
                    if branch.value.as_deref() == Some(value.as_slice()) {
                        InsertStep::Noop
                    } else {
                        InsertStep::SetBranchValue
                    }
                } else {
                    InsertStep::Descend { index: partial[common] }
                }
            }
        };

        match step {
            InsertStep::Noop => Ok((node, 0)),
            InsertStep::ReplaceValue | InsertStep::SetBranchValue => {
                let inner = Arc::make_mut(&mut node);
                inner.on_mutate(deleted);
                match inner {
                    Node::Leaf(leaf) => leaf.value = value,
                    Node::Branch(branch) => branch.value = Some(value),
                }
                Ok((node, 0))
            }
            InsertStep::SplitLeaf { common } => {
                let mut branch = Node::new_branch(partial[..common].to_vec(), None);
                let mut added = 0;

                let (leaf_consumed, leaf_index) = {
                    let Node::Leaf(leaf) = &*node else { unreachable!() };
                    let consumed = leaf.partial_key.len() == common;
                    let index = (!consumed).then(|| leaf.partial_key[common]);
                    (consumed, index)
                };

                if leaf_consumed {
                    // The whole leaf key is the shared prefix: its value
                    // moves onto the branch.
                    let Node::Leaf(leaf) = &*node else { unreachable!() };
                    branch.value = Some(leaf.value.clone());
                    node.on_remove(deleted);
                } else {
                    let index = leaf_index.expect("leaf key extends past the common prefix");
                    let mut child = node.clone();
                    let inner = Arc::make_mut(&mut child);
                    inner.on_mutate(deleted);
                    let Node::Leaf(leaf) = inner else { unreachable!() };
                    let tail = leaf.partial_key.split_off(common + 1);
                    leaf.partial_key = tail;
                    branch.children[index] = Some(NodeHandle::InMemory(child));
                    branch.descendants += 1;
                    added += 1;
                }

                if partial.len() == common {
                    branch.value = Some(value);
                } else {
                    let index = partial[common];
                    let leaf = Node::new_leaf(partial[common + 1..].to_vec(), value);
                    branch.children[index] = Some(NodeHandle::InMemory(Arc::new(leaf)));
                    branch.descendants += 1;
                    added += 1;
                }

                Ok((Arc::new(Node::Branch(branch)), added))
            }
            InsertStep::Descend { index } => {
                let (common, child) = {
                    let Node::Branch(branch) = &*node else { unreachable!() };
                    (branch.partial_key.len(), branch.children[index].clone())
                };
                let previous = match &child {
                    Some(NodeHandle::InMemory(arc)) => Some(arc.clone()),
                    _ => None,
                };
                // Descend before touching this node, so a failure deeper
                // down leaves it untouched.
                let (new_child, added) =
                    Self::insert_at(child, &partial[common + 1..], value, deleted)?;
                if added == 0
                    && previous.as_ref().is_some_and(|prev| Arc::ptr_eq(prev, &new_child))
                {
                    // Value was already present below: nothing changed.
                    return Ok((node, 0));
                }
                let inner = Arc::make_mut(&mut node);
                inner.on_mutate(deleted);
                let Node::Branch(branch) = inner else { unreachable!() };
                branch.children[index] = Some(NodeHandle::InMemory(new_child));
                branch.descendants += added;
                Ok((node, added))
            }
            InsertStep::SplitBranch { common } => {
                let (old_index, old_descendants) = {
                    let Node::Branch(branch) = &*node else { unreachable!() };
                    (branch.partial_key[common], branch.descendants)
                };
                let mut parent = Node::new_branch(partial[..common].to_vec(), None);
                let mut old = node;
                let inner = Arc::make_mut(&mut old);
                inner.on_mutate(deleted);
                let Node::Branch(old_branch) = inner else { unreachable!() };
                let tail = old_branch.partial_key.split_off(common + 1);
                old_branch.partial_key = tail;
                parent.children[old_index] = Some(NodeHandle::InMemory(old));
                parent.descendants = 1 + old_descendants;

                let mut added = 1;
                if partial.len() == common {
                    parent.value = Some(value);
                } else {
                    let index = partial[common];
                    let leaf = Node::new_leaf(partial[common + 1..].to_vec(), value);
                    parent.children[index] = Some(NodeHandle::InMemory(Arc::new(leaf)));
                    parent.descendants += 1;
                    added += 1;
                }
                Ok((Arc::new(Node::Branch(parent)), added))
            }
        }
    }

    /// Removes `partial` from the subtree at `node`, returning the new
    /// subtree root (`None` when it vanished) and the number of nodes the
    /// subtree shrank by.
    fn remove_at(
        mut node: Arc<Node>,
        partial: &[u8],
        deleted: &mut HashSet<Hash>,
    ) -> Result<(Option<Arc<Node>>, u32), TrieError> {
        let step = match &*node {
            Node::Leaf(leaf) => {
                if leaf.partial_key == partial {
                    RemoveStep::RemoveLeaf
                } else {
                    RemoveStep::Keep
                }
            }
            Node::Branch(branch) => {
                if branch.partial_key == partial {
                    if branch.value.is_some() {
                        RemoveStep::RemoveBranchValue
                    } else {
                        RemoveStep::Keep
                    }
                } else if partial.len() <= branch.partial_key.len()
                    || !partial.starts_with(&branch.partial_key)
                {
                    RemoveStep::Keep
                } else {
                    match &branch.children[partial[branch.partial_key.len()]] {
                        None => RemoveStep::Keep,
                        Some(NodeHandle::Hash(hash)) => RemoveStep::Unloaded(*hash),
                        Some(NodeHandle::InMemory(_)) => {
                            RemoveStep::Descend { index: partial[branch.partial_key.len()] }
                        }
                    }
                }
            }
        };

        match step {
            RemoveStep::Keep => Ok((Some(node), 0)),
            RemoveStep::Unloaded(hash) => Err(TrieError::NodeNotLoaded(hash)),
            RemoveStep::RemoveLeaf => {
                node.on_remove(deleted);
                Ok((None, 1))
            }
            RemoveStep::RemoveBranchValue => {
                let inner = Arc::make_mut(&mut node);
                inner.on_mutate(deleted);
                let Node::Branch(branch) = inner else { unreachable!() };
                branch.value = None;
                Self::collapse(node, 0, deleted)
            }
            RemoveStep::Descend { index } => {
                let (skip, child) = {
                    let Node::Branch(branch) = &*node else { unreachable!() };
                    let Some(NodeHandle::InMemory(child)) = &branch.children[index] else {
                        unreachable!()
                    };
                    (branch.partial_key.len() + 1, child.clone())
                };
                let (new_child, removed) =
                    Self::remove_at(child.clone(), &partial[skip..], deleted)?;
                let unchanged = removed == 0
                    && matches!(&new_child, Some(same) if Arc::ptr_eq(same, &child));
                if unchanged {
                    return Ok((Some(node), 0));
                }
                let inner = Arc::make_mut(&mut node);
                inner.on_mutate(deleted);
                let Node::Branch(branch) = inner else { unreachable!() };
                branch.children[index] = new_child.map(NodeHandle::InMemory);
                branch.descendants -= removed;
                Self::collapse(node, removed, deleted)
            }
        }
    }

    /// Restores the branch invariants after a removal: a branch with no
    /// children becomes a leaf (or vanishes), a valueless branch with a
    /// single child merges into it.
    fn collapse(
        node: Arc<Node>,
        removed: u32,
        deleted: &mut HashSet<Hash>,
    ) -> Result<(Option<Arc<Node>>, u32), TrieError> {
        let step = match &*node {
            Node::Leaf(_) => CollapseStep::Keep,
            Node::Branch(branch) => match (branch.children.count(), &branch.value) {
                (0, None) => CollapseStep::Vanish,
                (0, Some(value)) => CollapseStep::ToLeaf {
                    partial_key: branch.partial_key.clone(),
                    value: value.clone(),
                },
                (1, None) => {
                    let (index, _) = branch.children.iter().next().expect("count is one");
                    CollapseStep::Merge { index }
                }
                _ => CollapseStep::Keep,
            },
        };

        match step {
            CollapseStep::Keep => Ok((Some(node), removed)),
            CollapseStep::Vanish => {
                node.on_remove(deleted);
                Ok((None, removed + 1))
            }
            CollapseStep::ToLeaf { partial_key, value } => {
                let leaf = Node::new_leaf(partial_key, value);
                Ok((Some(Arc::new(leaf)), removed))
            }
            CollapseStep::Merge { index } => {
                let (mut child, merged_key) = {
                    let Node::Branch(branch) = &*node else { unreachable!() };
                    let child = match &branch.children[index] {
                        Some(NodeHandle::Hash(hash)) => {
                            return Err(TrieError::NodeNotLoaded(*hash))
                        }
                        Some(NodeHandle::InMemory(child)) => child.clone(),
                        None => unreachable!("merge index points at the only child"),
                    };
                    let mut merged_key = Vec::with_capacity(
                        branch.partial_key.len() + 1 + child.partial_key().len(),
                    );
                    merged_key.extend_from_slice(&branch.partial_key);
                    merged_key.push(index);
                    merged_key.extend_from_slice(child.partial_key());
                    (child, merged_key)
                };

                node.on_remove(deleted);
                let inner = Arc::make_mut(&mut child);
                inner.on_mutate(deleted);
                match inner {
                    Node::Leaf(leaf) => leaf.partial_key = merged_key,
                    Node::Branch(branch) => branch.partial_key = merged_key,
                }
                Ok((Some(child), removed + 1))
            }
        }
    }
}
