//! Trie persistence: every node is stored under the Blake2b-256 of its
//! encoding in the `State` column, so the same store can hold any number of
//! tries (and all historical versions) without key collisions.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use filament_primitives::Hash;

use crate::trie::codec::decode_node;
use crate::trie::node::{Node, NodeHandle};
use crate::trie::{Trie, TrieError, CHILD_STORAGE_PREFIX, EMPTY_TRIE_HASH};
use crate::{DBCol, Store, StoreUpdate};

impl Trie {
    /// Writes every reachable node to the store in one batch, child tries
    /// first, and marks the whole trie clean. Generally only used for the
    /// genesis trie; incremental writes go through [`Trie::write_dirty`].
    pub fn store(&mut self, store: &Store) -> Result<(), TrieError> {
        for child in self.child_tries.values_mut() {
            child.store(store)?;
        }
        let Some(root) = &mut self.root else { return Ok(()) };
        // Prime the root's merkle cache so a later mutation can record the
        // replaced root hash in the deleted set.
        Arc::make_mut(root).merkle_value(true);
        let mut update = store.store_update();
        store_node(Arc::make_mut(root), &mut update, false);
        update.commit()?;
        mark_clean(Arc::make_mut(root));
        Ok(())
    }

    /// Writes all dirty nodes to the store and marks them clean. Nothing is
    /// marked clean unless the whole batch lands: an error while building or
    /// flushing drops the batch without partial writes.
    pub fn write_dirty(&mut self, store: &Store) -> Result<(), TrieError> {
        let mut update = store.store_update();
        if let Some(root) = &mut self.root {
            Arc::make_mut(root).merkle_value(true);
            store_node(Arc::make_mut(root), &mut update, true);
        }
        for child in self.child_tries.values_mut() {
            if let Some(root) = &mut child.root {
                Arc::make_mut(root).merkle_value(true);
                store_node(Arc::make_mut(root), &mut update, true);
            }
        }
        if update.is_empty() {
            return Ok(());
        }
        update.commit()?;
        if let Some(root) = &mut self.root {
            mark_clean(Arc::make_mut(root));
        }
        for child in self.child_tries.values_mut() {
            if let Some(root) = &mut child.root {
                mark_clean(Arc::make_mut(root));
            }
        }
        Ok(())
    }

    /// Hashes of all nodes [`Trie::write_dirty`] would persist, i.e. every
    /// node inserted since the last snapshot. Clean subtrees are skipped
    /// wholesale since a clean node can only have clean descendants.
    pub fn inserted_node_hashes(&mut self) -> HashSet<Hash> {
        let mut hashes = HashSet::new();
        if let Some(root) = &mut self.root {
            collect_dirty_hashes(Arc::make_mut(root), &mut hashes);
        }
        hashes
    }

    /// Hashes of all persisted nodes deleted since the last snapshot.
    pub fn deleted_node_hashes(&self) -> HashSet<Hash> {
        self.deleted.clone()
    }

    /// Reconstructs a full trie from the store, then loads every child trie
    /// registered under the `:child_storage:` key space.
    pub fn load(store: &Store, root_hash: Hash) -> Result<Trie, TrieError> {
        if root_hash == *EMPTY_TRIE_HASH {
            return Ok(Trie::new());
        }
        let mut trie = Trie::from_root(Arc::new(load_node(store, root_hash)?));

        for key in trie.get_keys_with_prefix(CHILD_STORAGE_PREFIX) {
            let child_root = trie
                .get(&key)
                .and_then(Hash::from_slice)
                .ok_or_else(|| TrieError::BadChildTrieRoot(key.clone()))?;
            let child = Trie::load(store, child_root)?;
            trie.child_tries.insert(child_root, child);
        }
        Ok(trie)
    }

    /// Builds a partial trie out of a proof: a sequence of encoded nodes
    /// containing the root and any subset of its descendants. Children whose
    /// encodings are not part of the proof stay as hash-only pointers.
    pub fn load_from_proof(
        encoded_proof_nodes: &[Vec<u8>],
        root_hash: Hash,
    ) -> Result<Trie, TrieError> {
        if encoded_proof_nodes.is_empty() {
            return Err(TrieError::EmptyProof);
        }

        let mut proof_nodes = HashMap::with_capacity(encoded_proof_nodes.len());
        for encoding in encoded_proof_nodes {
            let mut node = decode_node(&mut encoding.as_slice())?;
            let hash = Hash::hash_bytes(encoding);
            node.cache_mut().encoding = Some(encoding.clone());
            node.cache_mut().merkle_value = Some(hash.0.to_vec());
            proof_nodes.insert(hash, Arc::new(node));
        }

        let mut root =
            proof_nodes.get(&root_hash).cloned().ok_or(TrieError::NodeNotFound(root_hash))?;
        attach_proof_children(&mut root, &proof_nodes);
        Ok(Trie::from_root(root))
    }

    /// Looks a single key up directly through the store, decoding only the
    /// nodes on the path instead of materialising the whole trie.
    pub fn get_from_db(
        store: &Store,
        root_hash: Hash,
        key: &[u8],
    ) -> Result<Option<Vec<u8>>, TrieError> {
        if root_hash == *EMPTY_TRIE_HASH {
            return Ok(None);
        }
        let root = fetch_and_decode(store, root_hash)?;
        let nibbles = super::nibbles::key_to_nibbles(key);
        get_from_db_at(store, &root, &nibbles)
    }
}

fn store_node(node: &mut Node, update: &mut StoreUpdate, dirty_only: bool) {
    if dirty_only && !node.is_dirty() {
        return;
    }
    let encoding = node.encoding();
    let hash = Hash::hash_bytes(&encoding);
    update.set(DBCol::State, hash.as_bytes(), &encoding);
    if let Node::Branch(branch) = node {
        for handle in branch.children.0.iter_mut().flatten() {
            if let NodeHandle::InMemory(child) = handle {
                store_node(Arc::make_mut(child), update, dirty_only);
            }
        }
    }
}

fn mark_clean(node: &mut Node) {
    if !node.is_dirty() {
        return;
    }
    node.set_clean();
    if let Node::Branch(branch) = node {
        for handle in branch.children.0.iter_mut().flatten() {
            if let NodeHandle::InMemory(child) = handle {
                mark_clean(Arc::make_mut(child));
            }
        }
    }
}

fn collect_dirty_hashes(node: &mut Node, hashes: &mut HashSet<Hash>) {
    if !node.is_dirty() {
        return;
    }
    hashes.insert(node.node_hash());
    if let Node::Branch(branch) = node {
        for handle in branch.children.0.iter_mut().flatten() {
            if let NodeHandle::InMemory(child) = handle {
                collect_dirty_hashes(Arc::make_mut(child), hashes);
            }
        }
    }
}

fn fetch_and_decode(store: &Store, hash: Hash) -> Result<Node, TrieError> {
    let encoding =
        store.get(DBCol::State, hash.as_bytes())?.ok_or(TrieError::NodeNotFound(hash))?;
    let mut node = decode_node(&mut encoding.as_slice())?;
    node.cache_mut().encoding = Some(encoding);
    node.cache_mut().merkle_value = Some(hash.0.to_vec());
    Ok(node)
}

/// Fetches and decodes the node stored under `hash`, then materialises its
/// whole subtree.
fn load_node(store: &Store, hash: Hash) -> Result<Node, TrieError> {
    let mut node = fetch_and_decode(store, hash)?;
    load_children(store, &mut node)?;
    Ok(node)
}

fn load_children(store: &Store, node: &mut Node) -> Result<(), TrieError> {
    let Node::Branch(branch) = node else { return Ok(()) };
    let mut extra_descendants = 0;
    for slot in branch.children.0.iter_mut() {
        match slot {
            None => {}
            Some(NodeHandle::InMemory(child)) => {
                // Inlined child, decoded together with this node.
                let child = Arc::make_mut(child);
                load_children(store, child)?;
                if let Node::Branch(branch) = &*child {
                    extra_descendants += branch.descendants;
                }
            }
            Some(NodeHandle::Hash(hash)) => {
                let child = load_node(store, *hash)?;
                if let Node::Branch(branch) = &child {
                    extra_descendants += branch.descendants;
                }
                *slot = Some(NodeHandle::InMemory(Arc::new(child)));
            }
        }
    }
    branch.descendants += extra_descendants;
    Ok(())
}

fn attach_proof_children(node: &mut Arc<Node>, proof_nodes: &HashMap<Hash, Arc<Node>>) {
    let needs_attach = match &**node {
        Node::Leaf(_) => false,
        Node::Branch(branch) => branch.children.0.iter().flatten().any(|handle| match handle {
            NodeHandle::Hash(hash) => proof_nodes.contains_key(hash),
            NodeHandle::InMemory(_) => true,
        }),
    };
    if !needs_attach {
        return;
    }
    let inner = Arc::make_mut(node);
    let Node::Branch(branch) = inner else { return };
    for slot in branch.children.0.iter_mut() {
        match slot {
            None => {}
            Some(NodeHandle::InMemory(child)) => attach_proof_children(child, proof_nodes),
            Some(NodeHandle::Hash(hash)) => {
                if let Some(child) = proof_nodes.get(hash) {
                    let mut child = child.clone();
                    attach_proof_children(&mut child, proof_nodes);
                    *slot = Some(NodeHandle::InMemory(child));
                }
            }
        }
    }
}

fn get_from_db_at(store: &Store, node: &Node, key: &[u8]) -> Result<Option<Vec<u8>>, TrieError> {
    match node {
        Node::Leaf(leaf) => Ok((leaf.partial_key == key).then(|| leaf.value.clone())),
        Node::Branch(branch) => {
            if key == branch.partial_key {
                return Ok(branch.value.clone());
            }
            if key.len() < branch.partial_key.len() || !key.starts_with(&branch.partial_key) {
                return Ok(None);
            }
            let index = key[branch.partial_key.len()];
            let rest = &key[branch.partial_key.len() + 1..];
            match &branch.children[index] {
                None => Ok(None),
                Some(NodeHandle::InMemory(child)) => get_from_db_at(store, child, rest),
                Some(NodeHandle::Hash(hash)) => {
                    let child = fetch_and_decode(store, *hash)?;
                    get_from_db_at(store, &child, rest)
                }
            }
        }
    }
}
