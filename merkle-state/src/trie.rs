// SPDX-License-Identifier: Apache-2.0

//! Nibble-indexed traversal over the 16-ary trie (spec.md §4.1). One level
//! per hex character of a 70-character address: 70 levels, no prefix
//! compression. Writers never mutate an existing node; every path from the
//! root to a changed leaf is rewritten and reference-counted, so any number
//! of prior roots stay readable for as long as something still refs them.

use crate::node::{Node, NodeHash};
use crate::store::{NodeStore, StoreError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TrieError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("node {0} referenced but missing from the backing store")]
    MissingNode(NodeHash),
    #[error("malformed node {0}: {1}")]
    Corrupt(NodeHash, #[source] crate::node::DecodeError),
}

fn nibbles_of(address_hex: &str) -> Vec<u8> {
    address_hex
        .chars()
        .map(|c| c.to_digit(16).expect("address pre-validated as hex") as u8)
        .collect()
}

fn load(store: &dyn NodeStore, hash: &NodeHash) -> Result<Node, TrieError> {
    let bytes = store
        .get_bytes(hash)?
        .ok_or_else(|| TrieError::MissingNode(hash.clone()))?;
    Node::decode(&bytes).map_err(|e| TrieError::Corrupt(hash.clone(), e))
}

/// Looks up `address_hex` under `root`. `None` if the node is absent or
/// holds no value at that path.
pub fn get(store: &dyn NodeStore, root: &NodeHash, address_hex: &str) -> Result<Option<Vec<u8>>, TrieError> {
    let nibbles = nibbles_of(address_hex);
    get_rec(store, root, &nibbles)
}

fn get_rec(store: &dyn NodeStore, hash: &NodeHash, nibbles: &[u8]) -> Result<Option<Vec<u8>>, TrieError> {
    let node = match store.get_bytes(hash)? {
        Some(bytes) => Node::decode(&bytes).map_err(|e| TrieError::Corrupt(hash.clone(), e))?,
        None => return Ok(None),
    };
    match nibbles.split_first() {
        None => Ok(node.value),
        Some((&nibble, rest)) => match &node.children[nibble as usize] {
            Some(child_hash) => get_rec(store, child_hash, rest),
            None => Ok(None),
        },
    }
}

/// Writes or deletes `address_hex` (`None` deletes, per spec.md §4.1's
/// `commit(root, changes: list<(address, option<bytes>)>)`), rewriting the
/// root-to-leaf path and reference-counting every node it touches (new or
/// shared-unchanged). Returns the new root hash. `base` is treated as the
/// empty trie if it has never been referenced.
pub fn write(
    store: &dyn NodeStore,
    base: &NodeHash,
    address_hex: &str,
    value: Option<Vec<u8>>,
) -> Result<NodeHash, TrieError> {
    let nibbles = nibbles_of(address_hex);
    Ok(write_rec(store, base, &nibbles, value)?.unwrap_or_else(|| Node::default().hash()))
}

/// Convenience wrapper over [`write`] for the common set case.
pub fn put(store: &dyn NodeStore, base: &NodeHash, address_hex: &str, value: Vec<u8>) -> Result<NodeHash, TrieError> {
    write(store, base, address_hex, Some(value))
}

/// `Ok(None)` means the rewritten node holds neither a value nor any
/// children and should be pruned from its parent's child slot rather than
/// stored.
fn write_rec(
    store: &dyn NodeStore,
    hash: &NodeHash,
    nibbles: &[u8],
    value: Option<Vec<u8>>,
) -> Result<Option<NodeHash>, TrieError> {
    let mut node = match store.get_bytes(hash)? {
        Some(bytes) => Node::decode(&bytes).map_err(|e| TrieError::Corrupt(hash.clone(), e))?,
        None => Node::default(),
    };
    let changed_index = match nibbles.split_first() {
        None => {
            node.value = value;
            None
        }
        Some((&nibble, rest)) => {
            let child_base = node.children[nibble as usize]
                .clone()
                .unwrap_or_else(|| Node::default().hash());
            let new_child = write_rec(store, &child_base, rest, value)?;
            node.children[nibble as usize] = new_child;
            Some(nibble as usize)
        }
    };
    // The recursive call above already incremented the changed child's own
    // refcount (that increment models the edge this node now holds to it).
    // Every other child this node still points to gains one incoming edge
    // too, now that a brand new parent node references it.
    for (index, child) in node.children.iter().enumerate() {
        if Some(index) == changed_index {
            continue;
        }
        if let Some(child_hash) = child {
            let bytes = store
                .get_bytes(child_hash)?
                .ok_or_else(|| TrieError::MissingNode(child_hash.clone()))?;
            store.incr_ref(child_hash, &bytes)?;
        }
    }
    if node.is_empty() {
        return Ok(None);
    }
    let bytes = node.encode();
    let new_hash = node.hash();
    store.incr_ref(&new_hash, &bytes)?;
    Ok(Some(new_hash))
}

/// Drops one reference from `root` and cascades the decrement into every
/// child whose own refcount also reaches zero, freeing an entire unshared
/// subtree. Stops descending the moment a node is still referenced
/// elsewhere, since its children are still needed by that other reference.
pub fn prune(store: &dyn NodeStore, root: &NodeHash) -> Result<(), TrieError> {
    if let Some(bytes) = store.decr_ref(root)? {
        let node = Node::decode(&bytes).map_err(|e| TrieError::Corrupt(root.clone(), e))?;
        for child in node.children.into_iter().flatten() {
            prune(store, &child)?;
        }
    }
    Ok(())
}
