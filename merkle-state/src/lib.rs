// SPDX-License-Identifier: Apache-2.0

//! MerkleState (spec.md §4.1): a content-addressed, reference-counted radix
//! trie over the 70-hex-character address space. Every write produces a new
//! root while leaving all previously returned roots readable; `prune` is the
//! only way a root and its unshared ancestry are ever reclaimed.

mod node;
mod store;
mod trie;

use ledger_types::Address;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

pub use node::{DecodeError, Node, NodeHash};
pub use store::{InMemoryNodeStore, NodeStore, RocksDbNodeStore, StoreError};
pub use trie::TrieError;

/// A single state write applied by [`MerkleState::commit`]. `value: None`
/// deletes the address (spec.md §4.1).
#[derive(Debug, Clone)]
pub struct StateChange {
    pub address: Address,
    pub value: Option<Vec<u8>>,
}

#[derive(Debug, thiserror::Error)]
pub enum MerkleError {
    #[error(transparent)]
    Trie(#[from] TrieError),
}

/// The authenticated key-value view addressed by [`ledger_types::StateRoot`]
/// hashes. Cloneable and `Send + Sync`: every method takes `&self`, so the
/// same handle is shared by every reader and by the single committing
/// writer (spec.md §5: reads never block on a writer, and the writer is
/// serialized elsewhere, not by this type).
#[derive(Clone)]
pub struct MerkleState {
    store: Arc<dyn NodeStore>,
}

impl MerkleState {
    pub fn new(store: Arc<dyn NodeStore>) -> Self {
        Self { store }
    }

    /// The root hash of a trie with no entries. Every chain starts here.
    pub fn empty_root() -> NodeHash {
        Node::default().hash()
    }

    /// Reads the value at `address` as of `root`. `Ok(None)` if the address
    /// has never been written under that root's lineage.
    pub fn read(&self, root: &NodeHash, address: &Address) -> Result<Option<Vec<u8>>, MerkleError> {
        Ok(trie::get(self.store.as_ref(), root, address.as_str())?)
    }

    /// Batched form of [`MerkleState::read`] for a scheduled transaction's
    /// full input set (spec.md §4.4).
    pub fn read_many(
        &self,
        root: &NodeHash,
        addresses: &[Address],
    ) -> Result<HashMap<Address, Vec<u8>>, MerkleError> {
        let mut out = HashMap::with_capacity(addresses.len());
        for address in addresses {
            if let Some(value) = self.read(root, address)? {
                out.insert(address.clone(), value);
            }
        }
        Ok(out)
    }

    /// Applies `changes` on top of `base`, producing a new root. `base`
    /// keeps its existing refcount: the caller decides, by calling
    /// [`MerkleState::prune`] or not, whether `base` remains reachable
    /// (spec.md §4.1: state roots are pinned by the blocks that reference
    /// them, not retired automatically on commit).
    pub fn commit(&self, base: &NodeHash, changes: &[StateChange]) -> Result<NodeHash, MerkleError> {
        let mut root = base.clone();
        for change in changes {
            root = trie::write(self.store.as_ref(), &root, change.address.as_str(), change.value.clone())?;
        }
        debug!(base = %base, new_root = %root, writes = changes.len(), "committed state changes");
        Ok(root)
    }

    /// Releases the caller's reference to `root`, cascading into any
    /// ancestry that becomes unreachable as a result. Safe to call while
    /// other roots derived from the same lineage are still pinned: shared
    /// nodes stop short of zero and are left alone.
    pub fn prune(&self, root: &NodeHash) -> Result<(), MerkleError> {
        trie::prune(self.store.as_ref(), root)?;
        debug!(root = %root, "pruned state root");
        Ok(())
    }
}
