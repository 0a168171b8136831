// SPDX-License-Identifier: Apache-2.0

//! BlockManager (spec.md §4.3): the in-memory DAG of blocks currently
//! relevant to fork resolution, with reference-counted pinning so code
//! walking ancestors can rely on a block staying resident. Navigation is by
//! id lookup into a flat table, never by back-pointer ownership — the
//! arena shape spec.md §9 calls for in place of a cyclic object graph.

use block_store::BlockStore;
use ledger_types::{genesis_previous_id, Block, BlockId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, trace};

#[derive(Debug, Error)]
pub enum BlockManagerError {
    #[error("block {0} is not known to the manager or its backing store")]
    Missing(BlockId),
    #[error(
        "block {block} has number {number}, expected {expected} (one greater than predecessor {previous})"
    )]
    NonSequentialBlockNumber {
        block: BlockId,
        number: u64,
        expected: u64,
        previous: BlockId,
    },
    #[error("predecessor {0} of inserted block is not known")]
    UnknownPredecessor(BlockId),
    #[error("chains {a} and {b} share no common ancestor")]
    NoCommonAncestor { a: BlockId, b: BlockId },
    #[error(transparent)]
    Store(#[from] block_store::BlockStoreError),
}

struct Entry {
    block: Block,
    refcount: u64,
}

struct Inner {
    store: Arc<BlockStore>,
    resident: Mutex<HashMap<BlockId, Entry>>,
}

/// Cloneable handle to the shared in-memory block DAG.
#[derive(Clone)]
pub struct BlockManager {
    inner: Arc<Inner>,
}

impl BlockManager {
    pub fn new(store: Arc<BlockStore>) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                resident: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Inserts `block`, enforcing the no-cycles invariant (spec.md §4.3:
    /// a block's number must be exactly one greater than its
    /// predecessor's) and pinning the predecessor so forks stay
    /// traversable.
    pub fn put(&self, block: Block) -> Result<(), BlockManagerError> {
        let id = block.id();
        if !block.is_genesis() {
            let previous = block.header.previous_block_id.clone();
            let previous_number = self
                .peek(&previous)?
                .ok_or_else(|| BlockManagerError::UnknownPredecessor(previous.clone()))?
                .header
                .block_number;
            let expected = previous_number + 1;
            if block.header.block_number != expected {
                return Err(BlockManagerError::NonSequentialBlockNumber {
                    block: id,
                    number: block.header.block_number,
                    expected,
                    previous,
                });
            }
        }

        let mut resident = self.inner.resident.lock();
        resident.insert(
            id.clone(),
            Entry {
                block: block.clone(),
                refcount: 0,
            },
        );
        drop(resident);
        if !block.is_genesis() {
            self.incr_ref_locked(&block.header.previous_block_id);
        }
        debug!(block_id = %id, block_number = block.header.block_number, "inserted block into manager");
        Ok(())
    }

    fn incr_ref_locked(&self, id: &BlockId) {
        let mut resident = self.inner.resident.lock();
        if let Some(entry) = resident.get_mut(id) {
            entry.refcount += 1;
        }
    }

    /// Increments `id`'s pin count. No-op if `id` is not resident.
    pub fn reference(&self, id: &BlockId) {
        self.incr_ref_locked(id);
        trace!(block_id = %id, "incremented refcount");
    }

    /// Decrements `id`'s pin count. If it reaches zero and the block is
    /// durably persisted, it is evicted from memory; an unpersisted block
    /// at zero refs stays resident (eviction of it is forbidden per
    /// spec.md §4.3).
    pub fn unreference(&self, id: &BlockId) -> Result<(), BlockManagerError> {
        let mut resident = self.inner.resident.lock();
        let Some(entry) = resident.get_mut(id) else {
            return Ok(());
        };
        entry.refcount = entry.refcount.saturating_sub(1);
        if entry.refcount == 0 {
            let persisted = self.inner.store.get_by_id(id)?.is_some();
            if persisted {
                resident.remove(id);
                trace!(block_id = %id, "evicted block from manager");
            }
        }
        Ok(())
    }

    /// Current pin count, `None` if not resident.
    pub fn ref_count(&self, id: &BlockId) -> Option<u64> {
        self.inner.resident.lock().get(id).map(|e| e.refcount)
    }

    /// Resident block, else lazily loaded from the backing store and
    /// cached resident with a zero refcount, else `None` (spec.md §3's
    /// `Missing` status).
    pub fn get(&self, id: &BlockId) -> Result<Option<Block>, BlockManagerError> {
        if let Some(entry) = self.inner.resident.lock().get(id) {
            return Ok(Some(entry.block.clone()));
        }
        match self.inner.store.get_by_id(id)? {
            Some(block) => {
                self.inner.resident.lock().insert(
                    id.clone(),
                    Entry {
                        block: block.clone(),
                        refcount: 0,
                    },
                );
                Ok(Some(block))
            }
            None => Ok(None),
        }
    }

    /// Like [`BlockManager::get`] but never touches the backing store or
    /// caches a result; used by `put`'s predecessor-number check.
    fn peek(&self, id: &BlockId) -> Result<Option<Block>, BlockManagerError> {
        self.get(id)
    }

    /// Walks backward from `from_id` toward genesis. Pins `from_id` for the
    /// iterator's lifetime and releases the pin on drop; restartable by
    /// constructing a fresh iterator.
    pub fn branch(&self, from_id: BlockId) -> BranchIter {
        self.reference(&from_id);
        BranchIter {
            manager: self.clone(),
            next: Some(from_id.clone()),
            pinned: Some(from_id),
        }
    }

    /// Walks both chains back to their lowest common ancestor. `drop` is
    /// newest-first, the blocks to roll back from `a`; `add` is
    /// oldest-first, the blocks to apply to reach `b` (spec.md §4.3).
    pub fn fork_diff(&self, a: BlockId, b: BlockId) -> Result<(Vec<Block>, Vec<Block>), BlockManagerError> {
        let mut chain_a = Vec::new();
        let mut chain_b = Vec::new();

        let mut cursor_a = Some(a.clone());
        let mut cursor_b = Some(b.clone());

        loop {
            let number_a = match &cursor_a {
                Some(id) => self.get(id)?.map(|b| b.header.block_number),
                None => None,
            };
            let number_b = match &cursor_b {
                Some(id) => self.get(id)?.map(|b| b.header.block_number),
                None => None,
            };

            match (number_a, number_b) {
                (Some(na), Some(nb)) if na == nb => break,
                (Some(na), Some(nb)) if na > nb => {
                    let block = self.get(cursor_a.as_ref().unwrap())?.unwrap();
                    cursor_a = (!block.is_genesis()).then(|| block.header.previous_block_id.clone());
                    chain_a.push(block);
                }
                (Some(_), Some(_)) => {
                    let block = self.get(cursor_b.as_ref().unwrap())?.unwrap();
                    cursor_b = (!block.is_genesis()).then(|| block.header.previous_block_id.clone());
                    chain_b.push(block);
                }
                _ => return Err(BlockManagerError::NoCommonAncestor { a, b }),
            }
        }

        loop {
            match (&cursor_a, &cursor_b) {
                (Some(ida), Some(idb)) if ida == idb => break,
                (Some(ida), Some(idb)) => {
                    let block_a = self.get(ida)?.ok_or_else(|| BlockManagerError::Missing(ida.clone()))?;
                    let block_b = self.get(idb)?.ok_or_else(|| BlockManagerError::Missing(idb.clone()))?;
                    cursor_a = (!block_a.is_genesis()).then(|| block_a.header.previous_block_id.clone());
                    cursor_b = (!block_b.is_genesis()).then(|| block_b.header.previous_block_id.clone());
                    chain_a.push(block_a);
                    chain_b.push(block_b);
                }
                _ => return Err(BlockManagerError::NoCommonAncestor { a, b }),
            }
        }

        chain_b.reverse();
        Ok((chain_a, chain_b))
    }
}

/// Backward iterator produced by [`BlockManager::branch`].
pub struct BranchIter {
    manager: BlockManager,
    next: Option<BlockId>,
    pinned: Option<BlockId>,
}

impl Iterator for BranchIter {
    type Item = Result<Block, BlockManagerError>;

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.next.take()?;
        match self.manager.get(&id) {
            Ok(Some(block)) => {
                self.next = (!block.is_genesis()).then(|| block.header.previous_block_id.clone());
                Some(Ok(block))
            }
            Ok(None) => Some(Err(BlockManagerError::Missing(id))),
            Err(e) => Some(Err(e)),
        }
    }
}

impl Drop for BranchIter {
    fn drop(&mut self) {
        if let Some(id) = self.pinned.take() {
            let _ = self.manager.unreference(&id);
        }
    }
}

/// Returns true iff `id` equals the canonical empty previous-id marker,
/// i.e. it names no real block.
pub fn is_genesis_marker(id: &BlockId) -> bool {
    *id == genesis_previous_id()
}
