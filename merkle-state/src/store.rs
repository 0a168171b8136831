// SPDX-License-Identifier: Apache-2.0

//! The reference-counted node backend (spec.md §4.1: "a reference count per
//! node is maintained so pruning is safe under concurrent readers").

use crate::node::NodeHash;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("backing store I/O error: {0}")]
    Io(String),
}

/// Backend for persisted trie nodes, addressed by content hash with a
/// reference count attached to each row.
pub trait NodeStore: Send + Sync {
    /// Raw node bytes, ignoring refcount. `None` if absent.
    fn get_bytes(&self, hash: &NodeHash) -> Result<Option<Vec<u8>>, StoreError>;

    /// References `hash`, writing `bytes` if this is the first reference.
    /// Called once per node on the path rewritten by a commit, whether the
    /// node is brand new or an unchanged subtree now shared by one more
    /// root.
    fn incr_ref(&self, hash: &NodeHash, bytes: &[u8]) -> Result<(), StoreError>;

    /// Drops one reference to `hash`. Returns the node's bytes iff the
    /// refcount reached zero and the row was deleted, so the caller can
    /// decode it and cascade the decrement into its children.
    fn decr_ref(&self, hash: &NodeHash) -> Result<Option<Vec<u8>>, StoreError>;

    /// Current refcount, for diagnostics and tests. `None` if absent.
    fn ref_count(&self, hash: &NodeHash) -> Result<Option<u64>, StoreError>;
}

#[derive(Clone)]
struct Entry {
    bytes: Vec<u8>,
    refcount: u64,
}

/// Reference, single-process backend used by default and in tests.
#[derive(Default)]
pub struct InMemoryNodeStore {
    rows: Mutex<HashMap<NodeHash, Entry>>,
}

impl InMemoryNodeStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn len(&self) -> usize {
        self.rows.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl NodeStore for InMemoryNodeStore {
    fn get_bytes(&self, hash: &NodeHash) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.rows.lock().get(hash).map(|e| e.bytes.clone()))
    }

    fn incr_ref(&self, hash: &NodeHash, bytes: &[u8]) -> Result<(), StoreError> {
        let mut rows = self.rows.lock();
        rows.entry(hash.clone())
            .and_modify(|e| e.refcount += 1)
            .or_insert_with(|| Entry {
                bytes: bytes.to_vec(),
                refcount: 1,
            });
        Ok(())
    }

    fn decr_ref(&self, hash: &NodeHash) -> Result<Option<Vec<u8>>, StoreError> {
        let mut rows = self.rows.lock();
        let Some(entry) = rows.get_mut(hash) else {
            return Ok(None);
        };
        entry.refcount = entry.refcount.saturating_sub(1);
        if entry.refcount == 0 {
            let bytes = entry.bytes.clone();
            rows.remove(hash);
            Ok(Some(bytes))
        } else {
            Ok(None)
        }
    }

    fn ref_count(&self, hash: &NodeHash) -> Result<Option<u64>, StoreError> {
        Ok(self.rows.lock().get(hash).map(|e| e.refcount))
    }
}

/// RocksDB-backed node store sharing a column family with the rest of the
/// block store's physical database (spec.md §6: trie nodes live under the
/// `s:` prefix of one backing KV store alongside blocks and the chain
/// index).
pub struct RocksDbNodeStore {
    db: Arc<rocksdb::DB>,
    column_family: String,
}

impl RocksDbNodeStore {
    pub fn new(db: Arc<rocksdb::DB>, column_family: impl Into<String>) -> Self {
        Self {
            db,
            column_family: column_family.into(),
        }
    }

    fn cf(&self) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(&self.column_family)
            .ok_or_else(|| StoreError::Io(format!("missing column family {}", self.column_family)))
    }

    fn encode_entry(bytes: &[u8], refcount: u64) -> Vec<u8> {
        let mut out = Vec::with_capacity(8 + bytes.len());
        out.extend_from_slice(&refcount.to_be_bytes());
        out.extend_from_slice(bytes);
        out
    }

    fn decode_entry(raw: &[u8]) -> Option<(Vec<u8>, u64)> {
        if raw.len() < 8 {
            return None;
        }
        let refcount = u64::from_be_bytes(raw[..8].try_into().ok()?);
        Some((raw[8..].to_vec(), refcount))
    }
}

impl NodeStore for RocksDbNodeStore {
    fn get_bytes(&self, hash: &NodeHash) -> Result<Option<Vec<u8>>, StoreError> {
        let cf = self.cf()?;
        let raw = self
            .db
            .get_cf(cf, hash.as_bytes())
            .map_err(|e| StoreError::Io(e.to_string()))?;
        Ok(raw.and_then(|r| Self::decode_entry(&r)).map(|(b, _)| b))
    }

    fn incr_ref(&self, hash: &NodeHash, bytes: &[u8]) -> Result<(), StoreError> {
        let cf = self.cf()?;
        let raw = self
            .db
            .get_cf(cf, hash.as_bytes())
            .map_err(|e| StoreError::Io(e.to_string()))?;
        let (stored_bytes, refcount) = match raw.and_then(|r| Self::decode_entry(&r)) {
            Some((existing_bytes, refcount)) => (existing_bytes, refcount + 1),
            None => (bytes.to_vec(), 1),
        };
        self.db
            .put_cf(cf, hash.as_bytes(), Self::encode_entry(&stored_bytes, refcount))
            .map_err(|e| StoreError::Io(e.to_string()))
    }

    fn decr_ref(&self, hash: &NodeHash) -> Result<Option<Vec<u8>>, StoreError> {
        let cf = self.cf()?;
        let raw = self
            .db
            .get_cf(cf, hash.as_bytes())
            .map_err(|e| StoreError::Io(e.to_string()))?;
        let Some((bytes, refcount)) = raw.and_then(|r| Self::decode_entry(&r)) else {
            return Ok(None);
        };
        let refcount = refcount.saturating_sub(1);
        if refcount == 0 {
            self.db
                .delete_cf(cf, hash.as_bytes())
                .map_err(|e| StoreError::Io(e.to_string()))?;
            Ok(Some(bytes))
        } else {
            self.db
                .put_cf(cf, hash.as_bytes(), Self::encode_entry(&bytes, refcount))
                .map_err(|e| StoreError::Io(e.to_string()))?;
            Ok(None)
        }
    }

    fn ref_count(&self, hash: &NodeHash) -> Result<Option<u64>, StoreError> {
        let cf = self.cf()?;
        let raw = self
            .db
            .get_cf(cf, hash.as_bytes())
            .map_err(|e| StoreError::Io(e.to_string()))?;
        Ok(raw.and_then(|r| Self::decode_entry(&r)).map(|(_, rc)| rc))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn incr_then_decr_to_zero_deletes_row() {
        let store = InMemoryNodeStore::new();
        let hash = "deadbeef".to_string();
        store.incr_ref(&hash, b"payload").unwrap();
        assert_eq!(store.ref_count(&hash).unwrap(), Some(1));
        store.incr_ref(&hash, b"payload").unwrap();
        assert_eq!(store.ref_count(&hash).unwrap(), Some(2));
        assert_eq!(store.decr_ref(&hash).unwrap(), None);
        assert_eq!(store.ref_count(&hash).unwrap(), Some(1));
        assert_eq!(store.decr_ref(&hash).unwrap(), Some(b"payload".to_vec()));
        assert_eq!(store.ref_count(&hash).unwrap(), None);
    }

    #[test]
    fn decr_on_absent_hash_is_a_no_op() {
        let store = InMemoryNodeStore::new();
        assert_eq!(store.decr_ref(&"missing".to_string()).unwrap(), None);
    }
}
