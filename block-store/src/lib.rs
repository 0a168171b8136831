// SPDX-License-Identifier: Apache-2.0

//! BlockStore (spec.md §4.2, §6): durable append-only storage indexed by
//! block id, block number, transaction id, and batch id, plus a metadata
//! row for the chain head. Four column families share one physical
//! `rocksdb::DB`, matching spec.md §6's three logical namespaces (`b:`,
//! `n:`, `m:`) plus the transaction/batch membership indexes §4.2 adds.

use ledger_config::BlockStoreConfig;
use ledger_types::{Batch, Block, BlockId, Transaction};
use rocksdb::{ColumnFamilyDescriptor, Options, WriteBatch, DB};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// Default names for the two indexes `BlockStoreConfig` doesn't cover
/// (spec.md §6 only names the `b:`/`n:`/`m:` namespaces; the
/// transaction/batch membership indexes are this crate's own addition).
pub const CF_BY_TRANSACTION: &str = "by_transaction";
pub const CF_BY_BATCH: &str = "by_batch";

const META_CHAIN_HEAD_KEY: &[u8] = b"chain_head";
const BLOCK_NUMBER_WIDTH: usize = 20;

/// Column families a combined database must open for `BlockStore` to attach
/// to it, using `BlockStoreConfig`'s default names. Exposed so a host binary
/// can open one `rocksdb::DB` shared with `merkle-state`'s
/// `RocksDbNodeStore`.
pub fn column_families() -> Vec<String> {
    column_families_for(&BlockStoreConfig::default())
}

/// As [`column_families`], but naming the block/number/metadata column
/// families from `config` instead of the defaults (spec.md §9: these are
/// configuration, not invariants).
pub fn column_families_for(config: &BlockStoreConfig) -> Vec<String> {
    vec![
        config.block_key_prefix.clone(),
        config.number_key_prefix.clone(),
        CF_BY_TRANSACTION.to_string(),
        CF_BY_BATCH.to_string(),
        config.metadata_key_prefix.clone(),
    ]
}

#[derive(Debug, Error)]
pub enum BlockStoreError {
    #[error("rocksdb error: {0}")]
    Io(String),
    #[error("block encoding error: {0}")]
    Serialization(#[from] bincode::Error),
    #[error("missing column family {0}")]
    MissingColumnFamily(String),
    #[error("chain head compare-and-swap failed: expected {expected:?}, found {found:?}")]
    ChainHeadMismatch {
        expected: Option<BlockId>,
        found: Option<BlockId>,
    },
}

fn number_key(number: u64) -> Vec<u8> {
    format!("{:0width$}", number, width = BLOCK_NUMBER_WIDTH).into_bytes()
}

#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct ChainHeadRecord {
    block_id: BlockId,
    block_number: u64,
}

/// Durable, multi-reader/single-writer append-only block storage.
/// Constructed once per process and shared via `Arc` (spec.md §5: "multi-
/// reader; single writer serialized by ChainController"). Column family
/// names are read from `BlockStoreConfig` at open time rather than fixed,
/// so a host can run several logical chains against distinct prefixes
/// within one physical database.
pub struct BlockStore {
    db: Arc<DB>,
    blocks_cf: String,
    by_number_cf: String,
    meta_cf: String,
}

impl BlockStore {
    /// Opens (creating if absent) a standalone database at `path` with
    /// exactly this store's column families, named by the defaults.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, BlockStoreError> {
        Self::open_with_config(path, &BlockStoreConfig::default())
    }

    /// As [`BlockStore::open`], but naming the column families from
    /// `config` instead of the defaults.
    pub fn open_with_config(path: impl AsRef<Path>, config: &BlockStoreConfig) -> Result<Self, BlockStoreError> {
        let mut options = Options::default();
        options.create_if_missing(true);
        options.create_missing_column_families(true);
        let descriptors = column_families_for(config)
            .into_iter()
            .map(|name| ColumnFamilyDescriptor::new(name, Options::default()))
            .collect::<Vec<_>>();
        let db = DB::open_cf_descriptors(&options, path, descriptors)
            .map_err(|e| BlockStoreError::Io(e.to_string()))?;
        Ok(Self::from_shared_db_with_config(Arc::new(db), config))
    }

    /// Attaches to an already-open database (e.g. shared with
    /// `merkle-state`'s node store), which must already carry this store's
    /// column families under their default names.
    pub fn from_shared_db(db: Arc<DB>) -> Self {
        Self::from_shared_db_with_config(db, &BlockStoreConfig::default())
    }

    /// As [`BlockStore::from_shared_db`], but naming the column families
    /// from `config` instead of the defaults.
    pub fn from_shared_db_with_config(db: Arc<DB>, config: &BlockStoreConfig) -> Self {
        Self {
            db,
            blocks_cf: config.block_key_prefix.clone(),
            by_number_cf: config.number_key_prefix.clone(),
            meta_cf: config.metadata_key_prefix.clone(),
        }
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, BlockStoreError> {
        self.db.cf_handle(name).ok_or_else(|| BlockStoreError::MissingColumnFamily(name.to_string()))
    }

    /// Atomically writes the block under all four indexes.
    pub fn put(&self, block: &Block) -> Result<(), BlockStoreError> {
        let id = block.id();
        let encoded = bincode::serialize(block)?;

        let mut write_batch = WriteBatch::default();
        write_batch.put_cf(self.cf(&self.blocks_cf)?, id.0.as_bytes(), &encoded);
        write_batch.put_cf(
            self.cf(&self.by_number_cf)?,
            number_key(block.header.block_number),
            id.0.as_bytes(),
        );
        for batch in &block.batches {
            write_batch.put_cf(self.cf(CF_BY_BATCH)?, batch.id().0.as_bytes(), id.0.as_bytes());
            for txn in &batch.transactions {
                write_batch.put_cf(self.cf(CF_BY_TRANSACTION)?, txn.id().0.as_bytes(), id.0.as_bytes());
            }
        }
        self.db
            .write(write_batch)
            .map_err(|e| BlockStoreError::Io(e.to_string()))?;
        debug!(block_id = %id, block_number = block.header.block_number, "persisted block");
        Ok(())
    }

    pub fn get_by_id(&self, id: &BlockId) -> Result<Option<Block>, BlockStoreError> {
        let raw = self
            .db
            .get_cf(self.cf(&self.blocks_cf)?, id.0.as_bytes())
            .map_err(|e| BlockStoreError::Io(e.to_string()))?;
        raw.map(|bytes| bincode::deserialize(&bytes)).transpose().map_err(Into::into)
    }

    pub fn get_by_number(&self, number: u64) -> Result<Option<Block>, BlockStoreError> {
        let raw = self
            .db
            .get_cf(self.cf(&self.by_number_cf)?, number_key(number))
            .map_err(|e| BlockStoreError::Io(e.to_string()))?;
        match raw {
            Some(id_bytes) => {
                let id = BlockId(String::from_utf8_lossy(&id_bytes).into_owned());
                self.get_by_id(&id)
            }
            None => Ok(None),
        }
    }

    fn block_id_for_index(&self, cf: &str, key: &[u8]) -> Result<Option<BlockId>, BlockStoreError> {
        let raw = self
            .db
            .get_cf(self.cf(cf)?, key)
            .map_err(|e| BlockStoreError::Io(e.to_string()))?;
        Ok(raw.map(|bytes| BlockId(String::from_utf8_lossy(&bytes).into_owned())))
    }

    pub fn has_transaction(&self, id: &ledger_types::TransactionId) -> Result<bool, BlockStoreError> {
        Ok(self
            .block_id_for_index(CF_BY_TRANSACTION, id.0.as_bytes())?
            .is_some())
    }

    pub fn has_batch(&self, id: &ledger_types::BatchId) -> Result<bool, BlockStoreError> {
        Ok(self.block_id_for_index(CF_BY_BATCH, id.0.as_bytes())?.is_some())
    }

    /// Returns the block that included `transaction`, if any.
    pub fn block_for_transaction(
        &self,
        id: &ledger_types::TransactionId,
    ) -> Result<Option<Block>, BlockStoreError> {
        match self.block_id_for_index(CF_BY_TRANSACTION, id.0.as_bytes())? {
            Some(block_id) => self.get_by_id(&block_id),
            None => Ok(None),
        }
    }

    /// The current chain head, if one has ever been set.
    pub fn chain_head(&self) -> Result<Option<(BlockId, u64)>, BlockStoreError> {
        let raw = self
            .db
            .get_cf(self.cf(&self.meta_cf)?, META_CHAIN_HEAD_KEY)
            .map_err(|e| BlockStoreError::Io(e.to_string()))?;
        match raw {
            Some(bytes) => {
                let record: ChainHeadRecord = bincode::deserialize(&bytes)?;
                Ok(Some((record.block_id, record.block_number)))
            }
            None => Ok(None),
        }
    }

    /// Compare-and-swap the chain head. `previous_head` must match the
    /// current head exactly (`None` only accepted when no head is set yet,
    /// i.e. committing genesis) or the call fails with
    /// `ChainHeadMismatch`, which the caller retries against the real
    /// current head (spec.md §4.2, §7).
    pub fn update_chain_head(
        &self,
        new_head: &BlockId,
        new_head_number: u64,
        previous_head: Option<&BlockId>,
    ) -> Result<(), BlockStoreError> {
        let current = self.chain_head()?;
        let current_id = current.as_ref().map(|(id, _)| id.clone());
        if current_id.as_ref() != previous_head {
            warn!(
                expected = ?previous_head,
                found = ?current_id,
                "chain head compare-and-swap failed"
            );
            return Err(BlockStoreError::ChainHeadMismatch {
                expected: previous_head.cloned(),
                found: current_id,
            });
        }
        let record = ChainHeadRecord {
            block_id: new_head.clone(),
            block_number: new_head_number,
        };
        let encoded = bincode::serialize(&record)?;
        self.db
            .put_cf(self.cf(&self.meta_cf)?, META_CHAIN_HEAD_KEY, encoded)
            .map_err(|e| BlockStoreError::Io(e.to_string()))?;
        debug!(block_id = %new_head, block_number = new_head_number, "advanced chain head");
        Ok(())
    }
}
