// SPDX-License-Identifier: Apache-2.0

//! The core data model (spec.md §3): transactions, batches, blocks,
//! addresses, and block status, plus the canonical byte encoding every
//! signed header and every MerkleState node is serialized with.

pub mod address;
pub mod batch;
pub mod block;
pub mod canonical;
pub mod transaction;

pub use address::{Address, AddressError, AddressPrefix, ADDRESS_LENGTH};
pub use batch::{Batch, BatchHeader, BatchId};
pub use block::{genesis_previous_id, Block, BlockHeader, BlockId, BlockStatus, StateRoot};
pub use canonical::CanonicalEncode;
pub use transaction::{Transaction, TransactionHeader, TransactionId};
