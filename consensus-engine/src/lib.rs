// SPDX-License-Identifier: Apache-2.0

//! The ConsensusEngine interface (spec.md §4.8): a pluggable policy the core
//! consults for block timing, fork choice, and block acceptance. Only the
//! interface is specified; the algorithm behind it (PoET/PBFT/dev-mode) is
//! explicitly out of scope.
//!
//! spec.md describes `initialize_block`/`finalize_block` as signals the
//! *engine* issues to the Publisher, while `verify_block`/`choose_fork` are
//! calls the *core* makes into the engine — a duplex protocol over the same
//! framed channel used for transaction processors. This crate collapses
//! that duplex shape into a single trait the core drives end to end
//! (`should_initialize_block`/`poll_finalize` replace the engine-initiated
//! signals with core-polled decision points), matching the capability
//! interface spec.md §9 prescribes for this exact pattern.

use ledger_types::{Block, BlockId, BatchId, StateRoot};
use std::time::{Duration, Instant};

/// Snapshot of a candidate block still being assembled by the Publisher,
/// offered to the engine on every `poll_finalize` call.
#[derive(Debug, Clone)]
pub struct BlockSummary {
    pub previous_block_id: BlockId,
    pub batch_ids: Vec<BatchId>,
    pub provisional_state_root: StateRoot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyOutcome {
    Valid,
    Invalid,
    /// Validation is suspended pending an out-of-band engine callback
    /// (spec.md §4.5 step 7).
    NeedMoreInfo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForkChoice {
    Current,
    Candidate,
}

/// A chain tip as the engine needs to see it for fork choice: enough to
/// compare without the engine depending on BlockManager directly.
#[derive(Debug, Clone, Copy)]
pub struct ChainTip<'a> {
    pub block_id: &'a BlockId,
    pub block_number: u64,
}

#[async_trait::async_trait]
pub trait ConsensusEngine: Send + Sync {
    /// Whether the Publisher should begin assembling a new candidate block
    /// on top of `previous` right now.
    async fn should_initialize_block(&self, previous: &BlockId) -> bool;

    /// Polled once per Publisher assembly iteration. `Some(payload)` stops
    /// assembly and supplies the block header's `consensus_payload`.
    async fn poll_finalize(&self, summary: &BlockSummary) -> Option<Vec<u8>>;

    /// Consulted by BlockValidator after state-root recomputation
    /// (spec.md §4.5 step 7).
    async fn verify_block(&self, block: &Block) -> VerifyOutcome;

    /// Consulted by ChainController once a candidate validates
    /// (spec.md §4.6).
    async fn choose_fork(&self, current_head: ChainTip<'_>, candidate: ChainTip<'_>) -> ForkChoice;

    async fn on_block_new(&self, block_id: &BlockId);
    async fn on_block_valid(&self, block_id: &BlockId);
    async fn on_block_invalid(&self, block_id: &BlockId);
    async fn on_block_commit(&self, block_id: &BlockId);
}

/// Reference engine for tests and single-validator deployments: always
/// finalizes as soon as a batch is present, always accepts valid blocks,
/// and resolves forks by block number (longest chain, ties favor the
/// incumbent). Analogous to Sawtooth's PoET dev-mode / Diem's dev consensus
/// named in spec.md §1.
pub struct DevModeEngine {
    min_batches_to_finalize: usize,
}

impl DevModeEngine {
    pub fn new() -> Self {
        Self {
            min_batches_to_finalize: 1,
        }
    }

    pub fn with_min_batches(min_batches_to_finalize: usize) -> Self {
        Self {
            min_batches_to_finalize,
        }
    }
}

impl Default for DevModeEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl ConsensusEngine for DevModeEngine {
    async fn should_initialize_block(&self, _previous: &BlockId) -> bool {
        true
    }

    async fn poll_finalize(&self, summary: &BlockSummary) -> Option<Vec<u8>> {
        if summary.batch_ids.len() >= self.min_batches_to_finalize {
            Some(Vec::new())
        } else {
            None
        }
    }

    async fn verify_block(&self, _block: &Block) -> VerifyOutcome {
        VerifyOutcome::Valid
    }

    async fn choose_fork(&self, current_head: ChainTip<'_>, candidate: ChainTip<'_>) -> ForkChoice {
        if candidate.block_number > current_head.block_number {
            ForkChoice::Candidate
        } else {
            ForkChoice::Current
        }
    }

    async fn on_block_new(&self, block_id: &BlockId) {
        tracing::debug!(block_id = %block_id, "dev-mode engine observed new block");
    }

    async fn on_block_valid(&self, block_id: &BlockId) {
        tracing::debug!(block_id = %block_id, "dev-mode engine observed valid block");
    }

    async fn on_block_invalid(&self, block_id: &BlockId) {
        tracing::debug!(block_id = %block_id, "dev-mode engine observed invalid block");
    }

    async fn on_block_commit(&self, block_id: &BlockId) {
        tracing::debug!(block_id = %block_id, "dev-mode engine observed committed block");
    }
}

/// A fixed consensus payload issued once an idle grace period elapses with
/// no new batches, mirroring spec.md §4.7's "grace window" stop condition
/// without requiring a full timer-driven engine implementation.
pub struct IdleTimeoutEngine {
    inner: DevModeEngine,
    idle_grace: Duration,
    last_batch_count: parking_lot::Mutex<(usize, Instant)>,
}

impl IdleTimeoutEngine {
    pub fn new(idle_grace: Duration) -> Self {
        Self {
            inner: DevModeEngine::with_min_batches(usize::MAX),
            idle_grace,
            last_batch_count: parking_lot::Mutex::new((0, Instant::now())),
        }
    }
}

#[async_trait::async_trait]
impl ConsensusEngine for IdleTimeoutEngine {
    async fn should_initialize_block(&self, previous: &BlockId) -> bool {
        self.inner.should_initialize_block(previous).await
    }

    async fn poll_finalize(&self, summary: &BlockSummary) -> Option<Vec<u8>> {
        let mut last = self.last_batch_count.lock();
        if summary.batch_ids.len() != last.0 {
            *last = (summary.batch_ids.len(), Instant::now());
            return None;
        }
        if summary.batch_ids.is_empty() {
            return None;
        }
        if last.1.elapsed() >= self.idle_grace {
            Some(Vec::new())
        } else {
            None
        }
    }

    async fn verify_block(&self, block: &Block) -> VerifyOutcome {
        self.inner.verify_block(block).await
    }

    async fn choose_fork(&self, current_head: ChainTip<'_>, candidate: ChainTip<'_>) -> ForkChoice {
        self.inner.choose_fork(current_head, candidate).await
    }

    async fn on_block_new(&self, block_id: &BlockId) {
        self.inner.on_block_new(block_id).await
    }

    async fn on_block_valid(&self, block_id: &BlockId) {
        self.inner.on_block_valid(block_id).await
    }

    async fn on_block_invalid(&self, block_id: &BlockId) {
        self.inner.on_block_invalid(block_id).await
    }

    async fn on_block_commit(&self, block_id: &BlockId) {
        self.inner.on_block_commit(block_id).await
    }
}
