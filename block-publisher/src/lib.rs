// SPDX-License-Identifier: Apache-2.0

//! BlockPublisher (spec.md §4.7): assembles candidate blocks from the
//! pending-batch pool, driven by the consensus engine's
//! `should_initialize_block`/`poll_finalize` signals. Opens a `Scheduler`
//! against the predecessor's committed state root, then feeds batches in
//! one at a time — keeping each one that applies, dropping each one that
//! doesn't — until a stop condition fires, and submits the result to
//! `ChainController` as a locally-published candidate.

mod mempool;

pub use mempool::{Mempool, MempoolError};

use block_manager::{BlockManager, BlockManagerError};
use block_store::BlockStore;
use block_validator::ChainDependencyTracker;
use chain_controller::{ChainController, ChainControllerError};
use consensus_engine::{BlockSummary, ConsensusEngine};
use ledger_config::PublisherConfig;
use ledger_crypto::PrivateKey;
use ledger_types::{Batch, Block, BlockId};
use merkle_state::MerkleState;
use scheduler::{Executor, ProcessorDispatch, Scheduler, SchedulerError};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum BlockPublisherError {
    #[error(transparent)]
    Manager(#[from] BlockManagerError),
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
    #[error(transparent)]
    Controller(#[from] ChainControllerError),
    #[error("predecessor {0} is not known to the block manager")]
    UnknownPredecessor(BlockId),
}

/// Polling interval while waiting on the mempool during a candidate's idle
/// grace window, so assembly doesn't busy-spin the executor.
const MEMPOOL_POLL_INTERVAL: Duration = Duration::from_millis(5);

pub struct BlockPublisher<D> {
    block_manager: BlockManager,
    block_store: Arc<BlockStore>,
    controller: Arc<ChainController<D>>,
    state: MerkleState,
    consensus: Arc<dyn ConsensusEngine>,
    mempool: Mempool,
    dispatch: D,
    concurrency: usize,
    max_processor_retries: u32,
    signer: PrivateKey,
    config: PublisherConfig,
}

impl<D: ProcessorDispatch + Clone> BlockPublisher<D> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        block_manager: BlockManager,
        block_store: Arc<BlockStore>,
        controller: Arc<ChainController<D>>,
        state: MerkleState,
        consensus: Arc<dyn ConsensusEngine>,
        dispatch: D,
        concurrency: usize,
        max_processor_retries: u32,
        signer: PrivateKey,
        config: PublisherConfig,
    ) -> Self {
        let mempool = Mempool::new(Duration::from_secs(config.batch_ttl_secs), config.pool_high_water_mark);
        Self {
            block_manager,
            block_store,
            controller,
            state,
            consensus,
            mempool,
            dispatch,
            concurrency,
            max_processor_retries,
            signer,
            config,
        }
    }

    pub fn mempool(&self) -> &Mempool {
        &self.mempool
    }

    /// Submits a client-originated batch to the pending pool.
    pub fn submit_batch(&self, batch: Batch) -> Result<(), MempoolError> {
        self.mempool.submit(batch)
    }

    /// Re-admits the batches carried by blocks a fork switch dropped, at
    /// the front of the pool (spec.md §4.7). `blocks` should be in
    /// newest-first order, matching `BlockManager::fork_diff`'s drop list,
    /// so the overall re-queued order ends up oldest-block-first.
    pub fn requeue_dropped(&self, blocks: &[Block]) {
        let batches: Vec<Batch> = blocks.iter().rev().flat_map(|block| block.batches.clone()).collect();
        if !batches.is_empty() {
            debug!(count = batches.len(), "re-queuing batches from dropped blocks");
            self.mempool.requeue_front(batches);
        }
    }

    /// Attempts to assemble and submit one candidate block on top of
    /// `previous`. Returns `Ok(None)` if the consensus engine declined to
    /// initialize a block, or if assembly produced nothing worth
    /// submitting (no finalize signal and no successfully applied
    /// batches).
    pub async fn try_publish(&self, previous: BlockId) -> Result<Option<BlockId>, BlockPublisherError> {
        if !self.consensus.should_initialize_block(&previous).await {
            return Ok(None);
        }

        let predecessor = self
            .block_manager
            .get(&previous)?
            .ok_or_else(|| BlockPublisherError::UnknownPredecessor(previous.clone()))?;

        let tracker = ChainDependencyTracker::new(self.block_store.clone());
        let mut scheduler = Scheduler::new(&self.state, predecessor.header.state_root.clone(), tracker);
        let executor = Executor::with_max_attempts(self.dispatch.clone(), self.concurrency, self.max_processor_retries);

        let mut included: Vec<Batch> = Vec::new();
        let mut transaction_count = 0usize;
        let started = Instant::now();
        let mut last_progress = Instant::now();
        let idle_grace = Duration::from_millis(self.config.idle_grace_window_ms);
        let time_budget = Duration::from_millis(self.config.block_time_budget_ms);
        let mut consensus_payload: Option<Vec<u8>> = None;

        'assembly: loop {
            if started.elapsed() >= time_budget {
                debug!(previous = %previous, "publisher stopping: time budget exhausted");
                break;
            }
            if included.len() >= self.config.max_batches_per_block {
                debug!(previous = %previous, "publisher stopping: max batches per block reached");
                break;
            }

            let summary = BlockSummary {
                previous_block_id: previous.clone(),
                batch_ids: included.iter().map(Batch::id).collect(),
                provisional_state_root: scheduler.current_root().clone(),
            };
            if let Some(payload) = self.consensus.poll_finalize(&summary).await {
                debug!(previous = %previous, "publisher stopping: consensus engine finalized");
                consensus_payload = Some(payload);
                break;
            }

            let batch = loop {
                if let Some(batch) = self.mempool.pop_oldest() {
                    break batch;
                }
                if !included.is_empty() && last_progress.elapsed() >= idle_grace {
                    debug!(previous = %previous, "publisher stopping: idle grace window elapsed");
                    break 'assembly;
                }
                if started.elapsed() >= time_budget {
                    continue 'assembly;
                }
                tokio::time::sleep(MEMPOOL_POLL_INTERVAL).await;
            };

            if transaction_count + batch.transactions.len() > self.config.max_transactions_per_block {
                // Doesn't fit in what's left of this block; give the next
                // candidate first crack at it instead of dropping it.
                self.mempool.requeue_front(vec![batch]);
                break;
            }

            let batch_transaction_count = batch.transactions.len();
            scheduler.add_batch(batch.clone());
            executor.run_until_idle(&mut scheduler).await?;

            let applied = scheduler.outcomes().last().map(|outcome| outcome.applied).unwrap_or(false);
            if applied {
                included.push(batch);
                transaction_count += batch_transaction_count;
                last_progress = Instant::now();
            }
            // A batch that failed under this ordering rolled back
            // atomically (nothing to unwind) and won't resolve
            // differently on a retry against the same predecessor, so it
            // is dropped rather than requeued (spec.md §4.7).
        }

        if included.is_empty() && consensus_payload.is_none() {
            return Ok(None);
        }

        let (_, state_root) = scheduler.finish()?;

        let block = Block::new_signed(
            previous.clone(),
            predecessor.header.block_number + 1,
            included,
            state_root,
            consensus_payload.unwrap_or_default(),
            &self.signer,
        );
        let id = block.id();
        self.controller.submit_block(block, true)?;
        info!(block_id = %id, previous = %previous, "published candidate block");
        Ok(Some(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use block_store::BlockStore;
    use consensus_engine::DevModeEngine;
    use ledger_types::{genesis_previous_id, AddressPrefix, Transaction};
    use merkle_state::InMemoryNodeStore;
    use scheduler::DispatchError;

    #[derive(Clone)]
    struct EchoDispatch;

    #[async_trait]
    impl ProcessorDispatch for EchoDispatch {
        async fn dispatch(
            &self,
            scheduled: &scheduler::ScheduledTransaction,
        ) -> Result<txn_processor_api::ProcessOutcome, DispatchError> {
            Ok(txn_processor_api::ProcessOutcome::Ok {
                state_changes: vec![(
                    ledger_types::Address::parse(format!("aabbcc{}", "1".repeat(64))).unwrap(),
                    Some(scheduled.transaction.payload.clone()),
                )],
                reads: vec![],
                events: vec![],
            })
        }
    }

    #[derive(Clone)]
    struct AlwaysRejectDispatch;

    #[async_trait]
    impl ProcessorDispatch for AlwaysRejectDispatch {
        async fn dispatch(
            &self,
            _scheduled: &scheduler::ScheduledTransaction,
        ) -> Result<txn_processor_api::ProcessOutcome, DispatchError> {
            Ok(txn_processor_api::ProcessOutcome::InvalidTransaction {
                message: "rejected".to_string(),
                extended_data: vec![],
            })
        }
    }

    fn txn(signer: &PrivateKey, nonce: u64) -> Transaction {
        Transaction::new_signed(
            "intkey",
            "1.0",
            vec![AddressPrefix::parse("aabbcc").unwrap()],
            vec![AddressPrefix::parse("aabbcc").unwrap()],
            vec![],
            b"payload".to_vec(),
            nonce,
            signer.public_key(),
            signer,
        )
    }

    fn harness<D: ProcessorDispatch + Clone + 'static>(
        dispatch: D,
        config: PublisherConfig,
    ) -> (tempfile::TempDir, BlockPublisher<D>, PrivateKey, Block) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(BlockStore::open(dir.path()).unwrap());
        let manager = BlockManager::new(store.clone());
        let state = MerkleState::new(InMemoryNodeStore::new());
        let consensus = Arc::new(DevModeEngine::new());
        let signer = PrivateKey::generate();

        let genesis = Block::new_signed(genesis_previous_id(), 0, vec![], MerkleState::empty_root(), vec![], &signer);
        manager.put(genesis.clone()).unwrap();

        let controller = Arc::new(ChainController::new(manager.clone(), store.clone(), state.clone(), consensus.clone(), dispatch.clone(), 4, 3));
        controller.bootstrap_genesis(genesis.clone()).unwrap();

        let publisher = BlockPublisher::new(manager, store, controller, state, consensus, dispatch, 4, 3, PrivateKey::generate(), config);
        (dir, publisher, signer, genesis)
    }

    #[tokio::test]
    async fn publishes_a_block_once_a_batch_is_queued() {
        let (_dir, publisher, signer, genesis) = harness(EchoDispatch, PublisherConfig::default());
        let batch = Batch::new_signed(vec![txn(&signer, 0)], false, &signer);
        publisher.submit_batch(batch).unwrap();

        let published = publisher.try_publish(genesis.id()).await.unwrap();
        assert!(published.is_some());
    }

    #[tokio::test]
    async fn declines_to_publish_when_the_engine_has_nothing_to_say() {
        struct NeverEngine;
        #[async_trait]
        impl ConsensusEngine for NeverEngine {
            async fn should_initialize_block(&self, _previous: &BlockId) -> bool {
                false
            }
            async fn poll_finalize(&self, _summary: &BlockSummary) -> Option<Vec<u8>> {
                None
            }
            async fn verify_block(&self, _block: &Block) -> consensus_engine::VerifyOutcome {
                consensus_engine::VerifyOutcome::Valid
            }
            async fn choose_fork(&self, _current: consensus_engine::ChainTip<'_>, _candidate: consensus_engine::ChainTip<'_>) -> consensus_engine::ForkChoice {
                consensus_engine::ForkChoice::Current
            }
            async fn on_block_new(&self, _block_id: &BlockId) {}
            async fn on_block_valid(&self, _block_id: &BlockId) {}
            async fn on_block_invalid(&self, _block_id: &BlockId) {}
            async fn on_block_commit(&self, _block_id: &BlockId) {}
        }

        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(BlockStore::open(dir.path()).unwrap());
        let manager = BlockManager::new(store.clone());
        let state = MerkleState::new(InMemoryNodeStore::new());
        let signer = PrivateKey::generate();
        let genesis = Block::new_signed(genesis_previous_id(), 0, vec![], MerkleState::empty_root(), vec![], &signer);
        manager.put(genesis.clone()).unwrap();
        let consensus: Arc<dyn ConsensusEngine> = Arc::new(NeverEngine);
        let controller = Arc::new(ChainController::new(manager.clone(), store.clone(), state.clone(), consensus.clone(), EchoDispatch, 4, 3));
        controller.bootstrap_genesis(genesis.clone()).unwrap();
        let publisher = BlockPublisher::new(
            manager,
            store,
            controller,
            state,
            consensus,
            EchoDispatch,
            4,
            3,
            PrivateKey::generate(),
            PublisherConfig::default(),
        );

        let published = publisher.try_publish(genesis.id()).await.unwrap();
        assert!(published.is_none());
    }

    #[tokio::test]
    async fn batches_that_fail_entirely_are_dropped_not_included() {
        let mut config = PublisherConfig::default();
        config.idle_grace_window_ms = 5;
        config.block_time_budget_ms = 20;
        let (_dir, publisher, signer, genesis) = harness(AlwaysRejectDispatch, config);
        let batch = Batch::new_signed(vec![txn(&signer, 0)], false, &signer);
        publisher.submit_batch(batch).unwrap();

        // DevModeEngine finalizes as soon as a batch id is present in the
        // summary, but since the only batch submitted fails entirely, the
        // summary never gains a batch id and assembly idles out instead.
        let published = publisher.try_publish(genesis.id()).await.unwrap();
        assert!(published.is_none());
    }

    #[tokio::test]
    async fn requeue_dropped_puts_batches_back_ahead_of_the_pool() {
        let (_dir, publisher, signer, _genesis) = harness(EchoDispatch, PublisherConfig::default());
        let already_waiting = Batch::new_signed(vec![txn(&signer, 0)], false, &signer);
        publisher.submit_batch(already_waiting.clone()).unwrap();

        let dropped_batch = Batch::new_signed(vec![txn(&signer, 1)], false, &signer);
        let dropped_block = Block::new_signed(
            genesis_previous_id(),
            1,
            vec![dropped_batch.clone()],
            "root".to_string(),
            vec![],
            &signer,
        );
        publisher.requeue_dropped(&[dropped_block]);

        assert_eq!(publisher.mempool().pop_oldest().unwrap().id(), dropped_batch.id());
        assert_eq!(publisher.mempool().pop_oldest().unwrap().id(), already_waiting.id());
    }
}
