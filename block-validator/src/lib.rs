// SPDX-License-Identifier: Apache-2.0

//! BlockValidator (spec.md §4.5): given a block whose ancestors are known
//! and Committed, determines whether the block is Valid and computes its
//! new state root. Stateless between calls — every dependency it needs
//! (the predecessor's committed status, the backing stores) is either
//! passed in or reached through a shared handle owned by the caller
//! (ChainController).

use block_manager::{BlockManager, BlockManagerError};
use block_store::{BlockStore, BlockStoreError};
use consensus_engine::{ConsensusEngine, VerifyOutcome};
use ledger_types::{Block, BlockId, StateRoot, TransactionId};
use merkle_state::{MerkleError, MerkleState};
use scheduler::{DependencyTracker, Executor, ProcessorDispatch, Receipt, Scheduler, SchedulerError, TransactionOutcome};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, warn};

/// Why a candidate block failed validation (spec.md §4.5's numbered steps).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidReason {
    #[error("block header signature does not verify")]
    HeaderSignature,
    #[error("batch or transaction signature does not verify: {0}")]
    BodySignature(String),
    #[error("previous block {0} is not Committed")]
    PredecessorNotCommitted(BlockId),
    #[error("predecessor block {0} is not known")]
    UnknownPredecessor(BlockId),
    #[error("transaction {0} already appears in an earlier block on this chain")]
    DuplicateTransaction(TransactionId),
    #[error("batch {0} already appears in an earlier block on this chain")]
    DuplicateBatch(ledger_types::BatchId),
    #[error("block applied zero batches and was published locally")]
    NoProgress,
    #[error("computed state root {computed} does not match declared root {declared}")]
    StateRootMismatch { computed: StateRoot, declared: StateRoot },
    #[error("consensus engine rejected the block")]
    ConsensusRejected,
}

#[derive(Debug, Error)]
pub enum BlockValidatorError {
    #[error(transparent)]
    Manager(#[from] BlockManagerError),
    #[error(transparent)]
    Store(#[from] BlockStoreError),
    #[error(transparent)]
    Merkle(#[from] MerkleError),
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
}

/// Result of [`BlockValidator::validate`]. `Valid` carries the three
/// things spec.md §4.5 says the algorithm produces: the new status, the
/// new state root, and the per-transaction receipts of every transaction
/// whose batch actually applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationOutcome {
    Valid {
        state_root: StateRoot,
        receipts: Vec<(TransactionId, Receipt)>,
    },
    Invalid(InvalidReason),
    /// The engine returned `NeedMoreInfo`; the caller should hold this
    /// block pending an out-of-band callback and re-submit later.
    Pending,
}

/// Whatever the caller needs to answer "is this block's predecessor
/// Committed" without BlockValidator depending on ChainController's status
/// table directly (spec.md §4.6 owns that map, not this crate).
pub trait ChainView: Send + Sync {
    fn is_committed(&self, id: &BlockId) -> bool;
}

/// The dependency baseline for a candidate block: ids already committed in
/// its ancestry, backed by the durable store, plus ids committed earlier in
/// this same in-progress block (spec.md §4.4's per-block evolution).
pub struct ChainDependencyTracker {
    store: Arc<BlockStore>,
    within_block: HashSet<TransactionId>,
}

impl ChainDependencyTracker {
    pub fn new(store: Arc<BlockStore>) -> Self {
        Self {
            store,
            within_block: HashSet::new(),
        }
    }
}

impl DependencyTracker for ChainDependencyTracker {
    fn contains(&self, id: &TransactionId) -> bool {
        if self.within_block.contains(id) {
            return true;
        }
        self.store.has_transaction(id).unwrap_or_else(|err| {
            warn!(%err, transaction_id = %id, "dependency lookup against block store failed, treating as unmet");
            false
        })
    }

    fn insert(&mut self, id: TransactionId) {
        self.within_block.insert(id);
    }
}

/// Runs spec.md §4.5's seven-step algorithm against one candidate block.
pub struct BlockValidator<D> {
    block_manager: BlockManager,
    block_store: Arc<BlockStore>,
    state: MerkleState,
    consensus: Arc<dyn ConsensusEngine>,
    dispatch: D,
    concurrency: usize,
    max_processor_retries: u32,
}

impl<D: ProcessorDispatch + Clone> BlockValidator<D> {
    pub fn new(
        block_manager: BlockManager,
        block_store: Arc<BlockStore>,
        state: MerkleState,
        consensus: Arc<dyn ConsensusEngine>,
        dispatch: D,
        concurrency: usize,
        max_processor_retries: u32,
    ) -> Self {
        Self {
            block_manager,
            block_store,
            state,
            consensus,
            dispatch,
            concurrency,
            max_processor_retries,
        }
    }

    /// `published_locally` governs the no-progress rule (spec.md §4.5 step
    /// 5): a block with zero successfully applied batches is only Invalid
    /// when this validator is checking a block it is itself proposing to
    /// extend the chain with. Blocks received from gossip may legitimately
    /// carry an all-failed batch set (every batcher's problem, not a
    /// symptom of a broken local Publisher).
    pub async fn validate(
        &self,
        block: &Block,
        published_locally: bool,
        chain_view: &dyn ChainView,
    ) -> Result<ValidationOutcome, BlockValidatorError> {
        let started = Instant::now();
        let outcome = self.validate_inner(block, published_locally, chain_view).await?;
        let status_label = match &outcome {
            ValidationOutcome::Valid { .. } => "valid",
            ValidationOutcome::Invalid(_) => "invalid",
            ValidationOutcome::Pending => "pending",
        };
        ledger_metrics::BLOCK_VALIDATION_SECONDS
            .with_label_values(&[status_label])
            .observe(started.elapsed().as_secs_f64());
        Ok(outcome)
    }

    async fn validate_inner(
        &self,
        block: &Block,
        published_locally: bool,
        chain_view: &dyn ChainView,
    ) -> Result<ValidationOutcome, BlockValidatorError> {
        // Steps 1+2: header signature, batch signatures, transaction
        // signatures, and batch-id/transaction-id consistency all fall out
        // of one recursive check.
        if let Err(err) = block.verify_signature() {
            debug!(block_id = %block.id(), %err, "signature verification failed");
            return Ok(ValidationOutcome::Invalid(InvalidReason::BodySignature(err.to_string())));
        }

        // Step 3: predecessor must be Committed.
        if !block.is_genesis() {
            let previous = &block.header.previous_block_id;
            if self.block_manager.get(previous)?.is_none() {
                return Ok(ValidationOutcome::Invalid(InvalidReason::UnknownPredecessor(previous.clone())));
            }
            if !chain_view.is_committed(previous) {
                return Ok(ValidationOutcome::Invalid(InvalidReason::PredecessorNotCommitted(previous.clone())));
            }
        }

        // Step 4: no id inside the candidate already appears in an
        // ancestor on this chain.
        for batch in &block.batches {
            if self.block_store.has_batch(&batch.id())? {
                return Ok(ValidationOutcome::Invalid(InvalidReason::DuplicateBatch(batch.id())));
            }
            for txn in &batch.transactions {
                if self.block_store.has_transaction(&txn.id())? {
                    return Ok(ValidationOutcome::Invalid(InvalidReason::DuplicateTransaction(txn.id())));
                }
            }
        }

        // Step 5: speculative execution against the predecessor's root.
        let base_root = if block.is_genesis() {
            MerkleState::empty_root()
        } else {
            self.block_manager
                .get(&block.header.previous_block_id)?
                .expect("checked above")
                .header
                .state_root
        };

        let tracker = ChainDependencyTracker::new(self.block_store.clone());
        let mut scheduler = Scheduler::new(&self.state, base_root, tracker);
        for batch in &block.batches {
            scheduler.add_batch(batch.clone());
        }
        let executor = Executor::with_max_attempts(self.dispatch.clone(), self.concurrency, self.max_processor_retries);
        let (outcomes, new_root) = executor.run(scheduler).await?;

        let applied = outcomes.iter().filter(|o| o.applied).count();
        if !outcomes.is_empty() && applied == 0 && published_locally {
            return Ok(ValidationOutcome::Invalid(InvalidReason::NoProgress));
        }

        // Step 6: state root must match what the block declares.
        if new_root != block.header.state_root {
            return Ok(ValidationOutcome::Invalid(InvalidReason::StateRootMismatch {
                computed: new_root,
                declared: block.header.state_root.clone(),
            }));
        }

        // Step 7: consult the pluggable consensus policy.
        match self.consensus.verify_block(block).await {
            VerifyOutcome::Valid => {
                let receipts = outcomes
                    .iter()
                    .filter(|o| o.applied)
                    .flat_map(|o| o.transaction_outcomes.iter())
                    .filter_map(|(id, outcome)| match outcome {
                        TransactionOutcome::Valid { receipt, .. } => Some((id.clone(), receipt.clone())),
                        TransactionOutcome::Invalid { .. } => None,
                    })
                    .collect();
                Ok(ValidationOutcome::Valid {
                    state_root: new_root,
                    receipts,
                })
            }
            VerifyOutcome::Invalid => Ok(ValidationOutcome::Invalid(InvalidReason::ConsensusRejected)),
            VerifyOutcome::NeedMoreInfo => Ok(ValidationOutcome::Pending),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use consensus_engine::DevModeEngine;
    use ledger_crypto::PrivateKey;
    use ledger_types::{genesis_previous_id, AddressPrefix, Batch, Transaction};
    use merkle_state::InMemoryNodeStore;
    use scheduler::DispatchError;

    struct AlwaysCommitted;
    impl ChainView for AlwaysCommitted {
        fn is_committed(&self, _id: &BlockId) -> bool {
            true
        }
    }

    struct NeverCommitted;
    impl ChainView for NeverCommitted {
        fn is_committed(&self, _id: &BlockId) -> bool {
            false
        }
    }

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

    fn harness() -> (tempfile::TempDir, Arc<BlockStore>, BlockManager, MerkleState, BlockValidator<EchoDispatch>) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(BlockStore::open(dir.path()).unwrap());
        let manager = BlockManager::new(store.clone());
        let state = MerkleState::new(InMemoryNodeStore::new());
        let consensus = Arc::new(DevModeEngine::new());
        let validator = BlockValidator::new(manager.clone(), store.clone(), state.clone(), consensus, EchoDispatch, 4, 3);
        (dir, store, manager, state, validator)
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

    #[tokio::test]
    async fn genesis_block_validates_with_no_predecessor_check() {
        let (_dir, _store, _manager, _state, validator) = harness();
        let signer = PrivateKey::generate();
        let genesis = Block::new_signed(
            genesis_previous_id(),
            0,
            vec![],
            MerkleState::empty_root(),
            vec![],
            &signer,
        );
        let outcome = validator.validate(&genesis, true, &AlwaysCommitted).await.unwrap();
        assert_eq!(
            outcome,
            ValidationOutcome::Valid {
                state_root: MerkleState::empty_root(),
                receipts: vec![],
            }
        );
    }

    #[tokio::test]
    async fn tampered_header_signature_is_invalid() {
        let (_dir, _store, _manager, _state, validator) = harness();
        let signer = PrivateKey::generate();
        let mut genesis = Block::new_signed(
            genesis_previous_id(),
            0,
            vec![],
            MerkleState::empty_root(),
            vec![],
            &signer,
        );
        genesis.header.block_number = 7;
        let outcome = validator.validate(&genesis, true, &AlwaysCommitted).await.unwrap();
        assert!(matches!(outcome, ValidationOutcome::Invalid(InvalidReason::BodySignature(_))));
    }

    #[tokio::test]
    async fn predecessor_not_committed_is_invalid() {
        let (_dir, store, manager, _state, validator) = harness();
        let signer = PrivateKey::generate();
        let genesis = Block::new_signed(
            genesis_previous_id(),
            0,
            vec![],
            MerkleState::empty_root(),
            vec![],
            &signer,
        );
        manager.put(genesis.clone()).unwrap();
        store.put(&genesis).unwrap();

        let child = Block::new_signed(genesis.id(), 1, vec![], MerkleState::empty_root(), vec![], &signer);
        let outcome = validator.validate(&child, true, &NeverCommitted).await.unwrap();
        assert!(matches!(
            outcome,
            ValidationOutcome::Invalid(InvalidReason::PredecessorNotCommitted(_))
        ));
    }

    #[tokio::test]
    async fn duplicate_batch_against_an_ancestor_is_invalid() {
        let (_dir, store, manager, _state, validator) = harness();
        let signer = PrivateKey::generate();
        let shared_txn = txn(&signer, 0);
        let shared_batch = Batch::new_signed(vec![shared_txn], false, &signer);

        let genesis = Block::new_signed(
            genesis_previous_id(),
            0,
            vec![shared_batch.clone()],
            MerkleState::empty_root(),
            vec![],
            &signer,
        );
        manager.put(genesis.clone()).unwrap();
        store.put(&genesis).unwrap();

        // Resubmitting the exact same batch reproduces both its id and its
        // transaction's id, so this exercises whichever check the
        // implementation runs first.
        let child = Block::new_signed(genesis.id(), 1, vec![shared_batch], MerkleState::empty_root(), vec![], &signer);
        let outcome = validator.validate(&child, true, &AlwaysCommitted).await.unwrap();
        assert!(matches!(
            outcome,
            ValidationOutcome::Invalid(InvalidReason::DuplicateBatch(_))
                | ValidationOutcome::Invalid(InvalidReason::DuplicateTransaction(_))
        ));
    }

    #[tokio::test]
    async fn duplicate_transaction_inside_a_new_batch_is_invalid() {
        let (_dir, store, manager, _state, validator) = harness();
        let signer = PrivateKey::generate();
        let shared_txn = txn(&signer, 0);
        let shared_batch = Batch::new_signed(vec![shared_txn.clone()], false, &signer);

        let genesis = Block::new_signed(
            genesis_previous_id(),
            0,
            vec![shared_batch],
            MerkleState::empty_root(),
            vec![],
            &signer,
        );
        manager.put(genesis.clone()).unwrap();
        store.put(&genesis).unwrap();

        // Bundled with a second transaction, this batch gets a distinct
        // batch id but still carries the already-committed transaction.
        let other_txn = txn(&signer, 1);
        let new_batch = Batch::new_signed(vec![shared_txn, other_txn], false, &signer);
        let child = Block::new_signed(genesis.id(), 1, vec![new_batch], MerkleState::empty_root(), vec![], &signer);
        let outcome = validator.validate(&child, true, &AlwaysCommitted).await.unwrap();
        assert!(matches!(
            outcome,
            ValidationOutcome::Invalid(InvalidReason::DuplicateTransaction(_))
        ));
    }

    #[tokio::test]
    async fn all_failed_batches_published_locally_is_no_progress() {
        let (_dir, _store, _manager, _state, _validator) = harness();
        let signer = PrivateKey::generate();
        let dispatch = RejectingDispatch;
        let validator = BlockValidator::new(
            _manager.clone(),
            _store.clone(),
            _state.clone(),
            Arc::new(DevModeEngine::new()),
            dispatch,
            4,
            3,
        );
        let batch = Batch::new_signed(vec![txn(&signer, 0)], false, &signer);
        let block = Block::new_signed(genesis_previous_id(), 0, vec![batch], MerkleState::empty_root(), vec![], &signer);
        let outcome = validator.validate(&block, true, &AlwaysCommitted).await.unwrap();
        assert_eq!(outcome, ValidationOutcome::Invalid(InvalidReason::NoProgress));
    }

    #[tokio::test]
    async fn all_failed_batches_not_published_locally_is_permitted_to_continue() {
        let (_dir, _store, _manager, _state, _validator) = harness();
        let signer = PrivateKey::generate();
        let dispatch = RejectingDispatch;
        let validator = BlockValidator::new(
            _manager.clone(),
            _store.clone(),
            _state.clone(),
            Arc::new(DevModeEngine::new()),
            dispatch,
            4,
            3,
        );
        let batch = Batch::new_signed(vec![txn(&signer, 0)], false, &signer);
        // Declared root matches the empty root because the single batch
        // rolls back entirely, leaving state untouched.
        let block = Block::new_signed(genesis_previous_id(), 0, vec![batch], MerkleState::empty_root(), vec![], &signer);
        let outcome = validator.validate(&block, false, &AlwaysCommitted).await.unwrap();
        assert_eq!(
            outcome,
            ValidationOutcome::Valid {
                state_root: MerkleState::empty_root(),
                receipts: vec![],
            }
        );
    }

    #[derive(Clone)]
    struct RejectingDispatch;

    #[async_trait]
    impl ProcessorDispatch for RejectingDispatch {
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

    #[tokio::test]
    async fn valid_block_surfaces_one_receipt_per_applied_transaction() {
        let (_dir, store, manager, state, validator) = harness();
        let signer = PrivateKey::generate();
        let genesis = Block::new_signed(
            genesis_previous_id(),
            0,
            vec![],
            MerkleState::empty_root(),
            vec![],
            &signer,
        );
        manager.put(genesis.clone()).unwrap();
        store.put(&genesis).unwrap();

        let batch = Batch::new_signed(vec![txn(&signer, 0)], false, &signer);
        let transaction_id = batch.transactions[0].id();

        // Run the same scheduler/executor pipeline BlockValidator uses
        // internally to learn the root this batch actually produces,
        // without duplicating its dependency or consensus checks.
        let tracker = ChainDependencyTracker::new(store.clone());
        let mut scheduler = Scheduler::new(&state, MerkleState::empty_root(), tracker);
        scheduler.add_batch(batch.clone());
        let executor = Executor::new(EchoDispatch, 4);
        let (_outcomes, declared_root) = executor.run(scheduler).await.unwrap();

        let child = Block::new_signed(genesis.id(), 1, vec![batch], declared_root, vec![], &signer);
        let outcome = validator.validate(&child, true, &AlwaysCommitted).await.unwrap();
        match outcome {
            ValidationOutcome::Valid { receipts, .. } => {
                assert_eq!(receipts.len(), 1);
                assert_eq!(receipts[0].0, transaction_id);
            }
            other => panic!("expected Valid, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn state_root_mismatch_is_invalid() {
        let (_dir, _store, _manager, _state, validator) = harness();
        let signer = PrivateKey::generate();
        let batch = Batch::new_signed(vec![txn(&signer, 0)], false, &signer);
        let block = Block::new_signed(genesis_previous_id(), 0, vec![batch], "wrong-root".to_string(), vec![], &signer);
        let outcome = validator.validate(&block, true, &AlwaysCommitted).await.unwrap();
        assert!(matches!(
            outcome,
            ValidationOutcome::Invalid(InvalidReason::StateRootMismatch { .. })
        ));
    }
}
