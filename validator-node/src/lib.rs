// SPDX-License-Identifier: Apache-2.0

//! ValidatorNode: wires every crate in this workspace into the component
//! graph spec.md §2 describes, shares one physical `rocksdb::DB` between
//! `block-store` and `merkle-state`'s `RocksDbNodeStore` (spec.md §6: blocks,
//! the chain index, and trie nodes are three logical namespaces of one
//! backing ordered-kv store), and loads `ledger-config::NodeConfig` once at
//! startup. No `[[bin]]` — a CLI surface is out of scope (spec.md §6).

use block_manager::BlockManager;
use block_publisher::BlockPublisher;
use block_store::BlockStore;
use chain_controller::{ChainController, ChainControllerError};
use consensus_engine::ConsensusEngine;
use ledger_config::NodeConfig;
use ledger_crypto::PrivateKey;
use ledger_types::{genesis_previous_id, Block, BlockId};
use merkle_state::{MerkleError, MerkleState, RocksDbNodeStore, StateChange};
use rocksdb::{ColumnFamilyDescriptor, Options, DB};
use scheduler::ProcessorDispatch;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;
use txn_processor_api::ProcessorRegistry;

#[derive(Debug, Error)]
pub enum ValidatorNodeError {
    #[error("failed to open backing database: {0}")]
    OpenDatabase(String),
    #[error(transparent)]
    Store(#[from] block_store::BlockStoreError),
    #[error(transparent)]
    Merkle(#[from] MerkleError),
    #[error(transparent)]
    Controller(#[from] ChainControllerError),
    #[error(transparent)]
    Publisher(#[from] block_publisher::BlockPublisherError),
}

/// The fully assembled validator core: one `ChainController` serializing
/// commits, one `BlockPublisher` assembling candidates, sharing a
/// `BlockManager`/`BlockStore`/`MerkleState` triple opened over a single
/// physical database.
pub struct ValidatorNode<D> {
    block_manager: BlockManager,
    block_store: Arc<BlockStore>,
    state: MerkleState,
    controller: Arc<ChainController<D>>,
    publisher: BlockPublisher<D>,
    processor_registry: Arc<ProcessorRegistry>,
    /// Aborted on drop, so the sweep dies with the node.
    heartbeat_sweep: tokio::task::JoinHandle<()>,
    config: NodeConfig,
}

impl<D> Drop for ValidatorNode<D> {
    fn drop(&mut self) {
        self.heartbeat_sweep.abort();
    }
}

impl<D: ProcessorDispatch + Clone + 'static> ValidatorNode<D> {
    /// Opens (or creates) the database at `path`, wires every component
    /// together per `config`, and installs the global logging subscriber
    /// and metrics registry (spec.md's ambient concerns, carried regardless
    /// of which features `config` turns on).
    pub fn open(
        path: impl AsRef<Path>,
        config: NodeConfig,
        consensus: Arc<dyn ConsensusEngine>,
        dispatch: D,
        block_signer: PrivateKey,
    ) -> Result<Self, ValidatorNodeError> {
        let log_format = match config.logger.format {
            ledger_config::LogFormat::Compact => ledger_logger::LogFormat::Compact,
            ledger_config::LogFormat::Json => ledger_logger::LogFormat::Json,
        };
        ledger_logger::init(log_format, &config.logger.default_level);
        ledger_metrics::init();

        let mut options = Options::default();
        options.create_if_missing(true);
        options.create_missing_column_families(true);
        let mut descriptors: Vec<ColumnFamilyDescriptor> = block_store::column_families_for(&config.block_store)
            .into_iter()
            .map(|name| ColumnFamilyDescriptor::new(name, Options::default()))
            .collect();
        descriptors.push(ColumnFamilyDescriptor::new(
            config.merkle_state.node_key_prefix.clone(),
            Options::default(),
        ));
        let db = Arc::new(
            DB::open_cf_descriptors(&options, path, descriptors)
                .map_err(|e| ValidatorNodeError::OpenDatabase(e.to_string()))?,
        );

        let block_store = Arc::new(BlockStore::from_shared_db_with_config(db.clone(), &config.block_store));
        let block_manager = BlockManager::new(block_store.clone());
        let node_store = Arc::new(RocksDbNodeStore::new(db, config.merkle_state.node_key_prefix.clone()));
        let state = MerkleState::new(node_store);

        let controller = Arc::new(ChainController::new(
            block_manager.clone(),
            block_store.clone(),
            state.clone(),
            consensus.clone(),
            dispatch.clone(),
            config.chain_controller.validator_worker_pool_size,
            config.scheduler.max_processor_retries,
        ));

        let publisher = BlockPublisher::new(
            block_manager.clone(),
            block_store.clone(),
            controller.clone(),
            state.clone(),
            consensus,
            dispatch,
            config.chain_controller.validator_worker_pool_size,
            config.scheduler.max_processor_retries,
            block_signer,
            config.publisher,
        );

        let heartbeat_timeout = config.processor.heartbeat_interval() * config.processor.missed_heartbeats_limit;
        let processor_registry = txn_processor_api::ProcessorRegistry::new(heartbeat_timeout);
        let heartbeat_sweep = txn_processor_api::spawn_heartbeat_sweep(processor_registry.clone(), config.processor.heartbeat_interval());

        Ok(Self {
            block_manager,
            block_store,
            state,
            controller,
            publisher,
            processor_registry,
            heartbeat_sweep,
            config,
        })
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn block_manager(&self) -> &BlockManager {
        &self.block_manager
    }

    pub fn block_store(&self) -> &Arc<BlockStore> {
        &self.block_store
    }

    pub fn state(&self) -> &MerkleState {
        &self.state
    }

    pub fn controller(&self) -> &Arc<ChainController<D>> {
        &self.controller
    }

    pub fn publisher(&self) -> &BlockPublisher<D> {
        &self.publisher
    }

    pub fn processor_registry(&self) -> &Arc<ProcessorRegistry> {
        &self.processor_registry
    }

    /// Installs the genesis block directly as chain head, committing
    /// `initial_state_changes` against the empty root first (spec.md §3:
    /// genesis is `block_number == 0` with the sentinel previous id; there
    /// is no predecessor for BlockValidator to check).
    pub fn bootstrap_genesis(
        &self,
        initial_state_changes: Vec<StateChange>,
        signer: &PrivateKey,
    ) -> Result<Block, ValidatorNodeError> {
        let root = self.state.commit(&MerkleState::empty_root(), &initial_state_changes)?;
        let genesis = Block::new_signed(genesis_previous_id(), 0, vec![], root, vec![], signer);
        self.controller.bootstrap_genesis(genesis.clone())?;
        info!(block_id = %genesis.id(), "validator node bootstrapped from genesis");
        Ok(genesis)
    }

    /// Drains any candidates already queued for validation.
    pub async fn drain_validation_queue(&self) -> Result<(), ValidatorNodeError> {
        self.controller.drain_queue().await?;
        Ok(())
    }

    /// One assemble-validate-commit cycle on top of the current chain head:
    /// asks the publisher for a candidate, then drains it through the
    /// controller. `Ok(None)` if nothing was published this round.
    pub async fn publish_and_commit(&self) -> Result<Option<BlockId>, ValidatorNodeError> {
        let (head_id, _) = match self.block_store.chain_head()? {
            Some(head) => head,
            None => return Ok(None),
        };
        let published = self.publisher.try_publish(head_id).await?;
        self.controller.drain_queue().await?;
        Ok(published)
    }
}

/// Installs a panic hook that logs and aborts the process before unwinding,
/// for the one error kind spec.md §7 marks fatal: `IntegrityError`
/// ("BlockStore or MerkleState returned inconsistent data ... aborts the
/// process to prevent committing on corrupt state"). Call once at startup,
/// alongside `ValidatorNode::open`.
pub fn install_integrity_guard() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        tracing::error!(%info, "fatal integrity error, aborting process");
        default_hook(info);
        std::process::abort();
    }));
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use consensus_engine::DevModeEngine;
    use ledger_types::{Address, AddressPrefix, Batch, Transaction};
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
                    Address::parse(format!("aabbcc{}", "1".repeat(64))).unwrap(),
                    Some(scheduled.transaction.payload.clone()),
                )],
                reads: vec![],
                events: vec![],
            })
        }
    }

    fn node(dir: &tempfile::TempDir) -> (ValidatorNode<EchoDispatch>, PrivateKey) {
        let signer = PrivateKey::generate();
        let consensus: Arc<dyn ConsensusEngine> = Arc::new(DevModeEngine::new());
        let node = ValidatorNode::open(dir.path(), NodeConfig::default(), consensus, EchoDispatch, PrivateKey::generate()).unwrap();
        (node, signer)
    }

    #[test]
    fn open_installs_a_processor_registry() {
        let dir = tempfile::tempdir().unwrap();
        let (node, _signer) = node(&dir);
        let id = node.processor_registry().register("intkey", "1.0", vec!["aabbcc".into()]);
        assert!(node.processor_registry().is_registered(id));
    }

    #[test]
    fn bootstrap_genesis_sets_the_chain_head() {
        let dir = tempfile::tempdir().unwrap();
        let (node, signer) = node(&dir);
        let genesis = node.bootstrap_genesis(vec![], &signer).unwrap();
        let (head_id, head_number) = node.block_store().chain_head().unwrap().unwrap();
        assert_eq!(head_id, genesis.id());
        assert_eq!(head_number, 0);
    }

    #[test]
    fn bootstrap_genesis_commits_initial_state_changes() {
        let dir = tempfile::tempdir().unwrap();
        let (node, signer) = node(&dir);
        let address = Address::parse(format!("aabbcc{}", "2".repeat(64))).unwrap();
        let genesis = node
            .bootstrap_genesis(
                vec![StateChange {
                    address: address.clone(),
                    value: Some(b"seed".to_vec()),
                }],
                &signer,
            )
            .unwrap();
        assert_eq!(node.state().read(&genesis.header.state_root, &address).unwrap(), Some(b"seed".to_vec()));
    }

    #[tokio::test]
    async fn publish_and_commit_advances_the_chain_head() {
        let dir = tempfile::tempdir().unwrap();
        let (node, signer) = node(&dir);
        node.bootstrap_genesis(vec![], &signer).unwrap();

        let txn = Transaction::new_signed(
            "intkey",
            "1.0",
            vec![AddressPrefix::parse("aabbcc").unwrap()],
            vec![AddressPrefix::parse("aabbcc").unwrap()],
            vec![],
            b"payload".to_vec(),
            0,
            signer.public_key(),
            &signer,
        );
        let batch = Batch::new_signed(vec![txn], false, &signer);
        node.publisher().submit_batch(batch).unwrap();

        let published = node.publish_and_commit().await.unwrap();
        assert!(published.is_some());
        let (head_id, head_number) = node.block_store().chain_head().unwrap().unwrap();
        assert_eq!(Some(head_id), published);
        assert_eq!(head_number, 1);
    }
}
