// SPDX-License-Identifier: Apache-2.0

//! The Scheduler half of spec.md §4.4: a pure state machine (no I/O) that
//! decides which transaction dispatches next, tracks in-flight work, and
//! folds finalized results into the speculative overlay. The Executor
//! (`crate::executor`) drives it and performs the actual processor calls.

use crate::overlay::Overlay;
use crate::types::{BatchOutcome, InvalidKind, ScheduledTransaction, TransactionOutcome};
use ledger_types::{AddressPrefix, Batch, TransactionId};
use merkle_state::{MerkleError, MerkleState, NodeHash};
use std::collections::{HashMap, HashSet, VecDeque};
use thiserror::Error;
use tracing::{debug, warn};
use txn_processor_api::ContextId;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Merkle(#[from] MerkleError),
    #[error("finalize called with unknown context id {0}")]
    UnknownContext(ContextId),
    #[error("finish() called with batches still pending or in flight")]
    NotFinished,
}

/// The baseline a transaction's `dependencies` are checked against
/// (spec.md §4.4). A plain `HashSet<TransactionId>` covers in-memory
/// callers (tests, the Publisher); BlockValidator backs this with a
/// BlockStore-aware tracker so long ancestries don't need to be loaded
/// into memory up front.
pub trait DependencyTracker: Send + Sync {
    fn contains(&self, id: &TransactionId) -> bool;
    fn insert(&mut self, id: TransactionId);
}

impl DependencyTracker for HashSet<TransactionId> {
    fn contains(&self, id: &TransactionId) -> bool {
        HashSet::contains(self, id)
    }

    fn insert(&mut self, id: TransactionId) {
        HashSet::insert(self, id);
    }
}

fn prefixes_overlap(a: &[AddressPrefix], b: &[AddressPrefix]) -> bool {
    a.iter().any(|pa| {
        b.iter()
            .any(|pb| pa.as_str().starts_with(pb.as_str()) || pb.as_str().starts_with(pa.as_str()))
    })
}

struct InFlightTransaction {
    index: usize,
    inputs: Vec<AddressPrefix>,
    outputs: Vec<AddressPrefix>,
}

/// Whether a not-yet-dispatched transaction's dependencies let it proceed
/// (spec.md §4.4: a dependency "must appear in an earlier or the same
/// block" — including earlier in the same batch).
enum DependencyState {
    /// Every dependency is satisfied; eligible to dispatch.
    Ready,
    /// At least one dependency is on an earlier same-batch transaction that
    /// hasn't resolved yet. Neither dispatchable nor invalid — re-checked
    /// on the next call.
    Blocked,
    /// At least one dependency is definitively unsatisfiable: missing
    /// entirely, resolved Invalid, or referencing a same-batch transaction
    /// that isn't earlier.
    Unmet,
}

fn dependency_state(active: &ActiveBatch, satisfied: &dyn DependencyTracker, index: usize) -> DependencyState {
    let txn = &active.batch.transactions[index];
    let mut blocked = false;
    for dep in &txn.header.dependencies {
        if satisfied.contains(dep) {
            continue;
        }
        match active.batch.transactions.iter().position(|t| t.id() == *dep) {
            Some(pos) if pos < index => match active.finalized.get(&pos) {
                Some(TransactionOutcome::Valid { .. }) => continue,
                Some(TransactionOutcome::Invalid { .. }) => return DependencyState::Unmet,
                None => blocked = true,
            },
            _ => return DependencyState::Unmet,
        }
    }
    if blocked {
        DependencyState::Blocked
    } else {
        DependencyState::Ready
    }
}

struct ActiveBatch<'a> {
    batch: Batch,
    dispatched: HashSet<usize>,
    finalized: HashMap<usize, TransactionOutcome>,
    in_flight: HashMap<ContextId, InFlightTransaction>,
    overlay: Overlay<'a>,
    any_invalid: bool,
}

/// Drives one block's (or one candidate block's) batches against a
/// speculative state overlay chained off `base_root`.
pub struct Scheduler<'a> {
    state: &'a MerkleState,
    queue: VecDeque<Batch>,
    active: Option<ActiveBatch<'a>>,
    running_root: NodeHash,
    satisfied_dependencies: Box<dyn DependencyTracker>,
    outcomes: Vec<BatchOutcome>,
    next_context_id: ContextId,
}

impl<'a> Scheduler<'a> {
    /// `satisfied_dependencies` is the set of transaction ids already
    /// committed in this block's ancestry — the baseline a transaction's
    /// `dependencies` list is checked against (spec.md §4.4).
    pub fn new(
        state: &'a MerkleState,
        base_root: NodeHash,
        satisfied_dependencies: impl DependencyTracker + 'static,
    ) -> Self {
        Self {
            state,
            queue: VecDeque::new(),
            active: None,
            running_root: base_root,
            satisfied_dependencies: Box::new(satisfied_dependencies),
            outcomes: Vec::new(),
            next_context_id: 0,
        }
    }

    pub fn add_batch(&mut self, batch: Batch) {
        self.queue.push_back(batch);
    }

    pub fn current_root(&self) -> &NodeHash {
        &self.running_root
    }

    /// Batches resolved so far, in completion order. Lets a caller that
    /// feeds batches in one at a time (the Publisher assembling a
    /// candidate block, spec.md §4.7) inspect each outcome before
    /// deciding whether to keep adding more, without having to `finish()`
    /// the scheduler to see them.
    pub fn outcomes(&self) -> &[BatchOutcome] {
        &self.outcomes
    }

    pub fn is_finished(&self) -> bool {
        self.active.is_none() && self.queue.is_empty()
    }

    /// Returns the next dispatchable transaction, or `None` if nothing is
    /// currently eligible (either everything is blocked on in-flight work,
    /// or the scheduler is finished). Transactions whose `dependencies`
    /// are unmet resolve immediately as Invalid without ever dispatching.
    pub fn next_transaction(&mut self) -> Result<Option<ScheduledTransaction>, SchedulerError> {
        loop {
            if self.active.is_none() {
                let Some(batch) = self.queue.pop_front() else {
                    return Ok(None);
                };
                self.active = Some(ActiveBatch {
                    batch,
                    dispatched: HashSet::new(),
                    finalized: HashMap::new(),
                    in_flight: HashMap::new(),
                    overlay: Overlay::new(self.state, self.running_root.clone()),
                    any_invalid: false,
                });
            }

            let active = self.active.as_mut().expect("just ensured Some");
            let total = active.batch.transactions.len();

            // Auto-resolve every not-yet-dispatched transaction whose
            // dependencies are definitively unsatisfiable, without
            // involving a processor. A transaction blocked on an earlier
            // same-batch transaction that simply hasn't resolved yet is
            // left alone — it becomes eligible once that transaction
            // finalizes, possibly within this same pass since indices are
            // walked in order.
            for index in 0..total {
                if active.dispatched.contains(&index) {
                    continue;
                }
                if matches!(dependency_state(active, self.satisfied_dependencies.as_ref(), index), DependencyState::Unmet) {
                    let txn = &active.batch.transactions[index];
                    active.dispatched.insert(index);
                    active.any_invalid = true;
                    active.finalized.insert(
                        index,
                        TransactionOutcome::Invalid {
                            kind: InvalidKind::UnmetDependency,
                            message: "transaction dependency not satisfied".to_string(),
                            extended_data: Vec::new(),
                        },
                    );
                    warn!(transaction_id = %txn.id(), "unmet dependency, marking invalid without dispatch");
                }
            }

            let candidate = (0..total).find(|index| {
                if active.dispatched.contains(index) {
                    return false;
                }
                if !matches!(dependency_state(active, self.satisfied_dependencies.as_ref(), *index), DependencyState::Ready) {
                    return false;
                }
                let txn = &active.batch.transactions[*index];
                !active.in_flight.values().any(|inflight| {
                    prefixes_overlap(&txn.header.outputs, &inflight.inputs)
                        || prefixes_overlap(&txn.header.outputs, &inflight.outputs)
                        || prefixes_overlap(&txn.header.inputs, &inflight.outputs)
                })
            });

            match candidate {
                Some(index) => {
                    let txn = active.batch.transactions[index].clone();
                    let context_id = self.next_context_id;
                    self.next_context_id += 1;
                    active.dispatched.insert(index);
                    active.in_flight.insert(
                        context_id,
                        InFlightTransaction {
                            index,
                            inputs: txn.header.inputs.clone(),
                            outputs: txn.header.outputs.clone(),
                        },
                    );
                    debug!(transaction_id = %txn.id(), context_id, "dispatched transaction");
                    return Ok(Some(ScheduledTransaction {
                        transaction: txn,
                        context_id,
                        batch_id: active.batch.id(),
                    }));
                }
                None => {
                    if active.finalized.len() == total {
                        self.complete_active_batch()?;
                        continue;
                    }
                    return Ok(None);
                }
            }
        }
    }

    /// Reports the outcome of a previously dispatched transaction.
    pub fn finalize(&mut self, context_id: ContextId, outcome: TransactionOutcome) -> Result<(), SchedulerError> {
        let active = self.active.as_mut().ok_or(SchedulerError::UnknownContext(context_id))?;
        let inflight = active
            .in_flight
            .remove(&context_id)
            .ok_or(SchedulerError::UnknownContext(context_id))?;

        if let TransactionOutcome::Valid { changes, .. } = &outcome {
            for change in changes {
                active.overlay.write(change.address.clone(), change.value.clone());
            }
        } else {
            active.any_invalid = true;
        }
        active.finalized.insert(inflight.index, outcome);
        Ok(())
    }

    fn complete_active_batch(&mut self) -> Result<(), SchedulerError> {
        let active = self.active.take().expect("caller checked batch is fully finalized");
        let batch_id = active.batch.id();
        let applied = !active.any_invalid;

        if applied {
            if !active.overlay.is_empty() {
                self.running_root = active.overlay.commit()?;
            }
            for txn in &active.batch.transactions {
                self.satisfied_dependencies.insert(txn.id());
            }
        }

        let mut transaction_outcomes: Vec<(TransactionId, TransactionOutcome)> = active
            .finalized
            .into_iter()
            .map(|(index, outcome)| (active.batch.transactions[index].id(), outcome))
            .collect();
        transaction_outcomes.sort_by(|a, b| {
            let ia = active.batch.transactions.iter().position(|t| t.id() == a.0).unwrap();
            let ib = active.batch.transactions.iter().position(|t| t.id() == b.0).unwrap();
            ia.cmp(&ib)
        });

        debug!(batch_id = %batch_id, applied, "batch resolved");
        self.outcomes.push(BatchOutcome {
            batch_id,
            applied,
            transaction_outcomes,
        });
        Ok(())
    }

    /// Packages the final result. Errors if batches are still queued or in
    /// flight (spec.md §4.4: "blocks until all dispatched transactions
    /// have returned").
    pub fn finish(self) -> Result<(Vec<BatchOutcome>, NodeHash), SchedulerError> {
        if !self.is_finished() {
            return Err(SchedulerError::NotFinished);
        }
        Ok((self.outcomes, self.running_root))
    }
}
