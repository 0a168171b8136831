// SPDX-License-Identifier: Apache-2.0

use ledger_types::{Address, BatchId, Transaction, TransactionId};
use txn_processor_api::ContextId;

/// Why a transaction failed (spec.md §7's taxonomy, realized as a closed
/// set of terminal outcomes).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidKind {
    AuthorizationViolation,
    UnmetDependency,
    ProcessorTimeout,
    ProcessorError,
    NoProcessor,
    ProcessorRejected,
}

/// What a processor handed back for one transaction beyond its state
/// effect: events it raised, plus any opaque receipt data it attached.
/// Threaded through unchanged from `txn_processor_api::ProcessOutcome` so it
/// can be surfaced on commit (spec.md §4.5: "receipts are emitted atomically
/// with commit").
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Receipt {
    pub data: Vec<u8>,
    pub events: Vec<(String, Vec<u8>)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionOutcome {
    Valid { changes: Vec<StateUpdate>, receipt: Receipt },
    Invalid { kind: InvalidKind, message: String, extended_data: Vec<u8> },
}

/// A transaction dispatched by [`crate::Scheduler::next_transaction`],
/// still awaiting [`crate::Scheduler::finalize`].
#[derive(Debug, Clone)]
pub struct ScheduledTransaction {
    pub transaction: Transaction,
    pub context_id: ContextId,
    pub batch_id: BatchId,
}

/// The result of applying one batch against the speculative state.
#[derive(Debug, Clone)]
pub struct BatchOutcome {
    pub batch_id: BatchId,
    /// `false` iff a transaction inside the batch went Invalid, rolling
    /// the whole batch back (spec.md §4.4 batch atomicity).
    pub applied: bool,
    pub transaction_outcomes: Vec<(TransactionId, TransactionOutcome)>,
}

/// A single transaction's validated state effect, ready to merge into the
/// speculative overlay (spec.md §4.4: "A Valid result includes the state
/// updates ... to merge into the speculative state").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateUpdate {
    pub address: Address,
    pub value: Option<Vec<u8>>,
}
