// SPDX-License-Identifier: Apache-2.0

//! The Executor half of spec.md §4.4: the outbound side that actually talks
//! to transaction processors. It drives [`Scheduler::next_transaction`],
//! dispatches each returned transaction, and reports the result back via
//! [`Scheduler::finalize`]. The Scheduler itself never touches a processor.

use crate::scheduler::{Scheduler, SchedulerError};
use crate::types::{InvalidKind, Receipt, ScheduledTransaction, StateUpdate, TransactionOutcome};
use async_trait::async_trait;
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use merkle_state::NodeHash;
use thiserror::Error;
use tracing::{debug, warn};
use txn_processor_api::{ContextId, ProcessOutcome};

/// Default bound on retries for a transient processor failure before it's
/// reported as terminal (spec.md §4.4: "a bounded number of retries on
/// transient transport failure"), used when a caller doesn't have a
/// `SchedulerConfig` on hand (e.g. `Executor::new`'s existing call sites).
/// [`Executor::with_max_attempts`] overrides it from configuration.
const DEFAULT_MAX_DISPATCH_ATTEMPTS: u32 = 3;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("no processor registered for family {family} version {version}")]
    NoProcessor { family: String, version: String },
    #[error("processor did not respond before the deadline")]
    Timeout,
    #[error("transport error dispatching to processor: {0}")]
    Transport(String),
}

/// The one outbound call the Executor needs: send a transaction to a
/// processor and await its outcome. Implementations own the actual
/// connection/registry lookup; this crate only defines the contract and
/// the retry/validation logic around it.
#[async_trait]
pub trait ProcessorDispatch: Send + Sync {
    async fn dispatch(&self, scheduled: &ScheduledTransaction) -> Result<ProcessOutcome, DispatchError>;
}

/// Drives `scheduler` to completion against `dispatch`, with up to
/// `concurrency` transactions in flight at a time and
/// [`DEFAULT_MAX_DISPATCH_ATTEMPTS`] (or a configured override) attempts per
/// transaction.
pub struct Executor<D> {
    dispatch: D,
    concurrency: usize,
    max_attempts: u32,
}

impl<D: ProcessorDispatch> Executor<D> {
    pub fn new(dispatch: D, concurrency: usize) -> Self {
        Self {
            dispatch,
            concurrency: concurrency.max(1),
            max_attempts: DEFAULT_MAX_DISPATCH_ATTEMPTS,
        }
    }

    /// As [`Executor::new`], but with the retry bound read from
    /// `SchedulerConfig::max_processor_retries` instead of the built-in
    /// default.
    pub fn with_max_attempts(dispatch: D, concurrency: usize, max_attempts: u32) -> Self {
        Self {
            dispatch,
            concurrency: concurrency.max(1),
            max_attempts: max_attempts.max(1),
        }
    }

    /// Runs `scheduler` to completion, returning its final `(BatchOutcome
    /// list, state root)` once every queued batch has resolved.
    pub async fn run(
        &self,
        mut scheduler: Scheduler<'_>,
    ) -> Result<(Vec<crate::types::BatchOutcome>, NodeHash), SchedulerError> {
        self.run_until_idle(&mut scheduler).await?;
        scheduler.finish()
    }

    /// Drives `scheduler` until it has nothing left to dispatch right now
    /// (`is_finished()`), without calling `finish()` — so a caller that
    /// feeds batches in incrementally (the Publisher assembling a
    /// candidate block one batch at a time, spec.md §4.7) can inspect each
    /// batch's outcome and decide whether to keep adding more before ever
    /// finalizing the scheduler.
    pub async fn run_until_idle(&self, scheduler: &mut Scheduler<'_>) -> Result<(), SchedulerError> {
        let mut in_flight = FuturesUnordered::new();

        loop {
            while in_flight.len() < self.concurrency {
                match scheduler.next_transaction()? {
                    Some(scheduled) => {
                        in_flight.push(self.dispatch_with_retry(scheduled));
                    }
                    None => break,
                }
            }

            if in_flight.is_empty() {
                // Nothing dispatched and nothing blocking on in-flight
                // work: every queued batch resolved on its own (e.g. all
                // of its transactions failed dependency checks without
                // ever dispatching).
                break;
            }

            let (context_id, outcome) = in_flight.next().await.expect("checked non-empty above");
            scheduler.finalize(context_id, outcome)?;
        }

        Ok(())
    }

    async fn dispatch_with_retry(&self, scheduled: ScheduledTransaction) -> (ContextId, TransactionOutcome) {
        let context_id = scheduled.context_id;
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.dispatch.dispatch(&scheduled).await {
                Ok(outcome) => return (context_id, self.validate(&scheduled, outcome)),
                Err(DispatchError::NoProcessor { family, version }) => {
                    warn!(%family, %version, transaction_id = %scheduled.transaction.id(), "no processor available");
                    return (
                        context_id,
                        TransactionOutcome::Invalid {
                            kind: InvalidKind::NoProcessor,
                            message: format!("no processor registered for {family} {version}"),
                            extended_data: Vec::new(),
                        },
                    );
                }
                Err(err) if attempt < self.max_attempts => {
                    warn!(transaction_id = %scheduled.transaction.id(), attempt, %err, "transient dispatch failure, retrying");
                    continue;
                }
                Err(DispatchError::Timeout) => {
                    return (
                        context_id,
                        TransactionOutcome::Invalid {
                            kind: InvalidKind::ProcessorTimeout,
                            message: "processor timed out after exhausting retries".to_string(),
                            extended_data: Vec::new(),
                        },
                    )
                }
                Err(DispatchError::Transport(message)) => {
                    return (
                        context_id,
                        TransactionOutcome::Invalid {
                            kind: InvalidKind::ProcessorError,
                            message,
                            extended_data: Vec::new(),
                        },
                    )
                }
            }
        }
    }

    /// Enforces declared input/output bounds on what a processor handed
    /// back, since its actual reads and writes aren't otherwise observable
    /// (spec.md §4.5's authorization check, applied here rather than
    /// inside the Scheduler, in both directions: a write outside the
    /// declared outputs and a read outside the declared inputs are both
    /// authorization violations).
    fn validate(&self, scheduled: &ScheduledTransaction, outcome: ProcessOutcome) -> TransactionOutcome {
        let result = self.validate_inner(scheduled, outcome);
        let outcome_label = match &result {
            TransactionOutcome::Valid { .. } => "valid",
            TransactionOutcome::Invalid { kind, .. } => match kind {
                InvalidKind::AuthorizationViolation => "authorization_violation",
                InvalidKind::UnmetDependency => "unmet_dependency",
                InvalidKind::ProcessorTimeout => "processor_timeout",
                InvalidKind::ProcessorError => "processor_error",
                InvalidKind::NoProcessor => "no_processor",
                InvalidKind::ProcessorRejected => "processor_rejected",
            },
        };
        ledger_metrics::TRANSACTIONS_EXECUTED.with_label_values(&[outcome_label]).inc();
        result
    }

    fn validate_inner(&self, scheduled: &ScheduledTransaction, outcome: ProcessOutcome) -> TransactionOutcome {
        match outcome {
            ProcessOutcome::Ok { reads, state_changes, events } => {
                let write_violation = state_changes
                    .iter()
                    .find(|(address, _)| !scheduled.transaction.header.outputs.iter().any(|prefix| prefix.matches(address)));
                if let Some((address, _)) = write_violation {
                    warn!(transaction_id = %scheduled.transaction.id(), %address, "processor wrote outside declared outputs");
                    return TransactionOutcome::Invalid {
                        kind: InvalidKind::AuthorizationViolation,
                        message: format!("write to {address} not covered by any declared output"),
                        extended_data: Vec::new(),
                    };
                }
                let read_violation = reads
                    .iter()
                    .find(|address| !scheduled.transaction.header.inputs.iter().any(|prefix| prefix.matches(address)));
                if let Some(address) = read_violation {
                    warn!(transaction_id = %scheduled.transaction.id(), %address, "processor read outside declared inputs");
                    return TransactionOutcome::Invalid {
                        kind: InvalidKind::AuthorizationViolation,
                        message: format!("read of {address} not covered by any declared input"),
                        extended_data: Vec::new(),
                    };
                }
                debug!(transaction_id = %scheduled.transaction.id(), changes = state_changes.len(), "transaction valid");
                TransactionOutcome::Valid {
                    changes: state_changes
                        .into_iter()
                        .map(|(address, value)| StateUpdate { address, value })
                        .collect(),
                    receipt: Receipt { data: Vec::new(), events },
                }
            }
            ProcessOutcome::InvalidTransaction { message, extended_data } => TransactionOutcome::Invalid {
                kind: InvalidKind::ProcessorRejected,
                message,
                extended_data,
            },
            ProcessOutcome::InternalError { message } => TransactionOutcome::Invalid {
                kind: InvalidKind::ProcessorError,
                message,
                extended_data: Vec::new(),
            },
        }
    }
}
