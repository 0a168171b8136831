// SPDX-License-Identifier: Apache-2.0

//! Speculative batch execution over MerkleState (spec.md §4.4), split into
//! a pure state machine ([`Scheduler`]) and the outbound dispatch side
//! ([`Executor`]) that actually talks to transaction processors.

mod executor;
mod overlay;
mod scheduler;
mod types;

pub use executor::{DispatchError, Executor, ProcessorDispatch};
pub use overlay::Overlay;
pub use scheduler::{DependencyTracker, Scheduler, SchedulerError};
pub use types::{BatchOutcome, InvalidKind, Receipt, ScheduledTransaction, StateUpdate, TransactionOutcome};
