// SPDX-License-Identifier: Apache-2.0

//! Wire messages for the transaction-processor and consensus-engine
//! channels (spec.md §6, §4.8). Both channels share the same length-
//! prefixed framing (see `codec`); only the message payload differs.

use ledger_types::{Address, BlockId, TransactionHeader};
use serde::{Deserialize, Serialize};

/// Correlates requests and responses on a single connection, and scopes a
/// speculative state overlay for the duration of one transaction's
/// execution (spec.md GLOSSARY: "Context id").
pub type ContextId = u64;

/// Messages a transaction processor sends to the core, and the core's
/// replies (spec.md §6). State access is request/response, not
/// interactive: a processor reports every address it read and wrote in one
/// `ProcessResponse`, rather than issuing separate get/set calls mid-
/// transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessorMessage {
    Register {
        family: String,
        version: String,
        namespaces: Vec<String>,
    },
    RegisterResponse {
        accepted: bool,
        error: Option<String>,
    },
    Unregister,
    UnregisterResponse,
    Heartbeat,

    ProcessRequest {
        header: TransactionHeader,
        payload: Vec<u8>,
        context_id: ContextId,
        signature: ledger_crypto::Signature,
    },
    ProcessResponse(ProcessOutcome),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessOutcome {
    Ok {
        /// Addresses read while processing, checked against the
        /// transaction's declared `inputs` the same way `state_changes` is
        /// checked against `outputs` (spec.md §4.5's authorization check).
        reads: Vec<Address>,
        state_changes: Vec<(Address, Option<Vec<u8>>)>,
        events: Vec<(String, Vec<u8>)>,
    },
    InvalidTransaction {
        message: String,
        extended_data: Vec<u8>,
    },
    InternalError {
        message: String,
    },
}

/// Messages exchanged on the single-registration consensus-engine channel
/// (spec.md §4.8).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConsensusMessage {
    InitializeBlock {
        previous: BlockId,
    },
    SummarizeBlockRequest,
    SummarizeBlockResponse {
        summary: Vec<u8>,
    },
    FinalizeBlock {
        consensus_data: Vec<u8>,
    },
    FinalizeBlockResponse {
        block_id: BlockId,
    },
    CheckBlock {
        block_id: BlockId,
    },
    CommitBlock {
        block_id: BlockId,
    },
    CancelBlock {
        block_id: BlockId,
    },

    BlockNew {
        block_id: BlockId,
    },
    BlockValid {
        block_id: BlockId,
    },
    BlockInvalid {
        block_id: BlockId,
    },
    BlockCommit {
        block_id: BlockId,
    },
}
