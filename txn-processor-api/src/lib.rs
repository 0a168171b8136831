// SPDX-License-Identifier: Apache-2.0

//! The wire protocol and processor registry shared by the Executor's
//! transaction-processor channel and the ConsensusEngine's control channel
//! (spec.md §4.4, §4.8, §6).

pub mod codec;
pub mod message;
pub mod registry;

pub use codec::{decode_frame, encode_frame, read_message, write_message, CodecError};
pub use message::{ConsensusMessage, ContextId, ProcessOutcome, ProcessorMessage};
pub use registry::{spawn_heartbeat_sweep, FamilyKey, ProcessorId, ProcessorRegistry};
