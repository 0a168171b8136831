// SPDX-License-Identifier: Apache-2.0

use crate::batch::{Batch, BatchId};
use crate::canonical::CanonicalEncode;
use ledger_crypto::{sha512_hex, PrivateKey, PublicKey, Signature};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockId(pub String);

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl CanonicalEncode for BlockId {
    fn encode(&self, out: &mut Vec<u8>) {
        self.0.encode(out);
    }
}

/// Canonical empty previous-id for the genesis block (spec.md §3).
pub fn genesis_previous_id() -> BlockId {
    BlockId(String::new())
}

/// A content-addressed MerkleState version identifier.
pub type StateRoot = String;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub previous_block_id: BlockId,
    pub block_number: u64,
    pub signer_public_key: PublicKey,
    pub batch_ids: Vec<BatchId>,
    pub state_root: StateRoot,
    pub consensus_payload: Vec<u8>,
}

impl CanonicalEncode for BlockHeader {
    fn encode(&self, out: &mut Vec<u8>) {
        self.previous_block_id.encode(out);
        self.block_number.encode(out);
        self.signer_public_key.to_bytes().to_vec().encode(out);
        self.batch_ids.encode(out);
        self.state_root.encode(out);
        self.consensus_payload.encode(out);
    }
}

impl BlockHeader {
    pub fn id(&self) -> BlockId {
        BlockId(sha512_hex(&self.canonical_bytes()))
    }
}

/// A signed record chaining batches into an ordered history (spec.md §3).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub batches: Vec<Batch>,
    pub header_signature: Signature,
}

impl Block {
    pub fn new_signed(
        previous_block_id: BlockId,
        block_number: u64,
        batches: Vec<Batch>,
        state_root: StateRoot,
        consensus_payload: Vec<u8>,
        signer: &PrivateKey,
    ) -> Self {
        let batch_ids = batches.iter().map(Batch::id).collect();
        let header = BlockHeader {
            previous_block_id,
            block_number,
            signer_public_key: signer.public_key(),
            batch_ids,
            state_root,
            consensus_payload,
        };
        let header_signature = signer.sign(&header.canonical_bytes());
        Block {
            header,
            batches,
            header_signature,
        }
    }

    pub fn id(&self) -> BlockId {
        self.header.id()
    }

    pub fn is_genesis(&self) -> bool {
        self.header.block_number == 0 && self.header.previous_block_id == genesis_previous_id()
    }

    pub fn verify_signature(&self) -> Result<(), ledger_crypto::CryptoError> {
        self.header
            .signer_public_key
            .verify(&self.header.canonical_bytes(), &self.header_signature)?;
        let expected: Vec<BatchId> = self.batches.iter().map(Batch::id).collect();
        if expected != self.header.batch_ids {
            return Err(ledger_crypto::CryptoError::InvalidSignature);
        }
        for batch in &self.batches {
            batch.verify_signature()?;
        }
        Ok(())
    }
}

/// Tagged, monotonic block status (spec.md §3): `Invalid` and `Committed`
/// are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BlockStatus {
    Unknown,
    Invalid,
    Valid,
    /// Header known (e.g. referenced by a child) but the body has not been
    /// fetched yet.
    Missing,
    Committed,
}

impl BlockStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, BlockStatus::Invalid | BlockStatus::Committed)
    }

    /// Whether `next` is a legal transition from `self` under spec.md §3's
    /// monotonicity invariant.
    pub fn can_transition_to(self, next: BlockStatus) -> bool {
        use BlockStatus::*;
        if self.is_terminal() {
            return false;
        }
        matches!(
            (self, next),
            (Unknown, Missing)
                | (Unknown, Valid)
                | (Unknown, Invalid)
                | (Missing, Valid)
                | (Missing, Invalid)
                | (Valid, Committed)
                | (Valid, Invalid)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses_cannot_transition() {
        assert!(!BlockStatus::Committed.can_transition_to(BlockStatus::Valid));
        assert!(!BlockStatus::Invalid.can_transition_to(BlockStatus::Valid));
    }

    #[test]
    fn valid_can_become_committed_or_invalid() {
        assert!(BlockStatus::Valid.can_transition_to(BlockStatus::Committed));
        assert!(BlockStatus::Valid.can_transition_to(BlockStatus::Invalid));
        assert!(!BlockStatus::Valid.can_transition_to(BlockStatus::Missing));
    }

    #[test]
    fn verify_signature_accepts_untampered_block() {
        let signer = PrivateKey::generate();
        let block = Block::new_signed(
            genesis_previous_id(),
            0,
            vec![],
            "root".to_string(),
            vec![],
            &signer,
        );
        block.verify_signature().unwrap();
        assert!(block.is_genesis());
    }

    #[test]
    fn verify_signature_rejects_state_root_tamper() {
        let signer = PrivateKey::generate();
        let mut block = Block::new_signed(
            genesis_previous_id(),
            0,
            vec![],
            "root".to_string(),
            vec![],
            &signer,
        );
        block.header.state_root = "different".to_string();
        assert!(block.verify_signature().is_err());
    }
}
