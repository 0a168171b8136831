// SPDX-License-Identifier: Apache-2.0

use crate::canonical::CanonicalEncode;
use crate::transaction::{Transaction, TransactionId};
use ledger_crypto::{sha512_hex, PrivateKey, PublicKey, Signature};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BatchId(pub String);

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl CanonicalEncode for BatchId {
    fn encode(&self, out: &mut Vec<u8>) {
        self.0.encode(out);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchHeader {
    pub signer_public_key: PublicKey,
    pub transaction_ids: Vec<TransactionId>,
    pub trace: bool,
}

impl CanonicalEncode for BatchHeader {
    fn encode(&self, out: &mut Vec<u8>) {
        self.signer_public_key.to_bytes().to_vec().encode(out);
        self.transaction_ids.encode(out);
        self.trace.encode(out);
    }
}

impl BatchHeader {
    pub fn id(&self) -> BatchId {
        BatchId(sha512_hex(&self.canonical_bytes()))
    }
}

/// The atomic unit of inclusion: either every transaction in the batch is
/// applied, or none is (spec.md §3).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Batch {
    pub header: BatchHeader,
    pub transactions: Vec<Transaction>,
    pub header_signature: Signature,
}

impl Batch {
    pub fn new_signed(transactions: Vec<Transaction>, trace: bool, signer: &PrivateKey) -> Self {
        let transaction_ids = transactions.iter().map(Transaction::id).collect();
        let header = BatchHeader {
            signer_public_key: signer.public_key(),
            transaction_ids,
            trace,
        };
        let header_signature = signer.sign(&header.canonical_bytes());
        Batch {
            header,
            transactions,
            header_signature,
        }
    }

    pub fn id(&self) -> BatchId {
        self.header.id()
    }

    pub fn verify_signature(&self) -> Result<(), ledger_crypto::CryptoError> {
        self.header
            .signer_public_key
            .verify(&self.header.canonical_bytes(), &self.header_signature)?;
        let expected: Vec<TransactionId> = self.transactions.iter().map(Transaction::id).collect();
        if expected != self.header.transaction_ids {
            return Err(ledger_crypto::CryptoError::InvalidSignature);
        }
        for txn in &self.transactions {
            txn.verify_signature()?;
        }
        Ok(())
    }
}
