// SPDX-License-Identifier: Apache-2.0

use crate::address::AddressPrefix;
use crate::canonical::CanonicalEncode;
use ledger_crypto::{sha256, sha512_hex, PublicKey, Signature};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Hex-encoded SHA-512 digest of a transaction header (spec.md §6).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransactionId(pub String);

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl CanonicalEncode for TransactionId {
    fn encode(&self, out: &mut Vec<u8>) {
        self.0.encode(out);
    }
}

/// The signed, immutable header of a transaction (spec.md §3). Inputs and
/// outputs are address-prefix declarations; dependencies are ids of
/// transactions that must already appear in an earlier or the same block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionHeader {
    pub family_name: String,
    pub family_version: String,
    pub inputs: Vec<AddressPrefix>,
    pub outputs: Vec<AddressPrefix>,
    pub dependencies: Vec<TransactionId>,
    pub payload_hash: String,
    pub batcher_public_key: PublicKey,
    pub signer_public_key: PublicKey,
    pub nonce: u64,
}

impl CanonicalEncode for TransactionHeader {
    fn encode(&self, out: &mut Vec<u8>) {
        self.family_name.encode(out);
        self.family_version.encode(out);
        self.inputs.encode(out);
        self.outputs.encode(out);
        self.dependencies.encode(out);
        self.payload_hash.encode(out);
        self.batcher_public_key.to_bytes().to_vec().encode(out);
        self.signer_public_key.to_bytes().to_vec().encode(out);
        self.nonce.encode(out);
    }
}

impl TransactionHeader {
    pub fn id(&self) -> TransactionId {
        TransactionId(sha512_hex(&self.canonical_bytes()))
    }
}

/// A complete, immutable transaction: header, payload, and the signature
/// over the header bytes (spec.md §3).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub header: TransactionHeader,
    pub payload: Vec<u8>,
    pub header_signature: Signature,
}

impl Transaction {
    pub fn new_signed(
        family_name: impl Into<String>,
        family_version: impl Into<String>,
        inputs: Vec<AddressPrefix>,
        outputs: Vec<AddressPrefix>,
        dependencies: Vec<TransactionId>,
        payload: Vec<u8>,
        nonce: u64,
        batcher_public_key: PublicKey,
        signer: &ledger_crypto::PrivateKey,
    ) -> Self {
        let payload_hash = hex::encode(sha256(&payload));
        let header = TransactionHeader {
            family_name: family_name.into(),
            family_version: family_version.into(),
            inputs,
            outputs,
            dependencies,
            payload_hash,
            batcher_public_key,
            signer_public_key: signer.public_key(),
            nonce,
        };
        let header_signature = signer.sign(&header.canonical_bytes());
        Transaction {
            header,
            payload,
            header_signature,
        }
    }

    pub fn id(&self) -> TransactionId {
        self.header.id()
    }

    /// Verifies the header signature recovers against `signer_public_key`
    /// and that `payload_hash` matches the carried payload (spec.md §4.5
    /// step 2).
    pub fn verify_signature(&self) -> Result<(), ledger_crypto::CryptoError> {
        self.header
            .signer_public_key
            .verify(&self.header.canonical_bytes(), &self.header_signature)?;
        let actual_hash = hex::encode(sha256(&self.payload));
        if actual_hash != self.header.payload_hash {
            return Err(ledger_crypto::CryptoError::InvalidSignature);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledger_crypto::PrivateKey;

    fn sample_transaction(signer: &PrivateKey) -> Transaction {
        Transaction::new_signed(
            "intkey",
            "1.0",
            vec![AddressPrefix::parse("aabbcc").unwrap()],
            vec![AddressPrefix::parse("aabbcc").unwrap()],
            vec![],
            b"payload".to_vec(),
            0,
            signer.public_key(),
            signer,
        )
    }

    #[test]
    fn id_is_deterministic_for_identical_header() {
        let signer = PrivateKey::generate();
        let txn = sample_transaction(&signer);
        assert_eq!(txn.id(), txn.header.id());
        assert_eq!(txn.id().0.len(), 128);
    }

    #[test]
    fn verify_signature_accepts_untampered_transaction() {
        let signer = PrivateKey::generate();
        let txn = sample_transaction(&signer);
        txn.verify_signature().unwrap();
    }

    #[test]
    fn verify_signature_rejects_payload_tamper() {
        let signer = PrivateKey::generate();
        let mut txn = sample_transaction(&signer);
        txn.payload = b"different".to_vec();
        assert!(txn.verify_signature().is_err());
    }

    #[test]
    fn verify_signature_rejects_header_tamper() {
        let signer = PrivateKey::generate();
        let mut txn = sample_transaction(&signer);
        txn.header.nonce += 1;
        assert!(txn.verify_signature().is_err());
    }
}
