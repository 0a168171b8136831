// SPDX-License-Identifier: Apache-2.0

//! Signing primitives for the core: secp256k1 ECDSA over a compressed
//! 33-byte public key, with a compact 64-byte `R||S` signature (big-endian
//! halves, no DER wrapper), matching spec.md §6. Digests used for block,
//! batch, and transaction ids are SHA-512; digests used for "the SHA-256
//! hash of those bytes" that the signature itself covers are SHA-256,
//! exactly as spec.md §6 distinguishes the two.

use k256::ecdsa::signature::{Signer, Verifier};
use k256::ecdsa::{Signature as EcdsaSignature, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha512};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CryptoError {
    #[error("malformed public key")]
    MalformedPublicKey,
    #[error("malformed private key")]
    MalformedPrivateKey,
    #[error("malformed signature")]
    MalformedSignature,
    #[error("signature does not verify")]
    InvalidSignature,
    #[error("invalid hex encoding")]
    InvalidHex,
}

/// SHA-256 digest, used as the pre-image the signature is computed over.
pub fn sha256(bytes: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hasher.finalize().into()
}

/// Hex-encoded SHA-512 digest, used for block/transaction/batch ids
/// (spec.md §6).
pub fn sha512_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha512::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[derive(Clone)]
pub struct PrivateKey(SigningKey);

impl PrivateKey {
    pub fn generate() -> Self {
        Self(SigningKey::random(&mut OsRng))
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey(*self.0.verifying_key())
    }

    /// Signs the SHA-256 digest of `header_bytes`, returning a compact
    /// 64-byte `R||S` signature.
    pub fn sign(&self, header_bytes: &[u8]) -> Signature {
        let digest = sha256(header_bytes);
        let sig: EcdsaSignature = self.0.sign(&digest);
        Signature(sig.to_bytes().into())
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PrivateKey(..)")
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicKey(VerifyingKey);

impl PublicKey {
    /// Compressed SEC1 encoding: 33 bytes.
    pub fn to_bytes(self) -> [u8; 33] {
        let encoded = self.0.to_encoded_point(true);
        let mut out = [0u8; 33];
        out.copy_from_slice(encoded.as_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let verifying_key =
            VerifyingKey::from_sec1_bytes(bytes).map_err(|_| CryptoError::MalformedPublicKey)?;
        Ok(Self(verifying_key))
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.to_bytes())
    }

    pub fn from_hex(s: &str) -> Result<Self, CryptoError> {
        let bytes = hex::decode(s).map_err(|_| CryptoError::InvalidHex)?;
        Self::from_bytes(&bytes)
    }

    /// Verifies `signature` over the SHA-256 digest of `header_bytes`.
    pub fn verify(&self, header_bytes: &[u8], signature: &Signature) -> Result<(), CryptoError> {
        let digest = sha256(header_bytes);
        let sig = EcdsaSignature::from_slice(&signature.0)
            .map_err(|_| CryptoError::MalformedSignature)?;
        self.0
            .verify(&digest, &sig)
            .map_err(|_| CryptoError::InvalidSignature)
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self.to_hex())
    }
}

impl Serialize for PublicKey {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_bytes(&self.to_bytes())
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let bytes = <Vec<u8>>::deserialize(deserializer)?;
        Self::from_bytes(&bytes).map_err(serde::de::Error::custom)
    }
}

/// Compact 64-byte `R||S` ECDSA signature, no DER wrapper (spec.md §6).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Signature(#[serde(with = "serde_bytes_64")] [u8; 64]);

impl Signature {
    pub fn to_bytes(self) -> [u8; 64] {
        self.0
    }

    pub fn from_bytes(bytes: [u8; 64]) -> Self {
        Self(bytes)
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, CryptoError> {
        let bytes = hex::decode(s).map_err(|_| CryptoError::InvalidHex)?;
        let array: [u8; 64] = bytes
            .try_into()
            .map_err(|_| CryptoError::MalformedSignature)?;
        Ok(Self(array))
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({})", self.to_hex())
    }
}

mod serde_bytes_64 {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8; 64], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(bytes)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<[u8; 64], D::Error> {
        let vec = <Vec<u8>>::deserialize(deserializer)?;
        vec.try_into()
            .map_err(|_| serde::de::Error::custom("expected 64 bytes"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn sign_then_verify_round_trips() {
        let key = PrivateKey::generate();
        let public = key.public_key();
        let message = b"header bytes go here";
        let signature = key.sign(message);
        public.verify(message, &signature).unwrap();
    }

    #[test]
    fn tampered_message_fails_verification() {
        let key = PrivateKey::generate();
        let public = key.public_key();
        let signature = key.sign(b"original");
        assert_eq!(
            public.verify(b"tampered", &signature),
            Err(CryptoError::InvalidSignature)
        );
    }

    #[test]
    fn public_key_hex_round_trips() {
        let key = PrivateKey::generate();
        let public = key.public_key();
        let hex = public.to_hex();
        assert_eq!(hex.len(), 66);
        assert_eq!(PublicKey::from_hex(&hex).unwrap(), public);
    }

    proptest! {
        #[test]
        fn sha512_hex_is_128_lowercase_hex_chars(data: Vec<u8>) {
            let digest = sha512_hex(&data);
            prop_assert_eq!(digest.len(), 128);
            prop_assert!(digest.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        }
    }
}
