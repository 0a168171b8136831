// SPDX-License-Identifier: Apache-2.0

use crate::canonical::CanonicalEncode;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub const ADDRESS_LENGTH: usize = 70;
pub const NAMESPACE_LENGTH: usize = 6;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AddressError {
    #[error("address must be exactly {ADDRESS_LENGTH} hex characters, got {0}")]
    WrongLength(usize),
    #[error("address contains non-hex characters")]
    NotHex,
}

/// A 70-lower-case-hex-character state key (spec.md §3, §6). The first six
/// characters are the family namespace; the rest are family-defined.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address(String);

impl Address {
    pub fn parse(s: impl Into<String>) -> Result<Self, AddressError> {
        let s = s.into();
        if s.len() != ADDRESS_LENGTH {
            return Err(AddressError::WrongLength(s.len()));
        }
        if !s.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()) {
            return Err(AddressError::NotHex);
        }
        Ok(Address(s))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn namespace(&self) -> &str {
        &self.0[..NAMESPACE_LENGTH]
    }

    /// True iff `self` falls under the declared `prefix` (1-70 hex chars),
    /// the rule spec.md §3 uses for input/output authorization.
    pub fn under_prefix(&self, prefix: &str) -> bool {
        self.0.starts_with(prefix)
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self.0)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for Address {
    type Error = AddressError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Address::parse(value)
    }
}

impl From<Address> for String {
    fn from(value: Address) -> Self {
        value.0
    }
}

impl CanonicalEncode for Address {
    fn encode(&self, out: &mut Vec<u8>) {
        self.0.encode(out);
    }
}

/// An input/output declaration: a hex prefix of 1-70 characters constraining
/// what state a transaction may touch (spec.md §3).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AddressPrefix(String);

impl AddressPrefix {
    pub fn parse(s: impl Into<String>) -> Result<Self, AddressError> {
        let s = s.into();
        if s.is_empty() || s.len() > ADDRESS_LENGTH {
            return Err(AddressError::WrongLength(s.len()));
        }
        if !s.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()) {
            return Err(AddressError::NotHex);
        }
        Ok(AddressPrefix(s))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn matches(&self, address: &Address) -> bool {
        address.under_prefix(&self.0)
    }
}

impl TryFrom<String> for AddressPrefix {
    type Error = AddressError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        AddressPrefix::parse(value)
    }
}

impl From<AddressPrefix> for String {
    fn from(value: AddressPrefix) -> Self {
        value.0
    }
}

impl CanonicalEncode for AddressPrefix {
    fn encode(&self, out: &mut Vec<u8>) {
        self.0.encode(out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hex70(byte: char) -> String {
        std::iter::repeat(byte).take(ADDRESS_LENGTH).collect()
    }

    #[test]
    fn rejects_wrong_length() {
        assert_eq!(
            Address::parse("ab".repeat(10)),
            Err(AddressError::WrongLength(20))
        );
    }

    #[test]
    fn rejects_non_hex() {
        let mut s = hex70('a');
        s.replace_range(0..1, "g");
        assert_eq!(Address::parse(s), Err(AddressError::NotHex));
    }

    #[test]
    fn rejects_uppercase() {
        let mut s = hex70('a');
        s.replace_range(0..1, "A");
        assert_eq!(Address::parse(s), Err(AddressError::NotHex));
    }

    #[test]
    fn namespace_is_first_six_chars() {
        let addr = Address::parse(format!("aabbcc{}", "0".repeat(64))).unwrap();
        assert_eq!(addr.namespace(), "aabbcc");
    }

    #[test]
    fn prefix_matching() {
        let addr = Address::parse(format!("aabbcc{}", "0".repeat(64))).unwrap();
        let prefix = AddressPrefix::parse("aabbcc").unwrap();
        assert!(prefix.matches(&addr));
        let other = AddressPrefix::parse("ddeeff").unwrap();
        assert!(!other.matches(&addr));
    }
}
