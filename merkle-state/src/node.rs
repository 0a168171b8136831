// SPDX-License-Identifier: Apache-2.0

//! The authenticated trie node (spec.md §4.1): "each node stores either a
//! leaf payload or up to 16 child hashes plus an optional value."
//! Serialization is hand-rolled and canonical (stable field order,
//! fixed-width integers) so identical logical contents hash identically
//! regardless of what wrote them.

use ledger_crypto::sha256;
use ledger_types::CanonicalEncode;

pub type NodeHash = String;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Node {
    pub children: [Option<NodeHash>; 16],
    pub value: Option<Vec<u8>>,
}

impl Node {
    pub fn is_empty(&self) -> bool {
        self.value.is_none() && self.children.iter().all(Option::is_none)
    }

    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.value.encode(&mut out);
        for child in &self.children {
            child.encode(&mut out);
        }
        out
    }

    pub fn hash(&self) -> NodeHash {
        hex::encode(sha256(&self.canonical_bytes()))
    }

    pub fn encode(&self) -> Vec<u8> {
        self.canonical_bytes()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut cursor = Cursor::new(bytes);
        let value = cursor.read_option_bytes()?;
        let mut children: [Option<NodeHash>; 16] = Default::default();
        for slot in children.iter_mut() {
            *slot = cursor.read_option_string()?;
        }
        Ok(Node { children, value })
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("truncated node encoding")]
    Truncated,
}

struct Cursor<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Cursor { bytes, offset: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        if self.offset + len > self.bytes.len() {
            return Err(DecodeError::Truncated);
        }
        let slice = &self.bytes[self.offset..self.offset + len];
        self.offset += len;
        Ok(slice)
    }

    fn read_u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    fn read_u32(&mut self) -> Result<u32, DecodeError> {
        let bytes = self.take(4)?;
        Ok(u32::from_be_bytes(bytes.try_into().unwrap()))
    }

    fn read_bytes(&mut self) -> Result<Vec<u8>, DecodeError> {
        let len = self.read_u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    fn read_string(&mut self) -> Result<String, DecodeError> {
        let bytes = self.read_bytes()?;
        String::from_utf8(bytes).map_err(|_| DecodeError::Truncated)
    }

    fn read_option_bytes(&mut self) -> Result<Option<Vec<u8>>, DecodeError> {
        match self.read_u8()? {
            0 => Ok(None),
            _ => Ok(Some(self.read_bytes()?)),
        }
    }

    fn read_option_string(&mut self) -> Result<Option<String>, DecodeError> {
        match self.read_u8()? {
            0 => Ok(None),
            _ => Ok(Some(self.read_string()?)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_node_round_trips() {
        let node = Node::default();
        assert!(node.is_empty());
        let bytes = node.encode();
        assert_eq!(Node::decode(&bytes).unwrap(), node);
    }

    #[test]
    fn node_with_value_and_children_round_trips() {
        let mut node = Node {
            value: Some(b"hello".to_vec()),
            ..Default::default()
        };
        node.children[3] = Some("a".repeat(64));
        node.children[15] = Some("b".repeat(64));
        let bytes = node.encode();
        assert_eq!(Node::decode(&bytes).unwrap(), node);
        assert!(!node.is_empty());
    }

    #[test]
    fn different_contents_hash_differently() {
        let a = Node {
            value: Some(b"a".to_vec()),
            ..Default::default()
        };
        let b = Node {
            value: Some(b"b".to_vec()),
            ..Default::default()
        };
        assert_ne!(a.hash(), b.hash());
    }

    #[test]
    fn identical_contents_hash_identically() {
        let a = Node {
            value: Some(b"same".to_vec()),
            ..Default::default()
        };
        let b = Node {
            value: Some(b"same".to_vec()),
            ..Default::default()
        };
        assert_eq!(a.hash(), b.hash());
    }
}
