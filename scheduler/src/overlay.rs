// SPDX-License-Identifier: Apache-2.0

//! A speculative overlay on top of a MerkleState root: "state is
//! represented as a chain of overlays on MerkleState; each batch commits
//! its overlay into the parent on success or discards it on failure"
//! (spec.md §4.4).

use ledger_types::Address;
use merkle_state::{MerkleError, MerkleState, NodeHash, StateChange};
use std::collections::HashMap;

/// In-memory writes layered over a stable MerkleState root. Reads check
/// the overlay first, falling through to the underlying trie.
pub struct Overlay<'a> {
    state: &'a MerkleState,
    base: NodeHash,
    writes: HashMap<Address, Option<Vec<u8>>>,
}

impl<'a> Overlay<'a> {
    pub fn new(state: &'a MerkleState, base: NodeHash) -> Self {
        Self {
            state,
            base,
            writes: HashMap::new(),
        }
    }

    pub fn read(&self, address: &Address) -> Result<Option<Vec<u8>>, MerkleError> {
        if let Some(value) = self.writes.get(address) {
            return Ok(value.clone());
        }
        self.state.read(&self.base, address)
    }

    pub fn write(&mut self, address: Address, value: Option<Vec<u8>>) {
        self.writes.insert(address, value);
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    /// Merges every buffered write into the base root, producing the new
    /// root. Leaves `self.base` untouched; the caller decides whether to
    /// keep using this overlay or discard it.
    pub fn commit(&self) -> Result<NodeHash, MerkleError> {
        let changes: Vec<StateChange> = self
            .writes
            .iter()
            .map(|(address, value)| StateChange {
                address: address.clone(),
                value: value.clone(),
            })
            .collect();
        self.state.commit(&self.base, &changes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use merkle_state::InMemoryNodeStore;

    fn addr(byte: char) -> Address {
        Address::parse(std::iter::repeat(byte).take(70).collect::<String>()).unwrap()
    }

    #[test]
    fn overlay_read_prefers_buffered_write_over_base() {
        let state = MerkleState::new(InMemoryNodeStore::new());
        let base = MerkleState::empty_root();
        let mut overlay = Overlay::new(&state, base);
        assert_eq!(overlay.read(&addr('a')).unwrap(), None);
        overlay.write(addr('a'), Some(b"v1".to_vec()));
        assert_eq!(overlay.read(&addr('a')).unwrap(), Some(b"v1".to_vec()));
    }

    #[test]
    fn commit_merges_writes_without_mutating_base_field() {
        let state = MerkleState::new(InMemoryNodeStore::new());
        let base = MerkleState::empty_root();
        let mut overlay = Overlay::new(&state, base.clone());
        overlay.write(addr('a'), Some(b"v1".to_vec()));
        let new_root = overlay.commit().unwrap();
        assert_ne!(new_root, base);
        assert_eq!(state.read(&new_root, &addr('a')).unwrap(), Some(b"v1".to_vec()));
        assert_eq!(state.read(&base, &addr('a')).unwrap(), None);
    }
}
