use crate::StateCommitment;

use alloy_primitives::{
    B256,
    Bytes,
};
use serde::{
    Deserialize,
    Serialize,
};

/// Address of a single register in the state trie.
pub type Path = B256;

/// Value stored at a register. Empty when the register was never written.
pub type RegisterValue = Bytes;

/// A register key together with its value.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload {
    pub key: Bytes,
    pub value: RegisterValue,
}

/// Ordered batch of register writes applied to the state trie.
///
/// `payloads[i]` is written at `paths[i]`.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrieUpdate {
    /// State commitment the update is applied on top of.
    pub root_hash: StateCommitment,
    pub paths: Vec<Path>,
    pub payloads: Vec<Payload>,
}

impl TrieUpdate {
    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}
