use crate::{
    Identifier,
    StateCommitment,
};

use alloy_primitives::{
    Bytes,
    Keccak256,
};
use serde::{
    Deserialize,
    Serialize,
};

/// Header of a finalized block.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub parent_id: Identifier,
    pub height: u64,
    pub view: u64,
    /// Unix timestamp in milliseconds.
    pub timestamp: u64,
    pub payload_hash: Identifier,
}

impl Header {
    /// The block identifier.
    pub fn id(&self) -> Identifier {
        let mut hasher = Keccak256::new();
        hasher.update(self.parent_id);
        hasher.update(self.height.to_be_bytes());
        hasher.update(self.view.to_be_bytes());
        hasher.update(self.timestamp.to_be_bytes());
        hasher.update(self.payload_hash);
        hasher.finalize()
    }
}

/// Commitment of a collector cluster to a set of transactions.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionGuarantee {
    pub collection_id: Identifier,
    pub reference_block_id: Identifier,
    pub signer_ids: Vec<Identifier>,
    pub signature: Bytes,
}

impl CollectionGuarantee {
    /// Guarantees are addressed by the collection they guarantee.
    pub fn id(&self) -> Identifier {
        self.collection_id
    }
}

/// Attestation that the execution result of a block has been verified.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Seal {
    pub block_id: Identifier,
    pub result_id: Identifier,
    pub final_state: StateCommitment,
}

impl Seal {
    pub fn id(&self) -> Identifier {
        let mut hasher = Keccak256::new();
        hasher.update(self.block_id);
        hasher.update(self.result_id);
        hasher.update(self.final_state);
        hasher.finalize()
    }
}

/// A contiguous slice of a block's execution.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub index: u64,
    pub start_state: StateCommitment,
    pub end_state: StateCommitment,
    pub event_collection: Identifier,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ResultError {
    #[error("Execution result {0} has no chunks")]
    NoChunks(Identifier),
}

/// Outcome of executing a block, carried in the payload of a later block.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub previous_result_id: Identifier,
    pub block_id: Identifier,
    pub chunks: Vec<Chunk>,
}

impl ExecutionResult {
    pub fn id(&self) -> Identifier {
        let mut hasher = Keccak256::new();
        hasher.update(self.previous_result_id);
        hasher.update(self.block_id);
        for chunk in &self.chunks {
            hasher.update(chunk.index.to_be_bytes());
            hasher.update(chunk.start_state);
            hasher.update(chunk.end_state);
            hasher.update(chunk.event_collection);
        }
        hasher.finalize()
    }

    /// State commitment after the last chunk of the result.
    pub fn final_state_commitment(&self) -> Result<StateCommitment, ResultError> {
        self.chunks
            .last()
            .map(|chunk| chunk.end_state)
            .ok_or(ResultError::NoChunks(self.id()))
    }
}

/// Consensus payload of a block.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload {
    pub guarantees: Vec<CollectionGuarantee>,
    pub seals: Vec<Seal>,
    pub results: Vec<ExecutionResult>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub header: Header,
    pub payload: Payload,
}

impl Block {
    pub fn id(&self) -> Identifier {
        self.header.id()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::B256;

    #[test]
    fn test_header_id_changes_with_height() {
        let header = Header {
            height: 7,
            ..Default::default()
        };
        let next = Header {
            height: 8,
            ..header.clone()
        };

        assert_eq!(header.id(), header.clone().id());
        assert_ne!(header.id(), next.id());
    }

    #[test]
    fn test_final_state_commitment_uses_last_chunk() {
        let result = ExecutionResult {
            chunks: vec![
                Chunk {
                    end_state: B256::repeat_byte(1),
                    ..Default::default()
                },
                Chunk {
                    index: 1,
                    end_state: B256::repeat_byte(2),
                    ..Default::default()
                },
            ],
            ..Default::default()
        };

        assert_eq!(result.final_state_commitment(), Ok(B256::repeat_byte(2)));
    }

    #[test]
    fn test_final_state_commitment_without_chunks() {
        let result = ExecutionResult::default();

        assert_eq!(
            result.final_state_commitment(),
            Err(ResultError::NoChunks(result.id()))
        );
    }
}
