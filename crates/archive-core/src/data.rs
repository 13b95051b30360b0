use crate::{
    Block,
    CompleteCollection,
    Event,
    Identifier,
    StateCommitment,
    TransactionResult,
    TrieUpdate,
};

use serde::{
    Deserialize,
    Serialize,
};

/// One block worth of execution output, as produced by the block source.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockData {
    pub block: Block,
    pub collections: Vec<CompleteCollection>,
    pub tx_results: Vec<TransactionResult>,
    pub events: Vec<Event>,
    pub trie_updates: Vec<TrieUpdate>,
    /// State commitment after the block was executed.
    pub commit: StateCommitment,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Block data for height {height} has no trie updates")]
    MissingTrieUpdates { height: u64 },
    #[error("Trie update {index} has {paths} paths but {payloads} payloads")]
    MismatchedTrieUpdate {
        index: usize,
        paths: usize,
        payloads: usize,
    },
    #[error("Collection {index} does not match its guarantee (guaranteed: {guaranteed}, actual: {actual})")]
    CollectionMismatch {
        index: usize,
        guaranteed: Identifier,
        actual: Identifier,
    },
    #[error("Collection {index} is missing from the block payload guarantees")]
    UnguaranteedCollection { index: usize },
}

impl BlockData {
    pub fn height(&self) -> u64 {
        self.block.header.height
    }

    pub fn block_id(&self) -> Identifier {
        self.block.id()
    }

    /// Checks the fields every block must carry before it can be indexed.
    ///
    /// This is a structural check only. Consistency between blocks (seals
    /// against results) is verified by the execution follower.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.trie_updates.is_empty() {
            return Err(ValidationError::MissingTrieUpdates {
                height: self.height(),
            });
        }

        for (index, update) in self.trie_updates.iter().enumerate() {
            if update.paths.len() != update.payloads.len() {
                return Err(ValidationError::MismatchedTrieUpdate {
                    index,
                    paths: update.paths.len(),
                    payloads: update.payloads.len(),
                });
            }
        }

        for (index, collection) in self.collections.iter().enumerate() {
            let actual = collection.light().id();
            let guaranteed = collection.guarantee.collection_id;
            if actual != guaranteed {
                return Err(ValidationError::CollectionMismatch {
                    index,
                    guaranteed,
                    actual,
                });
            }

            let included = self
                .block
                .payload
                .guarantees
                .iter()
                .any(|guarantee| guarantee.collection_id == guaranteed);
            if !included {
                return Err(ValidationError::UnguaranteedCollection { index });
            }
        }

        Ok(())
    }
}
