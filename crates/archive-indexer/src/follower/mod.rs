//! Followers turning raw block data and finalization events into a per-height view.

mod consensus;
mod error;
mod execution;
mod metadata;

pub use consensus::{
    ConsensusFollower,
    ConsensusItem,
    poll_finalized,
};
pub use error::FollowerError;
pub use execution::{
    ExecutionFollower,
    FollowerConfig,
    MIN_CACHE_SIZE,
};
pub use metadata::{
    BlockMetadata,
    MetadataError,
    SledBlockMetadata,
};

use archive_core::{
    BlockData,
    Identifier,
};
use std::sync::Arc;

/// Access to buffered execution data by block identifier.
pub trait ExecutionData: Send + Sync {
    fn block_data(&self, block_id: &Identifier) -> Option<Arc<BlockData>>;
}

impl<E: ExecutionData + ?Sized> ExecutionData for Arc<E> {
    fn block_data(&self, block_id: &Identifier) -> Option<Arc<BlockData>> {
        (**self).block_data(block_id)
    }
}
