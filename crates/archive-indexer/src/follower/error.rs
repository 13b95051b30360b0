use crate::source::SourceError;

use archive_core::{
    CodecError,
    Identifier,
    ResultError,
    StateCommitment,
    ValidationError,
};

#[derive(Debug, thiserror::Error)]
pub enum FollowerError {
    #[error("No block data available")]
    Unavailable,
    #[error("No block is current")]
    NoCurrentBlock,
    #[error("Block data requested for wrong block height (current: {current}, requested: {requested})")]
    WrongHeight { current: u64, requested: u64 },

    #[error("Fatal discrepancy: received block {height} below first height {floor}")]
    BelowFloor { height: u64, floor: u64 },
    #[error("Fatal discrepancy: received block {height} at or below consumed height {current}")]
    AlreadyConsumed { height: u64, current: u64 },
    #[error("Fatal discrepancy: received block {height} twice")]
    DuplicateHeight { height: u64 },
    #[error(
        "Fatal discrepancy: missing block data for height {height} with {buffered} other blocks buffered"
    )]
    MissingHeight { height: u64, buffered: usize },
    #[error(
        "Fatal discrepancy: seal for block {block_id} commits to {sealed} but its execution result ends in {computed}"
    )]
    SealMismatch {
        block_id: Identifier,
        sealed: StateCommitment,
        computed: StateCommitment,
    },

    #[error("Could not read block data")]
    Read(#[source] SourceError),
    #[error("Could not decode block data")]
    Decode(#[source] CodecError),
    #[error("Invalid block data")]
    Invalid(#[source] ValidationError),
    #[error("Could not compute state commitment from execution result")]
    Result(#[source] ResultError),
    #[error("Block data read task failed")]
    Join(#[source] tokio::task::JoinError),
}

impl FollowerError {
    /// The requested data has not arrived yet; retrying later may succeed.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable)
    }

    /// The block stream is inconsistent and the run cannot continue.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::BelowFloor { .. }
                | Self::AlreadyConsumed { .. }
                | Self::DuplicateHeight { .. }
                | Self::MissingHeight { .. }
                | Self::SealMismatch { .. }
                | Self::Result(_)
        )
    }
}
