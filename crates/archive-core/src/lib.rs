//! Shared data model for the block archive.
//!
//! The types in this crate describe one block's worth of consensus and
//! execution output as it travels from the block source, through the
//! followers, into the height-addressed index.

#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]

mod block;
mod codec;
mod data;
mod ledger;
mod transaction;

#[cfg(any(test, feature = "test"))]
pub mod test_utils;

pub use alloy_primitives::{
    B256,
    Bytes,
    FixedBytes,
};

pub use block::{
    Block,
    Chunk,
    CollectionGuarantee,
    ExecutionResult,
    Header,
    Payload as BlockPayload,
    ResultError,
    Seal,
};
pub use codec::{
    BincodeCodec,
    Codec,
    CodecError,
};
pub use data::{
    BlockData,
    ValidationError,
};
pub use ledger::{
    Path,
    Payload,
    RegisterValue,
    TrieUpdate,
};
pub use transaction::{
    AccountAddress,
    CompleteCollection,
    Event,
    EventType,
    LightCollection,
    TransactionBody,
    TransactionResult,
};

/// Content-derived identifier of a block, collection, transaction or seal.
pub type Identifier = B256;

/// Digest summarizing the entire execution state after a block.
pub type StateCommitment = B256;
