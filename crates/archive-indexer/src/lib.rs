//! Height-addressed archive of execution and consensus history.
//!
//! Raw block data files flow through the [`ExecutionFollower`], are joined
//! with finalized block metadata by the [`ConsensusFollower`], and are
//! persisted by the index [`Writer`]. The index [`Reader`] serves the stored
//! history to downstream consumers.

#![allow(clippy::missing_errors_doc)]
#![allow(clippy::must_use_candidate)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

mod config;
pub mod follower;
pub mod index;
mod indexer;
mod keys;
mod macros;
mod metrics;
mod service;
pub mod source;

pub use config::Config;
pub use follower::{
    BlockMetadata,
    ConsensusFollower,
    ConsensusItem,
    ExecutionData,
    ExecutionFollower,
    FollowerConfig,
    FollowerError,
    MetadataError,
    SledBlockMetadata,
};
pub use index::{
    IndexError,
    Reader,
    Writer,
    WriterConfig,
};
pub use indexer::{
    Indexer,
    IndexerConfig,
    IndexerError,
};
pub use service::ArchiveService;
pub use source::{
    BlockSource,
    DirectorySource,
    SourceError,
};
