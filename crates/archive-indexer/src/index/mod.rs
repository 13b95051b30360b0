//! Durable, height-addressed index of the archived history.
//!
//! The [`Writer`] stages records into sled batches and commits them on a
//! bounded worker pool. The [`Reader`] serves point lookups, bounded event
//! queries and batched register reads.

mod error;
mod reader;
mod writer;

pub use error::IndexError;
pub use reader::{
    CONCURRENT_PATH_READ_LIMIT,
    Reader,
};
pub use writer::{
    Writer,
    WriterConfig,
};
