use archive_core::CodecError;

#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("{0} unavailable")]
    Unavailable(&'static str),
    #[error("Invalid height (given: {height}, first: {first}, last: {last})")]
    OutOfBounds { height: u64, first: u64, last: u64 },
    #[error("Got {paths} paths but {payloads} payloads")]
    PayloadMismatch { paths: usize, payloads: usize },
    #[error("Failed to get value for {index}/{total}")]
    Lookup {
        index: usize,
        total: usize,
        #[source]
        source: Box<IndexError>,
    },
    #[error("Index writer is closed")]
    Closed,
    #[error("An earlier index transaction failed to commit")]
    CommitFailed,

    #[error("Sled error")]
    Sled(#[source] std::io::Error),
    #[error("Codec error")]
    Codec(#[source] CodecError),
    #[error("Blocking index task failed")]
    Join(#[source] tokio::task::JoinError),
    #[error("Failed to build writer thread pool")]
    ThreadPool(#[source] rayon::ThreadPoolBuildError),
}

impl IndexError {
    /// The record has not been written (yet).
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}
