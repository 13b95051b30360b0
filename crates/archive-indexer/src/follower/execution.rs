//! Strictly ordered view over block data files.
//!
//! [`ExecutionFollower::run`] buffers decoded blocks by height as their files
//! are announced, while a single consumer pulls trie updates with
//! [`ExecutionFollower::update`]. The buffer is bounded: once it holds
//! `cache_size` blocks, ingestion waits until the consumer moves past a height.
//! A follower resuming an existing index skips every block below its start
//! height.

use crate::{
    critical,
    follower::{
        ExecutionData,
        FollowerError,
    },
    metrics,
    source::BlockSource,
};

use archive_core::{
    BincodeCodec,
    BlockData,
    Codec,
    CollectionGuarantee,
    CompleteCollection,
    Event,
    Header,
    Identifier,
    LightCollection,
    Seal,
    StateCommitment,
    TransactionBody,
    TransactionResult,
    TrieUpdate,
};

use parking_lot::Mutex;
use std::{
    collections::{
        BTreeMap,
        HashMap,
    },
    sync::Arc,
};
use tokio::sync::{
    Notify,
    mpsc,
};
use tokio_util::sync::CancellationToken;
use tracing::{
    debug,
    info,
};

/// Blocks buffered ahead of the consumer by default.
pub const DEFAULT_CACHE_SIZE: usize = 1024;

/// The current block keeps its slot until the next height is buffered, so the
/// cache needs room for both.
pub const MIN_CACHE_SIZE: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FollowerConfig {
    /// Maximum number of blocks held in memory, including the current one.
    pub cache_size: usize,
    /// First height to consume. Lower heights are skipped.
    pub start_height: Option<u64>,
}

impl Default for FollowerConfig {
    fn default() -> Self {
        Self {
            cache_size: DEFAULT_CACHE_SIZE,
            start_height: None,
        }
    }
}

impl FollowerConfig {
    #[must_use]
    pub fn with_cache_size(mut self, cache_size: usize) -> Self {
        self.cache_size = cache_size.max(MIN_CACHE_SIZE);
        self
    }

    #[must_use]
    pub fn with_start_height(mut self, start_height: Option<u64>) -> Self {
        self.start_height = start_height;
        self
    }
}

/// Read position of the consumer.
struct Current {
    height: u64,
    data: Arc<BlockData>,
    index: usize,
}

impl Current {
    fn exhausted(&self) -> bool {
        self.index >= self.data.trie_updates.len()
    }
}

#[derive(Default)]
struct State {
    data: BTreeMap<u64, Arc<BlockData>>,
    heights: HashMap<Identifier, u64>,
    /// Lowest height seen. Fixed once the consumer starts.
    floor: Option<u64>,
    current: Option<Current>,
}

impl State {
    /// Blocks buffered besides the current one.
    fn ahead(&self) -> usize {
        self.data
            .len()
            .saturating_sub(usize::from(self.current.is_some()))
    }
}

pub struct ExecutionFollower<S, C = BincodeCodec> {
    source: S,
    codec: C,
    capacity: usize,
    start: Option<u64>,
    state: Mutex<State>,
    space: Notify,
    stop: CancellationToken,
}

impl<S: BlockSource, C: Codec> ExecutionFollower<S, C> {
    pub fn new(source: S, codec: C, config: FollowerConfig) -> Self {
        Self {
            source,
            codec,
            capacity: config.cache_size.max(MIN_CACHE_SIZE),
            start: config.start_height,
            state: Mutex::new(State {
                floor: config.start_height,
                ..Default::default()
            }),
            space: Notify::new(),
            stop: CancellationToken::new(),
        }
    }

    /// Buffers announced block files until stopped.
    ///
    /// Files are read and decoded on the blocking pool. Returns `Ok` when
    /// stopped or when the notification channel closes. Any read, decode,
    /// validation or ordering failure ends the loop with an error.
    pub async fn run(
        self: Arc<Self>,
        mut notify: mpsc::Receiver<String>,
    ) -> Result<(), FollowerError> {
        info!(capacity = self.capacity, "Starting execution follower");

        loop {
            if self.stop.is_cancelled() {
                info!("Execution follower stopped");
                return Ok(());
            }

            if self.is_full() {
                debug!(capacity = self.capacity, "Block cache full, waiting for consumer");
                tokio::select! {
                    () = self.stop.cancelled() => {}
                    () = self.space.notified() => {}
                }
                continue;
            }

            tokio::select! {
                () = self.stop.cancelled() => {}
                file = notify.recv() => {
                    let Some(file) = file else {
                        info!("Block notifications closed, stopping execution follower");
                        return Ok(());
                    };
                    let follower = Arc::clone(&self);
                    tokio::task::spawn_blocking(move || follower.ingest(&file))
                        .await
                        .map_err(FollowerError::Join)??;
                }
            }
        }
    }

    /// Reads, decodes and buffers one block data file.
    pub fn ingest(&self, file: &str) -> Result<u64, FollowerError> {
        let bytes = self.source.read(file).map_err(FollowerError::Read)?;
        let data: BlockData = self.codec.unmarshal(&bytes).map_err(FollowerError::Decode)?;
        let height = data.height();
        self.insert(data)?;
        debug!(height, file, "Buffered block data");
        Ok(height)
    }

    /// Validates and buffers decoded block data.
    ///
    /// Before the first [`update`](Self::update) the lowest buffered height
    /// becomes the first height to consume, unless a start height is
    /// configured. Afterwards any height that was already consumed, or lies
    /// below the first height, is rejected. Heights below the start height are
    /// dropped without error.
    pub fn insert(&self, data: BlockData) -> Result<(), FollowerError> {
        data.validate().map_err(FollowerError::Invalid)?;
        let height = data.height();
        if let Some(start) = self.start
            && height < start
        {
            debug!(height, start, "Skipping block data below start height");
            return Ok(());
        }

        let mut state = self.state.lock();
        if let Err(err) = Self::admit(&state, height) {
            critical!(error = %err, height, "Rejected block data");
            return Err(err);
        }

        if state.current.is_none() {
            state.floor = Some(state.floor.map_or(height, |floor| floor.min(height)));
        }
        state.heights.insert(data.block_id(), height);
        state.data.insert(height, Arc::new(data));
        metrics::record_ingested(height, state.data.len());
        Ok(())
    }

    fn admit(state: &State, height: u64) -> Result<(), FollowerError> {
        if let Some(current) = &state.current {
            if let Some(floor) = state.floor
                && height < floor
            {
                return Err(FollowerError::BelowFloor { height, floor });
            }
            if height <= current.height {
                return Err(FollowerError::AlreadyConsumed {
                    height,
                    current: current.height,
                });
            }
        }
        if state.data.contains_key(&height) {
            return Err(FollowerError::DuplicateHeight { height });
        }
        Ok(())
    }

    /// Returns the next trie update in chronological order.
    ///
    /// Moves on to the next height once every update of the current block has
    /// been returned. Fails with [`FollowerError::Unavailable`] when no further
    /// block is buffered yet.
    pub fn update(&self) -> Result<TrieUpdate, FollowerError> {
        let mut state = self.state.lock();

        if state.current.as_ref().is_none_or(Current::exhausted)
            && let Err(err) = self.advance(&mut state)
        {
            if err.is_fatal() {
                critical!(error = %err, "Execution follower cannot advance");
            }
            return Err(err);
        }

        let current = state.current.as_mut().ok_or(FollowerError::NoCurrentBlock)?;
        let update = current
            .data
            .trie_updates
            .get(current.index)
            .cloned()
            .ok_or(FollowerError::Unavailable)?;
        current.index += 1;
        Ok(update)
    }

    fn advance(&self, state: &mut State) -> Result<(), FollowerError> {
        let height = match &state.current {
            Some(current) => current.height + 1,
            None => state.floor.ok_or(FollowerError::Unavailable)?,
        };

        let buffered = state.ahead();
        if buffered == 0 {
            return Err(FollowerError::Unavailable);
        }
        let next = state
            .data
            .get(&height)
            .cloned()
            .ok_or(FollowerError::MissingHeight { height, buffered })?;

        Self::cross_check(&state.data, &next)?;

        if let Some(previous) = state.current.take() {
            state.data.remove(&previous.height);
            state.heights.remove(&previous.data.block_id());
            self.space.notify_one();
        }
        state.current = Some(Current {
            height,
            data: next,
            index: 0,
        });
        metrics::set_cache_size(state.data.len());
        debug!(height, buffered, "Execution follower advanced");
        Ok(())
    }

    /// Every buffered seal for the block must agree with the final state of
    /// the execution result carried next to it.
    fn cross_check(
        data: &BTreeMap<u64, Arc<BlockData>>,
        candidate: &BlockData,
    ) -> Result<(), FollowerError> {
        let block_id = candidate.block_id();
        for buffered in data.values() {
            let payload = &buffered.block.payload;
            let Some(seal) = payload.seals.iter().find(|seal| seal.block_id == block_id) else {
                continue;
            };
            let Some(result) = payload
                .results
                .iter()
                .find(|result| result.block_id == block_id)
            else {
                continue;
            };

            let computed = result
                .final_state_commitment()
                .map_err(FollowerError::Result)?;
            if computed != seal.final_state {
                return Err(FollowerError::SealMismatch {
                    block_id,
                    sealed: seal.final_state,
                    computed,
                });
            }
        }
        Ok(())
    }

    fn with_current<T>(
        &self,
        height: u64,
        read: impl FnOnce(&BlockData) -> T,
    ) -> Result<T, FollowerError> {
        let state = self.state.lock();
        let current = state.current.as_ref().ok_or(FollowerError::NoCurrentBlock)?;
        if current.height != height {
            return Err(FollowerError::WrongHeight {
                current: current.height,
                requested: height,
            });
        }
        Ok(read(&current.data))
    }

    pub fn header(&self, height: u64) -> Result<Header, FollowerError> {
        self.with_current(height, |data| data.block.header.clone())
    }

    pub fn commit(&self, height: u64) -> Result<StateCommitment, FollowerError> {
        self.with_current(height, |data| data.commit)
    }

    pub fn collections(&self, height: u64) -> Result<Vec<LightCollection>, FollowerError> {
        self.with_current(height, |data| {
            data.collections
                .iter()
                .map(CompleteCollection::light)
                .collect()
        })
    }

    pub fn guarantees(&self, height: u64) -> Result<Vec<CollectionGuarantee>, FollowerError> {
        self.with_current(height, |data| data.block.payload.guarantees.clone())
    }

    pub fn seals(&self, height: u64) -> Result<Vec<Seal>, FollowerError> {
        self.with_current(height, |data| data.block.payload.seals.clone())
    }

    pub fn transactions(&self, height: u64) -> Result<Vec<TransactionBody>, FollowerError> {
        self.with_current(height, |data| {
            data.collections
                .iter()
                .flat_map(|collection| collection.transactions.iter().cloned())
                .collect()
        })
    }

    pub fn results(&self, height: u64) -> Result<Vec<TransactionResult>, FollowerError> {
        self.with_current(height, |data| data.tx_results.clone())
    }

    pub fn events(&self, height: u64) -> Result<Vec<Event>, FollowerError> {
        self.with_current(height, |data| data.events.clone())
    }

    /// Height of the current block, if any.
    pub fn height(&self) -> Option<u64> {
        self.state.lock().current.as_ref().map(|current| current.height)
    }

    /// Whether every trie update of the current block has been returned.
    pub fn exhausted(&self) -> bool {
        self.state
            .lock()
            .current
            .as_ref()
            .is_none_or(Current::exhausted)
    }

    /// Number of buffered blocks, including the current one.
    pub fn buffered(&self) -> usize {
        self.state.lock().data.len()
    }

    fn is_full(&self) -> bool {
        self.buffered() >= self.capacity
    }

    /// Stops the ingest loop. Already buffered blocks can still be consumed.
    pub fn stop(&self) {
        self.stop.cancel();
    }
}

impl<S: BlockSource, C: Codec> ExecutionData for ExecutionFollower<S, C> {
    fn block_data(&self, block_id: &Identifier) -> Option<Arc<BlockData>> {
        let state = self.state.lock();
        let height = state.heights.get(block_id)?;
        state.data.get(height).cloned()
    }
}
