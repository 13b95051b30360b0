//! Drives block data from the followers into the index.
//!
//! The indexer consumes trie updates from the execution follower in height
//! order. When a new height becomes current it waits for the consensus
//! follower to know that height, writes the block's records, and collects the
//! register writes of the block. Once the block is exhausted the registers and
//! the `last` marker are written. Writer calls run on the blocking pool since
//! staging may wait for a commit slot.

use crate::{
    critical,
    follower::{
        BlockMetadata,
        ConsensusFollower,
        ExecutionFollower,
        FollowerError,
    },
    index::{
        IndexError,
        Writer,
    },
    metrics,
    source::BlockSource,
};

use archive_core::{
    BincodeCodec,
    Codec,
    CollectionGuarantee,
    Event,
    Header,
    Identifier,
    LightCollection,
    Path,
    Payload,
    Seal,
    StateCommitment,
    TransactionBody,
    TransactionResult,
};

use std::{
    collections::BTreeMap,
    sync::Arc,
    time::Duration,
};
use tokio_util::sync::CancellationToken;
use tracing::{
    debug,
    info,
};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexerConfig {
    /// Delay before retrying when a follower has nothing new.
    pub poll_interval: Duration,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

impl IndexerConfig {
    #[must_use]
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum IndexerError {
    #[error("Follower error")]
    Follower(#[from] FollowerError),
    #[error("Index error")]
    Index(#[from] IndexError),
    #[error("Block height {height} does not follow indexed height {previous}")]
    Discontinuity { height: u64, previous: u64 },
    #[error(
        "Finalized block {finalized} at height {height} differs from executed block {executed}"
    )]
    ForkedBlock {
        height: u64,
        finalized: Identifier,
        executed: Identifier,
    },
}

type Consensus<S, M, C> = ConsensusFollower<M, Arc<ExecutionFollower<S, C>>>;

/// Records of one block, gathered before they are handed to the writer.
struct BlockRecords {
    header: Header,
    commit: StateCommitment,
    collections: Vec<LightCollection>,
    guarantees: Vec<CollectionGuarantee>,
    transactions: Vec<TransactionBody>,
    results: Vec<TransactionResult>,
    events: Vec<Event>,
    seals: Vec<Seal>,
}

impl BlockRecords {
    fn write<C: Codec>(
        &self,
        writer: &Writer<C>,
        height: u64,
        first: bool,
    ) -> Result<(), IndexError> {
        writer.header(height, &self.header)?;
        writer.height(&self.header.id(), height)?;
        writer.commit(height, &self.commit)?;
        writer.collections(height, &self.collections)?;
        writer.guarantees(&self.guarantees)?;
        writer.transactions(height, &self.transactions)?;
        writer.results(&self.results)?;
        writer.events(height, &self.events)?;
        writer.seals(height, &self.seals)?;
        if first {
            writer.first(height)?;
        }
        Ok(())
    }
}

pub struct Indexer<S, M, C = BincodeCodec> {
    execution: Arc<ExecutionFollower<S, C>>,
    consensus: Arc<Consensus<S, M, C>>,
    writer: Arc<Writer<C>>,
    config: IndexerConfig,
    cancel: CancellationToken,
}

impl<S, M, C> Indexer<S, M, C>
where
    S: BlockSource,
    M: BlockMetadata,
    C: Codec,
{
    pub fn new(
        execution: Arc<ExecutionFollower<S, C>>,
        consensus: Arc<Consensus<S, M, C>>,
        writer: Writer<C>,
        config: IndexerConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            execution,
            consensus,
            writer: Arc::new(writer),
            config,
            cancel,
        }
    }

    /// Indexes blocks until cancelled or a follower or write failure occurs.
    ///
    /// The writer is closed before returning, also on failure.
    pub async fn run(&self) -> Result<(), IndexerError> {
        let previous = self.writer.last_indexed();
        info!(?previous, "Starting indexer");

        let result = self.index(previous).await;
        if let Err(err) = &result {
            critical!(error = %err, "Indexer stopped");
        }
        let closed = self.write(|writer| writer.close()).await;
        result?;
        closed?;
        Ok(())
    }

    async fn index(&self, mut previous: Option<u64>) -> Result<(), IndexerError> {
        let mut current: Option<u64> = None;
        let mut registers: BTreeMap<Path, Payload> = BTreeMap::new();

        loop {
            let update = match self.execution.update() {
                Ok(update) => update,
                Err(err) if err.is_unavailable() => {
                    if !self.pause().await {
                        return Ok(());
                    }
                    continue;
                }
                Err(err) => return Err(err.into()),
            };
            let height = self.execution.height().ok_or(FollowerError::NoCurrentBlock)?;

            if current != Some(height) {
                if let Some(previous) = previous
                    && height != previous + 1
                {
                    return Err(IndexerError::Discontinuity { height, previous });
                }
                if !self.await_finalized(height).await {
                    return Ok(());
                }
                self.index_block(height, previous.is_none()).await?;
                current = Some(height);
                registers.clear();
            }

            // Later writes to a path within the block replace earlier ones.
            for (path, payload) in update.paths.into_iter().zip(update.payloads) {
                registers.insert(path, payload);
            }

            if self.execution.exhausted() {
                let (paths, payloads): (Vec<Path>, Vec<Payload>) =
                    std::mem::take(&mut registers).into_iter().unzip();
                let count = paths.len();
                self.write(move |writer| {
                    writer.payloads(height, &paths, &payloads)?;
                    writer.last(height)
                })
                .await?;
                self.consensus.prune(height);
                metrics::set_indexed_height(height);
                info!(height, registers = count, "Indexed block");
                previous = Some(height);
            }
        }
    }

    /// Waits until the consensus follower holds `height`. Returns `false`
    /// when cancelled first.
    async fn await_finalized(&self, height: u64) -> bool {
        while !self.consensus.contains(height) {
            debug!(height, "Waiting for finalized block metadata");
            if !self.pause().await {
                return false;
            }
        }
        true
    }

    async fn index_block(&self, height: u64, first: bool) -> Result<(), IndexerError> {
        let header = self.consensus.header(height)?;
        let block_id = header.id();
        let executed = self.execution.header(height)?.id();
        if block_id != executed {
            return Err(IndexerError::ForkedBlock {
                height,
                finalized: block_id,
                executed,
            });
        }

        let records = BlockRecords {
            header,
            commit: self.consensus.commit(height)?,
            collections: self.consensus.collections(height)?,
            guarantees: self.consensus.guarantees(height)?,
            transactions: self.consensus.transactions(height)?,
            results: self.consensus.results(height)?,
            events: self.consensus.events(height)?,
            seals: self.consensus.seals(height)?,
        };
        self.write(move |writer| records.write(writer, height, first))
            .await?;

        debug!(height, %block_id, "Wrote block records");
        Ok(())
    }

    /// Runs `write` against the writer on the blocking pool.
    async fn write<T: Send + 'static>(
        &self,
        write: impl FnOnce(&Writer<C>) -> Result<T, IndexError> + Send + 'static,
    ) -> Result<T, IndexError> {
        let writer = Arc::clone(&self.writer);
        tokio::task::spawn_blocking(move || write(&writer))
            .await
            .map_err(IndexError::Join)?
    }

    /// Sleeps for the poll interval. Returns `false` when cancelled first.
    async fn pause(&self) -> bool {
        tokio::select! {
            () = self.cancel.cancelled() => {
                info!("Shutdown signal received, stopping indexer");
                false
            }
            () = tokio::time::sleep(self.config.poll_interval) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        follower::{
            FollowerConfig,
            SledBlockMetadata,
        },
        index::{
            Reader,
            WriterConfig,
        },
        source::MemorySource,
    };
    use archive_core::{
        BlockData,
        Bytes,
        test_utils::{
            generic_chain,
            generic_identifier,
            generic_paths,
        },
    };

    type TestIndexer = Indexer<MemorySource, SledBlockMetadata>;

    struct Harness {
        execution: Arc<ExecutionFollower<MemorySource>>,
        consensus: Arc<ConsensusFollower<SledBlockMetadata, Arc<ExecutionFollower<MemorySource>>>>,
        metadata: SledBlockMetadata,
        db: sled::Db,
        cancel: CancellationToken,
    }

    impl Harness {
        fn new() -> Self {
            let execution = Arc::new(ExecutionFollower::new(
                MemorySource::default(),
                BincodeCodec,
                FollowerConfig::default(),
            ));
            let metadata =
                SledBlockMetadata::new(sled::Config::tmp().unwrap().open().unwrap(), BincodeCodec);
            let consensus = Arc::new(ConsensusFollower::new(
                metadata.clone(),
                Arc::clone(&execution),
            ));
            Self {
                execution,
                consensus,
                metadata,
                db: sled::Config::tmp().unwrap().open().unwrap(),
                cancel: CancellationToken::new(),
            }
        }

        fn execute(&self, data: &BlockData) {
            self.execution.insert(data.clone()).unwrap();
        }

        fn finalize(&self, data: &BlockData) {
            self.metadata.insert_block(&data.block).unwrap();
            self.metadata
                .finalize(data.height(), &data.block_id())
                .unwrap();
            self.consensus.on_block_finalized(data.block_id());
        }

        fn indexer(&self) -> Arc<TestIndexer> {
            let writer = Writer::new(
                self.db.clone(),
                BincodeCodec,
                WriterConfig::default().with_batch_size(1),
            )
            .unwrap();
            Arc::new(Indexer::new(
                Arc::clone(&self.execution),
                Arc::clone(&self.consensus),
                writer,
                IndexerConfig::default().with_poll_interval(Duration::from_millis(5)),
                self.cancel.clone(),
            ))
        }

        fn reader(&self) -> Reader {
            Reader::new(self.db.clone(), BincodeCodec)
        }

        async fn wait_for_last(&self, height: u64) {
            let reader = self.reader();
            tokio::time::timeout(Duration::from_secs(5), async {
                while reader.last().ok() != Some(height) {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            })
            .await
            .unwrap();
        }
    }

    fn spawn(indexer: Arc<TestIndexer>) -> tokio::task::JoinHandle<Result<(), IndexerError>> {
        tokio::spawn(async move { indexer.run().await })
    }

    #[tokio::test]
    async fn test_indexes_finalized_chain() {
        let harness = Harness::new();
        let chain = generic_chain(10, 3);
        for data in &chain {
            harness.execute(data);
            harness.finalize(data);
        }

        let handle = spawn(harness.indexer());
        harness.wait_for_last(12).await;
        harness.cancel.cancel();
        handle.await.unwrap().unwrap();

        let reader = harness.reader();
        assert_eq!(reader.first().unwrap(), 10);
        assert_eq!(reader.last().unwrap(), 12);
        assert_eq!(reader.latest_register_height().unwrap(), 12);
        for data in &chain {
            let height = data.height();
            assert_eq!(reader.header(height).unwrap(), data.block.header);
            assert_eq!(reader.commit(height).unwrap(), data.commit);
            assert_eq!(reader.height_for_block(&data.block_id()).unwrap(), height);
            assert_eq!(reader.events(height, &[]).unwrap(), data.events);
            assert_eq!(
                reader.transactions_by_height(height).unwrap().len(),
                data.tx_results.len()
            );
            assert_eq!(
                reader.seals_by_height(height).unwrap().len(),
                data.block.payload.seals.len()
            );
        }
        assert_eq!(
            reader.values(11, &generic_paths(1)).await.unwrap(),
            vec![Bytes::from_static(b"value 11/0")]
        );
        assert!(!harness.consensus.contains(11));
        assert!(harness.consensus.contains(12));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_runtime_stays_responsive_while_writing() {
        let harness = Harness::new();
        let chain = generic_chain(1, 20);
        for data in &chain {
            harness.execute(data);
            harness.finalize(data);
        }
        let ticks = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let heartbeat = {
            let (ticks, cancel) = (Arc::clone(&ticks), harness.cancel.clone());
            tokio::spawn(async move {
                while !cancel.is_cancelled() {
                    ticks.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    tokio::task::yield_now().await;
                }
            })
        };

        let handle = spawn(harness.indexer());
        harness.wait_for_last(20).await;
        harness.cancel.cancel();
        handle.await.unwrap().unwrap();
        heartbeat.await.unwrap();

        assert!(ticks.load(std::sync::atomic::Ordering::Relaxed) > 20);
        assert_eq!(harness.reader().first().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_waits_for_finalization() {
        let harness = Harness::new();
        let chain = generic_chain(10, 2);
        for data in &chain {
            harness.execute(data);
        }
        harness.finalize(&chain[0]);

        let handle = spawn(harness.indexer());
        harness.wait_for_last(10).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(harness.reader().last().unwrap(), 10);

        harness.finalize(&chain[1]);
        harness.wait_for_last(11).await;
        harness.cancel.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_cancel_without_data() {
        let harness = Harness::new();
        let handle = spawn(harness.indexer());

        tokio::time::sleep(Duration::from_millis(20)).await;
        harness.cancel.cancel();

        handle.await.unwrap().unwrap();
        assert!(harness.reader().last().unwrap_err().is_unavailable());
    }

    #[tokio::test]
    async fn test_resumes_after_last_indexed_height() {
        let harness = Harness::new();
        let chain = generic_chain(10, 3);
        harness.execute(&chain[0]);
        harness.finalize(&chain[0]);
        let handle = spawn(harness.indexer());
        harness.wait_for_last(10).await;
        harness.cancel.cancel();
        handle.await.unwrap().unwrap();

        // A fresh pipeline over the same index picks up at the next height.
        let resumed = Harness {
            db: harness.db.clone(),
            ..Harness::new()
        };
        for data in &chain[1..] {
            resumed.execute(data);
            resumed.finalize(data);
        }
        let handle = spawn(resumed.indexer());
        resumed.wait_for_last(12).await;
        resumed.cancel.cancel();
        handle.await.unwrap().unwrap();

        assert_eq!(resumed.reader().first().unwrap(), 10);
        assert_eq!(resumed.reader().last().unwrap(), 12);
    }

    #[tokio::test]
    async fn test_rejects_gap_after_last_indexed_height() {
        let harness = Harness::new();
        let writer = Writer::new(harness.db.clone(), BincodeCodec, WriterConfig::default()).unwrap();
        writer.first(10).unwrap();
        writer.last(12).unwrap();
        writer.close().unwrap();

        let data = &generic_chain(14, 1)[0];
        harness.execute(data);
        harness.finalize(data);

        let err = harness.indexer().run().await.unwrap_err();

        assert!(matches!(
            err,
            IndexerError::Discontinuity {
                height: 14,
                previous: 12
            }
        ));
    }

    #[tokio::test]
    async fn test_rejects_finalized_block_that_was_not_executed() {
        let harness = Harness::new();
        let executed = &generic_chain(10, 1)[0];
        let mut finalized = executed.clone();
        finalized.block.header.parent_id = generic_identifier(999);
        harness.execute(executed);
        harness.finalize(&finalized);

        let err = harness.indexer().run().await.unwrap_err();

        assert!(matches!(
            err,
            IndexerError::ForkedBlock { height: 10, .. }
        ));
    }

    #[tokio::test]
    async fn test_fatal_follower_error_stops_and_closes_writer() {
        let harness = Harness::new();
        let chain = generic_chain(10, 3);
        harness.execute(&chain[0]);
        harness.execute(&chain[2]);
        harness.finalize(&chain[0]);

        let err = harness.indexer().run().await.unwrap_err();

        assert!(matches!(
            err,
            IndexerError::Follower(FollowerError::MissingHeight { height: 11, .. })
        ));
        assert_eq!(harness.reader().last().unwrap(), 10);
    }
}
