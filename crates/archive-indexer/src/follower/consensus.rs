//! Finalized block metadata keyed by height.
//!
//! The consensus follower loads header, guarantees and seals of every finalized
//! block it is told about, and resolves the execution side of a height through
//! an [`ExecutionData`] provider keyed by block identifier. It holds at most
//! `capacity` items; notifications wait until the indexer prunes a height.

use crate::{
    follower::{
        BlockMetadata,
        ExecutionData,
        FollowerError,
        MetadataError,
    },
    metrics,
};

use archive_core::{
    BlockData,
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
};

use parking_lot::RwLock;
use std::{
    collections::BTreeMap,
    sync::Arc,
    time::Duration,
};
use tokio::sync::{
    Notify,
    mpsc,
};
use tokio_util::sync::CancellationToken;
use tracing::{
    debug,
    info,
    warn,
};

/// Finalized blocks held ahead of the indexer by default.
pub const DEFAULT_ITEM_CAPACITY: usize = 1024;

/// Consensus metadata of one finalized block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsensusItem {
    pub header: Header,
    pub guarantees: Vec<CollectionGuarantee>,
    pub seals: Vec<Seal>,
}

pub struct ConsensusFollower<M, E> {
    metadata: M,
    execution: E,
    capacity: usize,
    items: RwLock<BTreeMap<u64, ConsensusItem>>,
    space: Notify,
}

impl<M: BlockMetadata, E: ExecutionData> ConsensusFollower<M, E> {
    pub fn new(metadata: M, execution: E) -> Self {
        Self {
            metadata,
            execution,
            capacity: DEFAULT_ITEM_CAPACITY,
            items: RwLock::new(BTreeMap::new()),
            space: Notify::new(),
        }
    }

    /// Limits the items [`run`](Self::run) loads ahead of the indexer.
    ///
    /// The item of the height being indexed is kept until the next height
    /// completes, so at least two are held.
    #[must_use]
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(2);
        self
    }

    /// Loads the metadata of a newly finalized block.
    ///
    /// All records are read through [`BlockMetadata::block_records`]. Nothing
    /// is recorded when any of them is missing; the height then stays
    /// unavailable.
    pub fn on_block_finalized(&self, block_id: Identifier) {
        match self.metadata.block_records(&block_id) {
            Ok(item) => {
                let height = item.header.height;
                debug!(height, %block_id, "Loaded finalized block");
                self.items.write().insert(height, item);
            }
            Err(err) => {
                warn!(error = %err, %block_id, "Failed to load finalized block metadata");
                metrics::record_finalization_failure();
            }
        }
    }

    /// Handles finalization notifications until the channel closes or `cancel` fires.
    ///
    /// Stops receiving while `capacity` items are held, which in turn holds
    /// back the sender.
    pub async fn run(&self, mut finalized: mpsc::Receiver<Identifier>, cancel: CancellationToken) {
        info!(capacity = self.capacity, "Starting consensus follower");
        loop {
            if self.items.read().len() >= self.capacity {
                debug!(capacity = self.capacity, "Consensus items full, waiting for indexer");
                tokio::select! {
                    () = cancel.cancelled() => {
                        info!("Shutdown signal received, stopping consensus follower");
                        return;
                    }
                    () = self.space.notified() => {}
                }
                continue;
            }

            tokio::select! {
                () = cancel.cancelled() => {
                    info!("Shutdown signal received, stopping consensus follower");
                    return;
                }
                block_id = finalized.recv() => {
                    let Some(block_id) = block_id else {
                        info!("Finalization notifications closed, stopping consensus follower");
                        return;
                    };
                    self.on_block_finalized(block_id);
                }
            }
        }
    }

    fn item<T>(
        &self,
        height: u64,
        read: impl FnOnce(&ConsensusItem) -> T,
    ) -> Result<T, FollowerError> {
        self.items
            .read()
            .get(&height)
            .map(read)
            .ok_or(FollowerError::Unavailable)
    }

    pub fn header(&self, height: u64) -> Result<Header, FollowerError> {
        self.item(height, |item| item.header.clone())
    }

    pub fn guarantees(&self, height: u64) -> Result<Vec<CollectionGuarantee>, FollowerError> {
        self.item(height, |item| item.guarantees.clone())
    }

    pub fn seals(&self, height: u64) -> Result<Vec<Seal>, FollowerError> {
        self.item(height, |item| item.seals.clone())
    }

    fn block_data(&self, height: u64) -> Result<Arc<BlockData>, FollowerError> {
        let block_id = self.item(height, |item| item.header.id())?;
        self.execution
            .block_data(&block_id)
            .ok_or(FollowerError::Unavailable)
    }

    pub fn commit(&self, height: u64) -> Result<StateCommitment, FollowerError> {
        Ok(self.block_data(height)?.commit)
    }

    pub fn collections(&self, height: u64) -> Result<Vec<LightCollection>, FollowerError> {
        Ok(self
            .block_data(height)?
            .collections
            .iter()
            .map(CompleteCollection::light)
            .collect())
    }

    pub fn transactions(&self, height: u64) -> Result<Vec<TransactionBody>, FollowerError> {
        Ok(self
            .block_data(height)?
            .collections
            .iter()
            .flat_map(|collection| collection.transactions.iter().cloned())
            .collect())
    }

    pub fn results(&self, height: u64) -> Result<Vec<TransactionResult>, FollowerError> {
        Ok(self.block_data(height)?.tx_results.clone())
    }

    pub fn events(&self, height: u64) -> Result<Vec<Event>, FollowerError> {
        Ok(self.block_data(height)?.events.clone())
    }

    pub fn contains(&self, height: u64) -> bool {
        self.items.read().contains_key(&height)
    }

    /// Drops the items of every height below `below`.
    pub fn prune(&self, below: u64) {
        let mut items = self.items.write();
        let kept = items.split_off(&below);
        let pruned = std::mem::replace(&mut *items, kept);
        if !pruned.is_empty() {
            self.space.notify_one();
        }
    }
}

/// Emits the identifier of every block finalized at or above `start`.
///
/// Polls the finalized height of `metadata` every `interval`. Returns when
/// `cancel` fires or the receiving side is dropped.
pub async fn poll_finalized<M: BlockMetadata>(
    metadata: &M,
    notify: mpsc::Sender<Identifier>,
    start: u64,
    interval: Duration,
    cancel: CancellationToken,
) -> Result<(), MetadataError> {
    let mut next = start;

    loop {
        if let Some(finalized) = metadata.finalized_height()? {
            while next <= finalized {
                match metadata.finalized_block(next)? {
                    Some(block_id) => {
                        if notify.send(block_id).await.is_err() {
                            info!("Finalization receiver dropped, stopping poller");
                            return Ok(());
                        }
                    }
                    None => debug!(height = next, "No finalized block recorded at height"),
                }
                next += 1;
            }
        }

        tokio::select! {
            () = cancel.cancelled() => {
                info!("Shutdown signal received, stopping finalization poller");
                return Ok(());
            }
            () = tokio::time::sleep(interval) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::follower::SledBlockMetadata;
    use archive_core::{
        BincodeCodec,
        Block,
        test_utils::generic_chain,
    };
    use std::collections::HashMap;

    #[derive(Default)]
    struct MemoryMetadata {
        blocks: HashMap<Identifier, Block>,
        missing_guarantees: bool,
    }

    impl MemoryMetadata {
        fn with_blocks(chain: &[BlockData]) -> Self {
            Self {
                blocks: chain
                    .iter()
                    .map(|data| (data.block_id(), data.block.clone()))
                    .collect(),
                missing_guarantees: false,
            }
        }

        fn block(&self, block_id: &Identifier) -> Result<&Block, MetadataError> {
            self.blocks
                .get(block_id)
                .ok_or(MetadataError::HeaderNotFound(*block_id))
        }
    }

    impl BlockMetadata for MemoryMetadata {
        fn header(&self, block_id: &Identifier) -> Result<Header, MetadataError> {
            Ok(self.block(block_id)?.header.clone())
        }

        fn guarantee_ids(&self, block_id: &Identifier) -> Result<Vec<Identifier>, MetadataError> {
            Ok(self
                .block(block_id)?
                .payload
                .guarantees
                .iter()
                .map(CollectionGuarantee::id)
                .collect())
        }

        fn seal_ids(&self, block_id: &Identifier) -> Result<Vec<Identifier>, MetadataError> {
            Ok(self
                .block(block_id)?
                .payload
                .seals
                .iter()
                .map(Seal::id)
                .collect())
        }

        fn guarantee(&self, guarantee_id: &Identifier) -> Result<CollectionGuarantee, MetadataError> {
            self.blocks
                .values()
                .flat_map(|block| &block.payload.guarantees)
                .find(|guarantee| guarantee.id() == *guarantee_id && !self.missing_guarantees)
                .cloned()
                .ok_or(MetadataError::GuaranteeNotFound(*guarantee_id))
        }

        fn seal(&self, seal_id: &Identifier) -> Result<Seal, MetadataError> {
            self.blocks
                .values()
                .flat_map(|block| &block.payload.seals)
                .find(|seal| seal.id() == *seal_id)
                .cloned()
                .ok_or(MetadataError::SealNotFound(*seal_id))
        }

        fn finalized_height(&self) -> Result<Option<u64>, MetadataError> {
            Ok(self.blocks.values().map(|block| block.header.height).max())
        }

        fn finalized_block(&self, height: u64) -> Result<Option<Identifier>, MetadataError> {
            Ok(self
                .blocks
                .values()
                .find(|block| block.header.height == height)
                .map(Block::id))
        }
    }

    #[derive(Default)]
    struct MemoryExecution(HashMap<Identifier, Arc<BlockData>>);

    impl MemoryExecution {
        fn with_blocks(chain: &[BlockData]) -> Self {
            Self(
                chain
                    .iter()
                    .map(|data| (data.block_id(), Arc::new(data.clone())))
                    .collect(),
            )
        }
    }

    impl ExecutionData for MemoryExecution {
        fn block_data(&self, block_id: &Identifier) -> Option<Arc<BlockData>> {
            self.0.get(block_id).cloned()
        }
    }

    #[test]
    fn test_finalized_block_is_served_by_height() {
        let chain = generic_chain(10, 2);
        let follower = ConsensusFollower::new(
            MemoryMetadata::with_blocks(&chain),
            MemoryExecution::with_blocks(&chain),
        );
        let data = &chain[1];

        follower.on_block_finalized(data.block_id());

        assert_eq!(follower.header(11).unwrap(), data.block.header);
        assert_eq!(follower.guarantees(11).unwrap(), data.block.payload.guarantees);
        assert_eq!(follower.seals(11).unwrap(), data.block.payload.seals);
        assert_eq!(follower.commit(11).unwrap(), data.commit);
        assert_eq!(follower.collections(11).unwrap().len(), 2);
        assert_eq!(follower.transactions(11).unwrap().len(), 4);
        assert_eq!(follower.results(11).unwrap(), data.tx_results);
        assert_eq!(follower.events(11).unwrap(), data.events);
        assert!(follower.header(10).unwrap_err().is_unavailable());
    }

    #[test]
    fn test_failed_guarantee_lookup_records_nothing() {
        let chain = generic_chain(10, 2);
        let metadata = MemoryMetadata {
            missing_guarantees: true,
            ..MemoryMetadata::with_blocks(&chain)
        };
        let follower = ConsensusFollower::new(metadata, MemoryExecution::with_blocks(&chain));

        follower.on_block_finalized(chain[1].block_id());

        assert!(!follower.contains(11));
        assert!(follower.header(11).unwrap_err().is_unavailable());
    }

    #[test]
    fn test_unknown_block_records_nothing() {
        let follower = ConsensusFollower::new(MemoryMetadata::default(), MemoryExecution::default());

        follower.on_block_finalized(Identifier::repeat_byte(1));

        assert!(follower.items.read().is_empty());
    }

    #[test]
    fn test_missing_execution_data_is_unavailable() {
        let chain = generic_chain(10, 2);
        let follower = ConsensusFollower::new(
            MemoryMetadata::with_blocks(&chain),
            MemoryExecution::default(),
        );

        follower.on_block_finalized(chain[0].block_id());

        assert!(follower.header(10).is_ok());
        assert!(follower.commit(10).unwrap_err().is_unavailable());
        assert!(follower.events(10).unwrap_err().is_unavailable());
    }

    #[test]
    fn test_prune_drops_lower_heights() {
        let chain = generic_chain(10, 3);
        let follower = ConsensusFollower::new(
            MemoryMetadata::with_blocks(&chain),
            MemoryExecution::default(),
        );
        for data in &chain {
            follower.on_block_finalized(data.block_id());
        }

        follower.prune(11);

        assert!(!follower.contains(10));
        assert!(follower.contains(11));
        assert!(follower.contains(12));
    }

    #[tokio::test]
    async fn test_run_handles_notifications_until_closed() {
        let chain = generic_chain(10, 2);
        let follower = ConsensusFollower::new(
            MemoryMetadata::with_blocks(&chain),
            MemoryExecution::default(),
        );
        let (tx, rx) = mpsc::channel(4);
        for data in &chain {
            tx.send(data.block_id()).await.unwrap();
        }
        drop(tx);

        follower.run(rx, CancellationToken::new()).await;

        assert!(follower.contains(10));
        assert!(follower.contains(11));
    }

    #[tokio::test]
    async fn test_run_waits_for_prune_when_full() {
        let chain = generic_chain(10, 3);
        let follower = Arc::new(
            ConsensusFollower::new(
                MemoryMetadata::with_blocks(&chain),
                MemoryExecution::default(),
            )
            .with_capacity(2),
        );
        let (tx, rx) = mpsc::channel(4);
        for data in &chain {
            tx.send(data.block_id()).await.unwrap();
        }
        let cancel = CancellationToken::new();
        let run = {
            let (follower, cancel) = (Arc::clone(&follower), cancel.clone());
            tokio::spawn(async move { follower.run(rx, cancel).await })
        };

        tokio::time::timeout(Duration::from_secs(5), async {
            while !follower.contains(11) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(follower.contains(10));
        assert!(!follower.contains(12));

        follower.prune(11);
        tokio::time::timeout(Duration::from_secs(5), async {
            while !follower.contains(12) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(follower.items.read().len(), 2);

        cancel.cancel();
        run.await.unwrap();
    }

    #[test]
    fn test_capacity_keeps_at_least_two_items() {
        let follower =
            ConsensusFollower::new(MemoryMetadata::default(), MemoryExecution::default())
                .with_capacity(1);

        assert_eq!(follower.capacity, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_run_on_sled_metadata_in_spawned_task() {
        let db = sled::Config::tmp().unwrap().open().unwrap();
        let metadata = SledBlockMetadata::new(db, BincodeCodec);
        let chain = generic_chain(10, 2);
        for data in &chain {
            metadata.insert_block(&data.block).unwrap();
        }
        let follower = Arc::new(ConsensusFollower::new(
            metadata,
            MemoryExecution::with_blocks(&chain),
        ));
        let (tx, rx) = mpsc::channel(4);

        let run = {
            let follower = Arc::clone(&follower);
            tokio::spawn(async move { follower.run(rx, CancellationToken::new()).await })
        };
        for data in &chain {
            tx.send(data.block_id()).await.unwrap();
        }
        drop(tx);
        run.await.unwrap();

        assert_eq!(follower.header(11).unwrap(), chain[1].block.header);
        assert_eq!(follower.commit(10).unwrap(), chain[0].commit);
    }

    #[tokio::test]
    async fn test_poll_finalized_emits_each_block_once() {
        let db = sled::Config::tmp().unwrap().open().unwrap();
        let metadata = SledBlockMetadata::new(db, BincodeCodec);
        let chain = generic_chain(10, 3);
        for data in &chain {
            metadata.insert_block(&data.block).unwrap();
        }
        metadata.finalize(10, &chain[0].block_id()).unwrap();
        metadata.finalize(11, &chain[1].block_id()).unwrap();

        let (tx, mut rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        let poller = {
            let metadata = metadata.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                poll_finalized(&metadata, tx, 10, Duration::from_millis(10), cancel).await
            })
        };

        assert_eq!(rx.recv().await.unwrap(), chain[0].block_id());
        assert_eq!(rx.recv().await.unwrap(), chain[1].block_id());

        metadata.finalize(12, &chain[2].block_id()).unwrap();
        assert_eq!(rx.recv().await.unwrap(), chain[2].block_id());

        cancel.cancel();
        poller.await.unwrap().unwrap();
        assert!(rx.try_recv().is_err());
    }
}
