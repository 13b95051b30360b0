//! Long-running archive process: the directory watch, both followers, the
//! finalization poller and the indexer, each on its own task.

use crate::{
    critical,
    follower::{
        ConsensusFollower,
        ExecutionFollower,
        SledBlockMetadata,
        poll_finalized,
    },
    index::Writer,
    indexer::{
        Indexer,
        IndexerConfig,
    },
    source::DirectorySource,
};

use std::{
    sync::Arc,
    time::Duration,
};
use tokio::{
    sync::mpsc,
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Capacity of the file and finalization notification channels.
const NOTIFICATION_BUFFER: usize = 1024;

type Source = Arc<DirectorySource>;

pub struct ArchiveService {
    pub(crate) source: Source,
    pub(crate) metadata: SledBlockMetadata,
    pub(crate) execution: Arc<ExecutionFollower<Source>>,
    pub(crate) consensus: Arc<ConsensusFollower<SledBlockMetadata, Arc<ExecutionFollower<Source>>>>,
    pub(crate) writer: Writer,
    pub(crate) indexer_config: IndexerConfig,
    pub(crate) poll_interval: Duration,
    /// First finalized height the poller reports.
    pub(crate) start_height: u64,
}

impl ArchiveService {
    /// Runs until `cancel` fires or one of the tasks fails.
    ///
    /// A failing task cancels the others. The index writer is closed before
    /// this returns.
    pub async fn run(self, cancel: CancellationToken) -> anyhow::Result<()> {
        let (files_tx, files_rx) = mpsc::channel(NOTIFICATION_BUFFER);
        let (finalized_tx, finalized_rx) = mpsc::channel(NOTIFICATION_BUFFER);

        let watch = {
            let source = Arc::clone(&self.source);
            let (interval, cancel) = (self.poll_interval, cancel.clone());
            supervise("directory watch", cancel.clone(), async move {
                source.watch(files_tx, interval, cancel).await
            })
        };
        let ingest = {
            let execution = Arc::clone(&self.execution);
            supervise("execution follower", cancel.clone(), async move {
                execution.run(files_rx).await
            })
        };
        let poller = {
            let metadata = self.metadata.clone();
            let (start, interval, cancel) = (self.start_height, self.poll_interval, cancel.clone());
            supervise("finalization poller", cancel.clone(), async move {
                poll_finalized(&metadata, finalized_tx, start, interval, cancel).await
            })
        };
        let consensus = {
            let consensus = Arc::clone(&self.consensus);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                consensus.run(finalized_rx, cancel).await;
                anyhow::Ok(())
            })
        };
        info!("Started archive tasks");

        let indexer = Indexer::new(
            Arc::clone(&self.execution),
            Arc::clone(&self.consensus),
            self.writer,
            self.indexer_config,
            cancel.clone(),
        );
        let mut result = indexer.run().await.map_err(anyhow::Error::from);

        cancel.cancel();
        self.execution.stop();
        for handle in [watch, ingest, poller, consensus] {
            let finished = handle.await.map_err(anyhow::Error::from).and_then(|task| task);
            result = result.and(finished);
        }
        info!(failed = result.is_err(), "Archive stopped");
        result
    }
}

/// Spawns `task` and cancels `cancel` when it fails.
fn supervise<E>(
    name: &'static str,
    cancel: CancellationToken,
    task: impl Future<Output = Result<(), E>> + Send + 'static,
) -> JoinHandle<anyhow::Result<()>>
where
    E: std::error::Error + Send + Sync + 'static,
{
    tokio::spawn(async move {
        let result = task.await;
        if let Err(err) = &result {
            critical!(error = %err, task = name, "Archive task failed");
            cancel.cancel();
        }
        result.map_err(|err| anyhow::Error::new(err).context(name))
    })
}
