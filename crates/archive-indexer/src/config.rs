use crate::{
    follower::{
        ConsensusFollower,
        ExecutionFollower,
        FollowerConfig,
        MIN_CACHE_SIZE,
        SledBlockMetadata,
    },
    index::{
        Writer,
        WriterConfig,
    },
    indexer::IndexerConfig,
    service::ArchiveService,
    source::DirectorySource,
};

use archive_core::BincodeCodec;

use anyhow::Context;
use clap::Parser;
use std::{
    path::{
        Path,
        PathBuf,
    },
    sync::Arc,
    time::Duration,
};
use tracing::level_filters::LevelFilter;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// Path of the index database, defaults to the platform data directory
    #[arg(long, env = "ARCHIVE_DB_PATH")]
    pub db_path: Option<PathBuf>,
    /// Directory the block data files are written to
    #[arg(long, env = "ARCHIVE_DATA_DIR")]
    pub data_dir: PathBuf,
    /// Path of the consensus block metadata database
    #[arg(long, env = "ARCHIVE_METADATA_PATH")]
    pub metadata_path: PathBuf,
    /// Blocks buffered by the execution follower, at least 2
    #[arg(
        long,
        env = "ARCHIVE_CACHE_SIZE",
        default_value = "1024",
        value_parser = parse_cache_size
    )]
    pub cache_size: usize,
    /// Records per index write transaction
    #[arg(long, env = "ARCHIVE_WRITE_BATCH_SIZE", default_value = "1000")]
    pub write_batch_size: usize,
    /// Index write transactions committed in parallel
    #[arg(long, env = "ARCHIVE_WRITE_CONCURRENCY", default_value = "1")]
    pub write_concurrency: usize,
    /// Poll interval for new block files, finalized blocks and follower retries
    #[arg(long, env = "ARCHIVE_POLL_INTERVAL_MS", default_value = "100")]
    pub poll_interval_ms: u64,
    /// First height to index when the index is empty
    #[arg(long, env = "ARCHIVE_START_HEIGHT", default_value = "0")]
    pub start_height: u64,
    /// Database cache size in bytes
    #[arg(long, env = "ARCHIVE_DB_CACHE_SIZE", default_value = "1000000000")]
    pub db_cache_size: usize,
    /// Interval between background flushes of the index database
    #[arg(long, env = "ARCHIVE_FLUSH_EVERY_MS", default_value = "500")]
    pub flush_every_ms: usize,
    /// Log level
    #[arg(long, env = "ARCHIVE_LOG_LEVEL", default_value = "info")]
    pub log_level: LevelFilter,
}

fn parse_cache_size(value: &str) -> Result<usize, String> {
    let size: usize = value.parse().map_err(|err| format!("{err}"))?;
    if size < MIN_CACHE_SIZE {
        return Err(format!("must be at least {MIN_CACHE_SIZE}"));
    }
    Ok(size)
}

impl Config {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn follower_config(&self) -> FollowerConfig {
        FollowerConfig::default().with_cache_size(self.cache_size)
    }

    pub fn writer_config(&self) -> WriterConfig {
        WriterConfig::default()
            .with_batch_size(self.write_batch_size)
            .with_concurrent_transactions(self.write_concurrency)
    }

    pub fn indexer_config(&self) -> IndexerConfig {
        IndexerConfig::default().with_poll_interval(self.poll_interval())
    }

    /// First height to follow: the one after `last_indexed`, or the
    /// configured start height for an empty index.
    pub fn follow_from(&self, last_indexed: Option<u64>) -> Option<u64> {
        match last_indexed {
            Some(last) => Some((last + 1).max(self.start_height)),
            None => (self.start_height > 0).then_some(self.start_height),
        }
    }

    fn index_path(&self) -> anyhow::Result<PathBuf> {
        if let Some(db_path) = &self.db_path {
            return Ok(db_path.clone());
        }
        let root_dir = directories::ProjectDirs::from("com", "phylaxsystems", "block-archive")
            .context("No home directory to place the index database in")?;
        Ok(root_dir.data_dir().join("index"))
    }

    fn open_db(&self, path: &Path) -> anyhow::Result<sled::Db> {
        let db: sled::Db = sled::Config::new()
            .path(path)
            .cache_capacity_bytes(self.db_cache_size)
            .flush_every_ms(Some(self.flush_every_ms))
            .open()
            .with_context(|| format!("Failed to open database at {}", path.display()))?;

        let db_size = db.size_on_disk()?;
        tracing::info!(
            database_size_bytes = db_size,
            database_path = %path.display(),
            "Opened database"
        );
        Ok(db)
    }

    /// Opens the databases and wires the archive components together.
    pub fn build(self) -> anyhow::Result<ArchiveService> {
        let index = self.open_db(&self.index_path()?)?;
        let metadata = SledBlockMetadata::new(self.open_db(&self.metadata_path)?, BincodeCodec);
        let source = Arc::new(DirectorySource::new(&self.data_dir));
        tracing::info!(data_dir = %self.data_dir.display(), "Reading block data files");

        let writer = Writer::new(index, BincodeCodec, self.writer_config())?;
        let start = self.follow_from(writer.last_indexed());
        tracing::info!(last_indexed = ?writer.last_indexed(), ?start, "Opened index");

        let execution = Arc::new(ExecutionFollower::new(
            Arc::clone(&source),
            BincodeCodec,
            self.follower_config().with_start_height(start),
        ));
        let consensus = Arc::new(ConsensusFollower::new(
            metadata.clone(),
            Arc::clone(&execution),
        ));

        Ok(ArchiveService {
            source,
            metadata,
            execution,
            consensus,
            writer,
            indexer_config: self.indexer_config(),
            poll_interval: self.poll_interval(),
            start_height: start.unwrap_or(self.start_height),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const REQUIRED: [&str; 5] = [
        "program",
        "--data-dir",
        "/tmp/blocks",
        "--metadata-path",
        "/tmp/metadata",
    ];

    #[test]
    fn test_config_defaults() {
        let config = Config::try_parse_from(REQUIRED).unwrap();

        assert!(config.db_path.is_none());
        assert_eq!(config.data_dir, PathBuf::from("/tmp/blocks"));
        assert_eq!(config.metadata_path, PathBuf::from("/tmp/metadata"));
        assert_eq!(config.cache_size, 1024);
        assert_eq!(config.write_batch_size, 1000);
        assert_eq!(config.write_concurrency, 1);
        assert_eq!(config.poll_interval(), Duration::from_millis(100));
        assert_eq!(config.start_height, 0);
        assert_eq!(config.db_cache_size, 1_000_000_000);
        assert_eq!(config.flush_every_ms, 500);
        assert_eq!(config.log_level, LevelFilter::INFO);
        assert_eq!(config.writer_config(), WriterConfig::default());
        assert_eq!(config.follower_config(), FollowerConfig::default());
    }

    #[test]
    fn test_config_args() {
        let mut args = REQUIRED.to_vec();
        args.extend([
            "--db-path",
            "/tmp/index",
            "--cache-size",
            "16",
            "--write-batch-size",
            "50",
            "--write-concurrency",
            "4",
            "--poll-interval-ms",
            "20",
            "--start-height",
            "1000",
            "--log-level",
            "debug",
        ]);
        let config = Config::try_parse_from(args).unwrap();

        assert_eq!(config.db_path, Some(PathBuf::from("/tmp/index")));
        assert_eq!(config.follower_config().cache_size, 16);
        assert_eq!(config.writer_config().batch_size, 50);
        assert_eq!(config.writer_config().concurrent_transactions, 4);
        assert_eq!(
            config.indexer_config().poll_interval,
            Duration::from_millis(20)
        );
        assert_eq!(config.start_height, 1000);
        assert_eq!(config.log_level, LevelFilter::DEBUG);
    }

    #[test]
    fn test_config_rejects_cache_without_room_for_next_height() {
        let mut args = REQUIRED.to_vec();
        args.extend(["--cache-size", "1"]);
        assert!(Config::try_parse_from(args.clone()).is_err());

        args.pop();
        args.push("2");
        assert_eq!(Config::try_parse_from(args.clone()).unwrap().cache_size, 2);
    }

    #[test]
    fn test_follow_from_resumes_after_indexed_height() {
        let mut config = Config::try_parse_from(REQUIRED).unwrap();
        assert_eq!(config.follow_from(None), None);
        assert_eq!(config.follow_from(Some(3)), Some(4));

        config.start_height = 10;
        assert_eq!(config.follow_from(None), Some(10));
        assert_eq!(config.follow_from(Some(3)), Some(10));
        assert_eq!(config.follow_from(Some(12)), Some(13));
    }

    #[test]
    fn test_config_requires_data_dir() {
        assert!(Config::try_parse_from(["program", "--metadata-path", "/tmp/metadata"]).is_err());
    }

    #[test]
    fn test_build_opens_databases() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::try_parse_from([
            "program",
            "--data-dir",
            dir.path().join("blocks").to_str().unwrap(),
            "--metadata-path",
            dir.path().join("metadata").to_str().unwrap(),
            "--db-path",
            dir.path().join("index").to_str().unwrap(),
        ])
        .unwrap();

        let service = config.build().unwrap();

        assert_eq!(service.writer.last_indexed(), None);
    }
}
