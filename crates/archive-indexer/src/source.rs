//! Block data sources.
//!
//! A source exposes one file per block. Callers learn about new files through a
//! notification channel of file names and fetch their bytes with
//! [`BlockSource::read`].

use std::{
    collections::HashSet,
    io,
    path::{
        Path,
        PathBuf,
    },
    sync::Arc,
    time::Duration,
};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{
    debug,
    info,
};

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("Block file {name} not found")]
    NotFound { name: String },
    #[error("Failed to read block file {name}")]
    Read {
        name: String,
        #[source]
        source: io::Error,
    },
    #[error("Failed to list block directory {}", dir.display())]
    List {
        dir: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// On-demand access to block data files.
pub trait BlockSource: Send + Sync + 'static {
    fn read(&self, name: &str) -> Result<Vec<u8>, SourceError>;
}

impl<S: BlockSource> BlockSource for Arc<S> {
    fn read(&self, name: &str) -> Result<Vec<u8>, SourceError> {
        (**self).read(name)
    }
}

/// Block data files stored in a local directory.
#[derive(Debug, Clone)]
pub struct DirectorySource {
    dir: PathBuf,
}

impl DirectorySource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Names of the regular files currently in the directory, sorted.
    ///
    /// Hidden files are skipped so that writers can stage a file under a dot
    /// name and rename it once complete.
    pub async fn list(&self) -> Result<Vec<String>, SourceError> {
        let list_err = |source| {
            SourceError::List {
                dir: self.dir.clone(),
                source,
            }
        };

        let mut entries = tokio::fs::read_dir(&self.dir).await.map_err(list_err)?;
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(list_err)? {
            if !entry.file_type().await.map_err(list_err)?.is_file() {
                continue;
            }
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            if name.starts_with('.') {
                continue;
            }
            names.push(name);
        }
        names.sort_unstable();
        Ok(names)
    }

    /// Polls the directory and sends the name of every file not seen before.
    ///
    /// New files found in one poll are sent in lexicographic order. Returns
    /// when `cancel` fires or when the receiving side is dropped.
    pub async fn watch(
        &self,
        notify: mpsc::Sender<String>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> Result<(), SourceError> {
        let mut seen = HashSet::new();

        loop {
            for name in self.list().await? {
                if seen.contains(&name) {
                    continue;
                }
                debug!(file = %name, "Found new block data file");
                seen.insert(name.clone());
                if notify.send(name).await.is_err() {
                    info!("Block notification receiver dropped, stopping directory watch");
                    return Ok(());
                }
            }

            tokio::select! {
                () = cancel.cancelled() => {
                    info!("Shutdown signal received, stopping directory watch");
                    return Ok(());
                }
                () = tokio::time::sleep(interval) => {}
            }
        }
    }
}

impl BlockSource for DirectorySource {
    fn read(&self, name: &str) -> Result<Vec<u8>, SourceError> {
        std::fs::read(self.dir.join(name)).map_err(|source| {
            if source.kind() == io::ErrorKind::NotFound {
                SourceError::NotFound {
                    name: name.to_string(),
                }
            } else {
                SourceError::Read {
                    name: name.to_string(),
                    source,
                }
            }
        })
    }
}

/// Block files held in memory.
#[cfg(any(test, feature = "test"))]
#[derive(Debug, Default)]
pub struct MemorySource {
    files: parking_lot::RwLock<std::collections::HashMap<String, Vec<u8>>>,
}

#[cfg(any(test, feature = "test"))]
impl MemorySource {
    pub fn insert(&self, name: impl Into<String>, data: Vec<u8>) {
        self.files.write().insert(name.into(), data);
    }
}

#[cfg(any(test, feature = "test"))]
impl BlockSource for MemorySource {
    fn read(&self, name: &str) -> Result<Vec<u8>, SourceError> {
        self.files
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| {
                SourceError::NotFound {
                    name: name.to_string(),
                }
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_existing_and_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("0000000010.dat"), b"block").unwrap();
        let source = DirectorySource::new(dir.path());

        assert_eq!(source.read("0000000010.dat").unwrap(), b"block");
        assert!(matches!(
            source.read("0000000011.dat"),
            Err(SourceError::NotFound { name }) if name == "0000000011.dat"
        ));
    }

    #[tokio::test]
    async fn test_list_skips_hidden_files_and_directories() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.dat"), b"").unwrap();
        std::fs::write(dir.path().join("a.dat"), b"").unwrap();
        std::fs::write(dir.path().join(".c.dat"), b"").unwrap();
        std::fs::create_dir(dir.path().join("nested")).unwrap();

        let names = DirectorySource::new(dir.path()).list().await.unwrap();

        assert_eq!(names, vec!["a.dat".to_string(), "b.dat".to_string()]);
    }

    #[tokio::test]
    async fn test_watch_emits_each_file_once() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("0000000002.dat"), b"").unwrap();
        std::fs::write(dir.path().join("0000000001.dat"), b"").unwrap();

        let source = DirectorySource::new(dir.path());
        let (tx, mut rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let watch = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                source
                    .watch(tx, Duration::from_millis(10), cancel)
                    .await
            })
        };

        assert_eq!(rx.recv().await.unwrap(), "0000000001.dat");
        assert_eq!(rx.recv().await.unwrap(), "0000000002.dat");

        std::fs::write(dir.path().join("0000000003.dat"), b"").unwrap();
        assert_eq!(rx.recv().await.unwrap(), "0000000003.dat");

        cancel.cancel();
        watch.await.unwrap().unwrap();
        assert!(rx.try_recv().is_err());
    }
}
