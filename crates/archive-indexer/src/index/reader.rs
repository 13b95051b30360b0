use crate::{
    index::IndexError,
    keys::{
        self,
        events_key,
        height_key,
        id_key,
        marker_key,
        prefix_end,
        register_key,
    },
};

use archive_core::{
    BincodeCodec,
    Codec,
    CollectionGuarantee,
    Event,
    EventType,
    Header,
    Identifier,
    LightCollection,
    Path,
    RegisterValue,
    Seal,
    StateCommitment,
    TransactionBody,
    TransactionResult,
};

use futures::{
    StreamExt,
    TryStreamExt,
};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use std::{
    collections::BTreeSet,
    ops::Bound,
    sync::Arc,
};

/// Register lookups kept in flight by a single [`Reader::values`] call.
pub const CONCURRENT_PATH_READ_LIMIT: usize = 1024;

/// Read access to the index.
///
/// Cloning is cheap; clones share one handle to the underlying database.
/// A `sled::Db` handle cannot be used from several threads at once, so
/// lookups lock it and register fan-outs take a handle of their own per path.
#[derive(Clone)]
pub struct Reader<C = BincodeCodec> {
    db: Arc<Mutex<sled::Db>>,
    codec: C,
}

impl<C: Codec> Reader<C> {
    pub fn new(db: sled::Db, codec: C) -> Self {
        Self {
            db: Arc::new(Mutex::new(db)),
            codec,
        }
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, IndexError> {
        decode(&self.codec, bytes)
    }

    fn get<T: DeserializeOwned>(&self, key: &[u8], record: &'static str) -> Result<T, IndexError> {
        let bytes = self
            .db
            .lock()
            .get(key)
            .map_err(IndexError::Sled)?
            .ok_or(IndexError::Unavailable(record))?;
        self.decode(&bytes)
    }

    /// First indexed height.
    pub fn first(&self) -> Result<u64, IndexError> {
        self.get(&marker_key(keys::FIRST), "first height")
    }

    /// Last fully indexed height.
    pub fn last(&self) -> Result<u64, IndexError> {
        self.get(&marker_key(keys::LAST), "last height")
    }

    /// Highest height for which register values were written.
    pub fn latest_register_height(&self) -> Result<u64, IndexError> {
        self.get(
            &marker_key(keys::LATEST_REGISTER_HEIGHT),
            "latest register height",
        )
    }

    fn check_height(&self, height: u64) -> Result<(), IndexError> {
        let first = self.first()?;
        let last = self.last()?;
        if height < first || height > last {
            return Err(IndexError::OutOfBounds {
                height,
                first,
                last,
            });
        }
        Ok(())
    }

    pub fn height_for_block(&self, block_id: &Identifier) -> Result<u64, IndexError> {
        self.get(&id_key(keys::HEIGHT_FOR_BLOCK, block_id), "block height")
    }

    pub fn block_for_height(&self, height: u64) -> Result<Identifier, IndexError> {
        self.get(&height_key(keys::BLOCK_FOR_HEIGHT, height), "block id")
    }

    /// State commitment after the block at `height` was executed.
    pub fn commit(&self, height: u64) -> Result<StateCommitment, IndexError> {
        self.get(&height_key(keys::COMMIT, height), "commit")
    }

    pub fn header(&self, height: u64) -> Result<Header, IndexError> {
        self.get(&height_key(keys::HEADER, height), "header")
    }

    /// Register values at `paths` as they were after the block at `height`.
    ///
    /// The result is aligned with `paths`. A path that was never written
    /// yields an empty value.
    pub async fn values(
        &self,
        height: u64,
        paths: &[Path],
    ) -> Result<Vec<RegisterValue>, IndexError> {
        self.check_height(height)?;

        if let [path] = paths {
            return Ok(vec![latest_value(&self.db.lock(), &self.codec, path, height)?]);
        }

        let total = paths.len();
        futures::stream::iter(paths.iter().copied().enumerate())
            .map(|(index, path)| {
                let db = self.db.lock().clone();
                let codec = self.codec.clone();
                async move {
                    let value = match tokio::task::spawn_blocking(move || {
                        latest_value(&db, &codec, &path, height)
                    })
                    .await
                    {
                        Ok(value) => value,
                        Err(err) => Err(IndexError::Join(err)),
                    };
                    value.map_err(|source| {
                        IndexError::Lookup {
                            index,
                            total,
                            source: Box::new(source),
                        }
                    })
                }
            })
            .buffered(CONCURRENT_PATH_READ_LIMIT)
            .try_collect()
            .await
    }

    pub fn collection(&self, collection_id: &Identifier) -> Result<LightCollection, IndexError> {
        self.get(&id_key(keys::COLLECTION, collection_id), "collection")
    }

    pub fn collections_by_height(&self, height: u64) -> Result<Vec<Identifier>, IndexError> {
        self.get(
            &height_key(keys::COLLECTIONS_FOR_HEIGHT, height),
            "collections",
        )
    }

    pub fn guarantee(&self, collection_id: &Identifier) -> Result<CollectionGuarantee, IndexError> {
        self.get(&id_key(keys::GUARANTEE, collection_id), "guarantee")
    }

    pub fn transaction(&self, transaction_id: &Identifier) -> Result<TransactionBody, IndexError> {
        self.get(&id_key(keys::TRANSACTION, transaction_id), "transaction")
    }

    pub fn height_for_transaction(&self, transaction_id: &Identifier) -> Result<u64, IndexError> {
        self.get(
            &id_key(keys::HEIGHT_FOR_TRANSACTION, transaction_id),
            "transaction height",
        )
    }

    pub fn transactions_by_height(&self, height: u64) -> Result<Vec<Identifier>, IndexError> {
        self.get(
            &height_key(keys::TRANSACTIONS_FOR_HEIGHT, height),
            "transactions",
        )
    }

    pub fn result(&self, transaction_id: &Identifier) -> Result<TransactionResult, IndexError> {
        self.get(&id_key(keys::RESULT, transaction_id), "transaction result")
    }

    /// Events emitted by the block at `height`, ordered by transaction and
    /// event index. Only events of the given types are returned, unless
    /// `types` is empty.
    pub fn events(&self, height: u64, types: &[EventType]) -> Result<Vec<Event>, IndexError> {
        self.check_height(height)?;

        let mut events = Vec::new();
        if types.is_empty() {
            let prefix = height_key(keys::EVENTS, height);
            let end = prefix_end(&prefix).map_or(Bound::Unbounded, Bound::Excluded);
            let db = self.db.lock();
            for entry in db.range((Bound::Included(prefix.to_vec()), end)) {
                let (_, bytes) = entry.map_err(IndexError::Sled)?;
                events.extend(self.decode::<Vec<Event>>(&bytes)?);
            }
        } else {
            for event_type in types.iter().collect::<BTreeSet<_>>() {
                let key = events_key(height, event_type);
                let bytes = self.db.lock().get(key).map_err(IndexError::Sled)?;
                if let Some(bytes) = bytes {
                    events.extend(self.decode::<Vec<Event>>(&bytes)?);
                }
            }
        }

        events.sort_by_key(|event| (event.transaction_index, event.event_index));
        Ok(events)
    }

    pub fn seal(&self, seal_id: &Identifier) -> Result<Seal, IndexError> {
        self.get(&id_key(keys::SEAL, seal_id), "seal")
    }

    pub fn seals_by_height(&self, height: u64) -> Result<Vec<Identifier>, IndexError> {
        self.get(&height_key(keys::SEALS_FOR_HEIGHT, height), "seals")
    }
}

fn decode<C: Codec, T: DeserializeOwned>(codec: &C, bytes: &[u8]) -> Result<T, IndexError> {
    codec.unmarshal(bytes).map_err(IndexError::Codec)
}

/// Most recent value of `path` written at or below `height`.
fn latest_value<C: Codec>(
    db: &sled::Db,
    codec: &C,
    path: &Path,
    height: u64,
) -> Result<RegisterValue, IndexError> {
    let mut versions = db.range(register_key(path, 0)..=register_key(path, height));
    match versions.next_back() {
        Some(entry) => {
            let (_, bytes) = entry.map_err(IndexError::Sled)?;
            decode(codec, &bytes)
        }
        None => Ok(RegisterValue::new()),
    }
}
