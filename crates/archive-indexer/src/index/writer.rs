//! Batched, concurrent index writes.
//!
//! Every write call encodes its records up front and stages them into the
//! pending transaction as a unit. Once the pending transaction holds
//! `batch_size` records it is committed on the writer pool, with at most
//! `concurrent_transactions` commits in flight. Height markers (first, last,
//! latest register height) are published in dispatch order, once every
//! transaction staged before them has committed, and only ever move outward.

use crate::{
    critical,
    index::{
        IndexError,
        Reader,
    },
    keys::{
        self,
        height_key,
        id_key,
        marker_key,
        register_key,
    },
    metrics,
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
    Payload,
    Seal,
    StateCommitment,
    TransactionBody,
    TransactionResult,
};

use parking_lot::{
    Condvar,
    Mutex,
};
use serde::{
    Serialize,
    de::DeserializeOwned,
};
use std::{
    collections::BTreeMap,
    sync::{
        Arc,
        atomic::{
            AtomicBool,
            Ordering,
        },
    },
};
use tracing::{
    debug,
    info,
    warn,
};

pub const DEFAULT_BATCH_SIZE: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriterConfig {
    /// Records staged before a transaction is committed.
    pub batch_size: usize,
    /// Transactions allowed to commit in parallel.
    pub concurrent_transactions: usize,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            concurrent_transactions: 1,
        }
    }
}

impl WriterConfig {
    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    #[must_use]
    pub fn with_concurrent_transactions(mut self, concurrent_transactions: usize) -> Self {
        self.concurrent_transactions = concurrent_transactions.max(1);
        self
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct Markers {
    first: Option<u64>,
    last: Option<u64>,
    latest_register: Option<u64>,
}

impl Markers {
    /// Folds `other` in and returns the markers that moved.
    fn merge(&mut self, other: Markers) -> Markers {
        let mut moved = Markers::default();
        if let Some(first) = other.first
            && self.first.is_none_or(|current| first < current)
        {
            self.first = Some(first);
            moved.first = Some(first);
        }
        if let Some(last) = other.last
            && self.last.is_none_or(|current| last > current)
        {
            self.last = Some(last);
            moved.last = Some(last);
        }
        if let Some(latest) = other.latest_register
            && self.latest_register.is_none_or(|current| latest > current)
        {
            self.latest_register = Some(latest);
            moved.latest_register = Some(latest);
        }
        moved
    }

    fn entries(self) -> impl Iterator<Item = (u8, u64)> {
        [
            (keys::FIRST, self.first),
            (keys::LAST, self.last),
            (keys::LATEST_REGISTER_HEIGHT, self.latest_register),
        ]
        .into_iter()
        .filter_map(|(prefix, height)| height.map(|height| (prefix, height)))
    }
}

#[derive(Default)]
struct Transaction {
    batch: sled::Batch,
    records: usize,
    markers: Markers,
}

#[derive(Default)]
struct Commits {
    running: usize,
    failures: Vec<IndexError>,
    /// Set once a transaction failed. Later markers are never published.
    failed: bool,
    /// Sequence number of the next dispatched transaction.
    dispatched: u64,
    /// Transactions before this one have committed and published their markers.
    published: u64,
    /// Markers of committed transactions waiting for an earlier one.
    waiting: BTreeMap<u64, Markers>,
    /// Markers as currently stored.
    markers: Markers,
}

impl Commits {
    /// Queues the markers of committed transaction `sequence` and publishes
    /// every queued marker that no longer waits on an earlier transaction.
    fn complete<C: Codec>(
        &mut self,
        sequence: u64,
        markers: Markers,
        db: &sled::Db,
        codec: &C,
    ) -> Result<(), IndexError> {
        if self.failed {
            return Ok(());
        }
        self.waiting.insert(sequence, markers);
        self.publish(db, codec)
    }

    fn publish<C: Codec>(&mut self, db: &sled::Db, codec: &C) -> Result<(), IndexError> {
        while let Some(markers) = self.waiting.remove(&self.published) {
            self.published += 1;
            let moved = self.markers.merge(markers);
            for (prefix, height) in moved.entries() {
                let value = codec.marshal(&height).map_err(IndexError::Codec)?;
                db.insert(marker_key(prefix), &value[..])
                    .map_err(IndexError::Sled)?;
            }
        }
        Ok(())
    }

    /// Records a failed transaction. It blocks all later markers, so the
    /// queued ones are dropped.
    fn fail(&mut self, err: IndexError) {
        self.failed = true;
        self.waiting.clear();
        self.failures.push(err);
    }
}

struct Inflight {
    commits: Mutex<Commits>,
    done: Condvar,
}

type Record = (Vec<u8>, Vec<u8>);

/// Stages and commits index records.
///
/// The database handle is locked only to clone it for a commit job and to
/// flush on close.
pub struct Writer<C = BincodeCodec> {
    db: Mutex<sled::Db>,
    codec: C,
    config: WriterConfig,
    pool: rayon::ThreadPool,
    pending: Mutex<Transaction>,
    inflight: Arc<Inflight>,
    closed: AtomicBool,
}

impl<C: Codec> Writer<C> {
    pub fn new(db: sled::Db, codec: C, config: WriterConfig) -> Result<Self, IndexError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.concurrent_transactions)
            .thread_name(|index| format!("index-writer-{index}"))
            .build()
            .map_err(IndexError::ThreadPool)?;

        let markers = Markers {
            first: stored_marker(&db, &codec, keys::FIRST)?,
            last: stored_marker(&db, &codec, keys::LAST)?,
            latest_register: stored_marker(&db, &codec, keys::LATEST_REGISTER_HEIGHT)?,
        };
        debug!(?markers, "Opened index writer");

        let inflight = Inflight {
            commits: Mutex::new(Commits {
                markers,
                ..Default::default()
            }),
            done: Condvar::new(),
        };

        Ok(Self {
            db: Mutex::new(db),
            codec,
            config,
            pool,
            pending: Mutex::new(Transaction::default()),
            inflight: Arc::new(inflight),
            closed: AtomicBool::new(false),
        })
    }

    fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>, IndexError> {
        self.codec.marshal(value).map_err(IndexError::Codec)
    }

    fn stage(&self, records: Vec<Record>, markers: Markers) -> Result<(), IndexError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(IndexError::Closed);
        }
        self.check_failures()?;

        let full = {
            let mut pending = self.pending.lock();
            for (key, value) in &records {
                pending.batch.insert(&key[..], &value[..]);
            }
            pending.records += records.len() + markers.entries().count();
            pending.markers.merge(markers);
            (pending.records >= self.config.batch_size).then(|| std::mem::take(&mut *pending))
        };

        if let Some(transaction) = full {
            self.dispatch(transaction);
        }
        Ok(())
    }

    fn dispatch(&self, transaction: Transaction) {
        let sequence = {
            let mut commits = self.inflight.commits.lock();
            while commits.running >= self.config.concurrent_transactions {
                self.inflight.done.wait(&mut commits);
            }
            commits.running += 1;
            commits.dispatched += 1;
            commits.dispatched - 1
        };

        let db = self.db.lock().clone();
        let codec = self.codec.clone();
        let inflight = Arc::clone(&self.inflight);
        self.pool.spawn(move || {
            let records = transaction.records;
            let result = db.apply_batch(transaction.batch).map_err(IndexError::Sled);

            let mut commits = inflight.commits.lock();
            let result = result
                .and_then(|()| commits.complete(sequence, transaction.markers, &db, &codec));
            commits.running -= 1;
            match result {
                Ok(()) => metrics::record_commit(records),
                Err(err) => {
                    critical!(
                        error = ?err,
                        sequence,
                        records,
                        "Failed to commit index transaction"
                    );
                    commits.fail(err);
                }
            }
            inflight.done.notify_all();
        });
    }

    /// A reader over the same index.
    pub fn reader(&self) -> Reader<C> {
        Reader::new(self.db.lock().clone(), self.codec.clone())
    }

    /// Last height whose marker has been committed.
    pub fn last_indexed(&self) -> Option<u64> {
        self.inflight.commits.lock().markers.last
    }

    /// Returns the first unreported commit failure, then
    /// [`IndexError::CommitFailed`] on every later call.
    fn check_failures(&self) -> Result<(), IndexError> {
        let mut commits = self.inflight.commits.lock();
        if let Some(err) = commits.failures.pop() {
            return Err(err);
        }
        if commits.failed {
            return Err(IndexError::CommitFailed);
        }
        Ok(())
    }

    /// Commits staged records, waits for every commit and flushes the store.
    ///
    /// Records are only guaranteed to be visible to readers after `close`.
    /// Closing twice is a no-op.
    pub fn close(&self) -> Result<(), IndexError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let transaction = std::mem::take(&mut *self.pending.lock());
        if transaction.records > 0 {
            self.dispatch(transaction);
        }

        {
            let mut commits = self.inflight.commits.lock();
            while commits.running > 0 {
                self.inflight.done.wait(&mut commits);
            }
        }
        self.check_failures()?;

        self.db.lock().flush().map_err(IndexError::Sled)?;
        info!("Index writer closed");
        Ok(())
    }

    /// Records the first indexed height.
    pub fn first(&self, height: u64) -> Result<(), IndexError> {
        self.stage(
            Vec::new(),
            Markers {
                first: Some(height),
                ..Default::default()
            },
        )
    }

    /// Records the last fully indexed height.
    pub fn last(&self, height: u64) -> Result<(), IndexError> {
        self.stage(
            Vec::new(),
            Markers {
                last: Some(height),
                ..Default::default()
            },
        )
    }

    /// Maps a block identifier to its height and back.
    pub fn height(&self, block_id: &Identifier, height: u64) -> Result<(), IndexError> {
        let records = vec![
            (
                id_key(keys::HEIGHT_FOR_BLOCK, block_id).to_vec(),
                self.encode(&height)?,
            ),
            (
                height_key(keys::BLOCK_FOR_HEIGHT, height).to_vec(),
                self.encode(block_id)?,
            ),
        ];
        self.stage(records, Markers::default())
    }

    pub fn commit(&self, height: u64, commit: &StateCommitment) -> Result<(), IndexError> {
        let records = vec![(
            height_key(keys::COMMIT, height).to_vec(),
            self.encode(commit)?,
        )];
        self.stage(records, Markers::default())
    }

    pub fn header(&self, height: u64, header: &Header) -> Result<(), IndexError> {
        let records = vec![(
            height_key(keys::HEADER, height).to_vec(),
            self.encode(header)?,
        )];
        self.stage(records, Markers::default())
    }

    /// Writes register values at `height`; `payloads[i]` is the value of `paths[i]`.
    pub fn payloads(
        &self,
        height: u64,
        paths: &[Path],
        payloads: &[Payload],
    ) -> Result<(), IndexError> {
        if paths.len() != payloads.len() {
            return Err(IndexError::PayloadMismatch {
                paths: paths.len(),
                payloads: payloads.len(),
            });
        }

        let records = paths
            .iter()
            .zip(payloads)
            .map(|(path, payload)| {
                Ok((
                    register_key(path, height).to_vec(),
                    self.encode(&payload.value)?,
                ))
            })
            .collect::<Result<Vec<_>, IndexError>>()?;

        metrics::record_registers_written(records.len());
        self.stage(
            records,
            Markers {
                latest_register: Some(height),
                ..Default::default()
            },
        )
    }

    pub fn collections(
        &self,
        height: u64,
        collections: &[LightCollection],
    ) -> Result<(), IndexError> {
        let mut records = Vec::with_capacity(collections.len() + 1);
        let mut ids = Vec::with_capacity(collections.len());
        for collection in collections {
            let id = collection.id();
            records.push((
                id_key(keys::COLLECTION, &id).to_vec(),
                self.encode(collection)?,
            ));
            ids.push(id);
        }
        records.push((
            height_key(keys::COLLECTIONS_FOR_HEIGHT, height).to_vec(),
            self.encode(&ids)?,
        ));
        self.stage(records, Markers::default())
    }

    pub fn guarantees(&self, guarantees: &[CollectionGuarantee]) -> Result<(), IndexError> {
        let records = guarantees
            .iter()
            .map(|guarantee| {
                Ok((
                    id_key(keys::GUARANTEE, &guarantee.id()).to_vec(),
                    self.encode(guarantee)?,
                ))
            })
            .collect::<Result<Vec<_>, IndexError>>()?;
        self.stage(records, Markers::default())
    }

    pub fn transactions(
        &self,
        height: u64,
        transactions: &[TransactionBody],
    ) -> Result<(), IndexError> {
        let encoded_height = self.encode(&height)?;
        let mut records = Vec::with_capacity(transactions.len() * 2 + 1);
        let mut ids = Vec::with_capacity(transactions.len());
        for transaction in transactions {
            let id = transaction.id();
            records.push((
                id_key(keys::TRANSACTION, &id).to_vec(),
                self.encode(transaction)?,
            ));
            records.push((
                id_key(keys::HEIGHT_FOR_TRANSACTION, &id).to_vec(),
                encoded_height.clone(),
            ));
            ids.push(id);
        }
        records.push((
            height_key(keys::TRANSACTIONS_FOR_HEIGHT, height).to_vec(),
            self.encode(&ids)?,
        ));
        self.stage(records, Markers::default())
    }

    pub fn results(&self, results: &[TransactionResult]) -> Result<(), IndexError> {
        let records = results
            .iter()
            .map(|result| {
                Ok((
                    id_key(keys::RESULT, &result.transaction_id).to_vec(),
                    self.encode(result)?,
                ))
            })
            .collect::<Result<Vec<_>, IndexError>>()?;
        self.stage(records, Markers::default())
    }

    /// Writes the events of `height`, grouped by event type.
    pub fn events(&self, height: u64, events: &[Event]) -> Result<(), IndexError> {
        let mut by_type: BTreeMap<&EventType, Vec<&Event>> = BTreeMap::new();
        for event in events {
            by_type.entry(&event.event_type).or_default().push(event);
        }

        let records = by_type
            .into_iter()
            .map(|(event_type, events)| {
                Ok((
                    keys::events_key(height, event_type).to_vec(),
                    self.encode(&events)?,
                ))
            })
            .collect::<Result<Vec<_>, IndexError>>()?;
        self.stage(records, Markers::default())
    }

    pub fn seals(&self, height: u64, seals: &[Seal]) -> Result<(), IndexError> {
        let mut records = Vec::with_capacity(seals.len() + 1);
        let mut ids = Vec::with_capacity(seals.len());
        for seal in seals {
            let id = seal.id();
            records.push((id_key(keys::SEAL, &id).to_vec(), self.encode(seal)?));
            ids.push(id);
        }
        records.push((
            height_key(keys::SEALS_FOR_HEIGHT, height).to_vec(),
            self.encode(&ids)?,
        ));
        self.stage(records, Markers::default())
    }
}

impl<C> Drop for Writer<C> {
    fn drop(&mut self) {
        let staged = self.pending.get_mut().records;
        if !*self.closed.get_mut() && staged > 0 {
            warn!(staged, "Index writer dropped without close, staged records are lost");
        }
    }
}

fn stored_marker<C: Codec, T: DeserializeOwned>(
    db: &sled::Db,
    codec: &C,
    prefix: u8,
) -> Result<Option<T>, IndexError> {
    db.get(marker_key(prefix))
        .map_err(IndexError::Sled)?
        .map(|bytes| codec.unmarshal(&bytes))
        .transpose()
        .map_err(IndexError::Codec)
}
