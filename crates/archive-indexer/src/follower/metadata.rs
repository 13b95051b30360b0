//! Finalized block metadata as written by the consensus node.

use crate::{
    follower::ConsensusItem,
    keys::{
        height_key,
        id_key,
        marker_key,
    },
};

use archive_core::{
    BincodeCodec,
    Block,
    CollectionGuarantee,
    Codec,
    CodecError,
    Header,
    Identifier,
    Seal,
};

use parking_lot::Mutex;
use serde::{
    Serialize,
    de::DeserializeOwned,
};
use std::sync::Arc;

const HEADER: u8 = 1;
const GUARANTEE_IDS: u8 = 2;
const SEAL_IDS: u8 = 3;
const GUARANTEE: u8 = 4;
const SEAL: u8 = 5;
const FINALIZED_BLOCK: u8 = 6;
const FINALIZED_HEIGHT: u8 = 7;

#[derive(Debug, thiserror::Error)]
pub enum MetadataError {
    #[error("Sled error")]
    Sled(#[source] std::io::Error),
    #[error("Codec error")]
    Codec(#[source] CodecError),
    #[error("Header for block {0} not found")]
    HeaderNotFound(Identifier),
    #[error("Guarantee ids for block {0} not found")]
    GuaranteeIdsNotFound(Identifier),
    #[error("Seal ids for block {0} not found")]
    SealIdsNotFound(Identifier),
    #[error("Guarantee {0} not found")]
    GuaranteeNotFound(Identifier),
    #[error("Seal {0} not found")]
    SealNotFound(Identifier),
}

/// Read access to finalized block metadata.
pub trait BlockMetadata: Send + Sync + 'static {
    fn header(&self, block_id: &Identifier) -> Result<Header, MetadataError>;
    fn guarantee_ids(&self, block_id: &Identifier) -> Result<Vec<Identifier>, MetadataError>;
    fn seal_ids(&self, block_id: &Identifier) -> Result<Vec<Identifier>, MetadataError>;
    fn guarantee(&self, guarantee_id: &Identifier) -> Result<CollectionGuarantee, MetadataError>;
    fn seal(&self, seal_id: &Identifier) -> Result<Seal, MetadataError>;

    /// Highest finalized height, if any block was finalized yet.
    fn finalized_height(&self) -> Result<Option<u64>, MetadataError>;
    /// Identifier of the block finalized at `height`.
    fn finalized_block(&self, height: u64) -> Result<Option<Identifier>, MetadataError>;

    /// Header, guarantees and seals of a block.
    ///
    /// The default composes the single record lookups, each a separate read.
    /// A block whose records are only partly written then fails with a
    /// not-found error. Stores that can read every record at once override it.
    fn block_records(&self, block_id: &Identifier) -> Result<ConsensusItem, MetadataError> {
        let header = self.header(block_id)?;
        let guarantees = self
            .guarantee_ids(block_id)?
            .iter()
            .map(|id| self.guarantee(id))
            .collect::<Result<Vec<_>, _>>()?;
        let seals = self
            .seal_ids(block_id)?
            .iter()
            .map(|id| self.seal(id))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(ConsensusItem {
            header,
            guarantees,
            seals,
        })
    }
}

/// [`BlockMetadata`] stored in a sled database.
///
/// Clones share one database handle behind a lock.
#[derive(Clone)]
pub struct SledBlockMetadata<C = BincodeCodec> {
    db: Arc<Mutex<sled::Db>>,
    codec: C,
}

impl<C: Codec> SledBlockMetadata<C> {
    pub fn new(db: sled::Db, codec: C) -> Self {
        Self {
            db: Arc::new(Mutex::new(db)),
            codec,
        }
    }

    fn get<T: DeserializeOwned>(&self, key: &[u8]) -> Result<Option<T>, MetadataError> {
        read(&self.db.lock(), &self.codec, key)
    }

    fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>, MetadataError> {
        self.codec.marshal(value).map_err(MetadataError::Codec)
    }

    /// Stores the header and payload metadata of a block.
    pub fn insert_block(&self, block: &Block) -> Result<(), MetadataError> {
        let block_id = block.id();
        let payload = &block.payload;
        let guarantee_ids: Vec<Identifier> =
            payload.guarantees.iter().map(CollectionGuarantee::id).collect();
        let seal_ids: Vec<Identifier> = payload.seals.iter().map(Seal::id).collect();

        let mut batch = sled::Batch::default();
        batch.insert(
            &id_key(HEADER, &block_id)[..],
            &self.encode(&block.header)?[..],
        );
        batch.insert(
            &id_key(GUARANTEE_IDS, &block_id)[..],
            &self.encode(&guarantee_ids)?[..],
        );
        batch.insert(
            &id_key(SEAL_IDS, &block_id)[..],
            &self.encode(&seal_ids)?[..],
        );
        for guarantee in &payload.guarantees {
            batch.insert(
                &id_key(GUARANTEE, &guarantee.id())[..],
                &self.encode(guarantee)?[..],
            );
        }
        for seal in &payload.seals {
            batch.insert(&id_key(SEAL, &seal.id())[..], &self.encode(seal)?[..]);
        }

        self.db.lock().apply_batch(batch).map_err(MetadataError::Sled)
    }

    /// Marks `block_id` as finalized at `height` and raises the finalized height.
    pub fn finalize(&self, height: u64, block_id: &Identifier) -> Result<(), MetadataError> {
        let mut batch = sled::Batch::default();
        batch.insert(
            &height_key(FINALIZED_BLOCK, height)[..],
            &self.encode(block_id)?[..],
        );
        if self.finalized_height()?.is_none_or(|finalized| finalized < height) {
            batch.insert(
                &marker_key(FINALIZED_HEIGHT)[..],
                &self.encode(&height)?[..],
            );
        }
        self.db.lock().apply_batch(batch).map_err(MetadataError::Sled)
    }
}

fn read<C: Codec, T: DeserializeOwned>(
    db: &sled::Db,
    codec: &C,
    key: &[u8],
) -> Result<Option<T>, MetadataError> {
    db.get(key)
        .map_err(MetadataError::Sled)?
        .map(|bytes| codec.unmarshal(&bytes))
        .transpose()
        .map_err(MetadataError::Codec)
}

impl<C: Codec> BlockMetadata for SledBlockMetadata<C> {
    fn header(&self, block_id: &Identifier) -> Result<Header, MetadataError> {
        self.get(&id_key(HEADER, block_id))?
            .ok_or(MetadataError::HeaderNotFound(*block_id))
    }

    fn guarantee_ids(&self, block_id: &Identifier) -> Result<Vec<Identifier>, MetadataError> {
        self.get(&id_key(GUARANTEE_IDS, block_id))?
            .ok_or(MetadataError::GuaranteeIdsNotFound(*block_id))
    }

    fn seal_ids(&self, block_id: &Identifier) -> Result<Vec<Identifier>, MetadataError> {
        self.get(&id_key(SEAL_IDS, block_id))?
            .ok_or(MetadataError::SealIdsNotFound(*block_id))
    }

    fn guarantee(&self, guarantee_id: &Identifier) -> Result<CollectionGuarantee, MetadataError> {
        self.get(&id_key(GUARANTEE, guarantee_id))?
            .ok_or(MetadataError::GuaranteeNotFound(*guarantee_id))
    }

    fn seal(&self, seal_id: &Identifier) -> Result<Seal, MetadataError> {
        self.get(&id_key(SEAL, seal_id))?
            .ok_or(MetadataError::SealNotFound(*seal_id))
    }

    fn finalized_height(&self) -> Result<Option<u64>, MetadataError> {
        self.get(&marker_key(FINALIZED_HEIGHT))
    }

    fn finalized_block(&self, height: u64) -> Result<Option<Identifier>, MetadataError> {
        self.get(&height_key(FINALIZED_BLOCK, height))
    }

    /// Reads every record of the block under one lock, so no
    /// [`insert_block`](SledBlockMetadata::insert_block) through this handle
    /// interleaves. Those records land in a single batch.
    fn block_records(&self, block_id: &Identifier) -> Result<ConsensusItem, MetadataError> {
        let db = self.db.lock();
        let codec = &self.codec;

        let header: Header = read(&db, codec, &id_key(HEADER, block_id))?
            .ok_or(MetadataError::HeaderNotFound(*block_id))?;
        let guarantee_ids: Vec<Identifier> = read(&db, codec, &id_key(GUARANTEE_IDS, block_id))?
            .ok_or(MetadataError::GuaranteeIdsNotFound(*block_id))?;
        let seal_ids: Vec<Identifier> = read(&db, codec, &id_key(SEAL_IDS, block_id))?
            .ok_or(MetadataError::SealIdsNotFound(*block_id))?;

        let guarantees = guarantee_ids
            .iter()
            .map(|id| {
                read(&db, codec, &id_key(GUARANTEE, id))?
                    .ok_or(MetadataError::GuaranteeNotFound(*id))
            })
            .collect::<Result<Vec<CollectionGuarantee>, _>>()?;
        let seals = seal_ids
            .iter()
            .map(|id| read(&db, codec, &id_key(SEAL, id))?.ok_or(MetadataError::SealNotFound(*id)))
            .collect::<Result<Vec<Seal>, _>>()?;

        Ok(ConsensusItem {
            header,
            guarantees,
            seals,
        })
    }
}
