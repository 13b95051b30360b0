//! Byte keys for the sled keyspaces.
//!
//! Every record lives in a single sled tree. The first byte of a key names its
//! keyspace, so a write batch spanning several record kinds stays atomic.
//! Heights are encoded big-endian so that keys sort by height.

use archive_core::{
    EventType,
    Identifier,
    Path,
};

use alloy_primitives::keccak256;

pub const FIRST: u8 = 1;
pub const LAST: u8 = 2;
pub const LATEST_REGISTER_HEIGHT: u8 = 3;
pub const HEIGHT_FOR_BLOCK: u8 = 4;
pub const BLOCK_FOR_HEIGHT: u8 = 5;
pub const COMMIT: u8 = 6;
pub const HEADER: u8 = 7;
pub const EVENTS: u8 = 8;
pub const REGISTER: u8 = 9;
pub const COLLECTION: u8 = 10;
pub const COLLECTIONS_FOR_HEIGHT: u8 = 11;
pub const GUARANTEE: u8 = 12;
pub const TRANSACTION: u8 = 13;
pub const TRANSACTIONS_FOR_HEIGHT: u8 = 14;
pub const HEIGHT_FOR_TRANSACTION: u8 = 15;
pub const RESULT: u8 = 16;
pub const SEAL: u8 = 17;
pub const SEALS_FOR_HEIGHT: u8 = 18;

/// Keyspace holding a single value.
pub fn marker_key(prefix: u8) -> [u8; 1] {
    [prefix]
}

pub fn height_key(prefix: u8, height: u64) -> [u8; 9] {
    let mut key = [0u8; 9];
    key[0] = prefix;
    key[1..].copy_from_slice(&height.to_be_bytes());
    key
}

pub fn id_key(prefix: u8, id: &Identifier) -> [u8; 33] {
    let mut key = [0u8; 33];
    key[0] = prefix;
    key[1..].copy_from_slice(id.as_slice());
    key
}

/// `REGISTER ‖ path ‖ height`, so all versions of a path are contiguous and
/// ordered by height.
pub fn register_key(path: &Path, height: u64) -> [u8; 41] {
    let mut key = [0u8; 41];
    key[0] = REGISTER;
    key[1..33].copy_from_slice(path.as_slice());
    key[33..].copy_from_slice(&height.to_be_bytes());
    key
}

/// `EVENTS ‖ height ‖ keccak(type)`. All events of a height share the
/// [`height_key`] prefix.
pub fn events_key(height: u64, event_type: &EventType) -> [u8; 41] {
    let mut key = [0u8; 41];
    key[..9].copy_from_slice(&height_key(EVENTS, height));
    key[9..].copy_from_slice(keccak256(event_type.as_str().as_bytes()).as_slice());
    key
}

/// Smallest key strictly greater than every key starting with `prefix`.
///
/// Returns `None` when the prefix is all `0xff`, meaning the range is unbounded.
pub fn prefix_end(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.pop() {
        if last < u8::MAX {
            end.push(last + 1);
            return Some(end);
        }
    }
    None
}
