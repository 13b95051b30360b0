//! Prometheus metrics for the archive indexer.
//!
//! ### Gauges
//! - `archive_ingested_height`: Height of the most recently ingested block file
//! - `archive_follower_cache_size`: Blocks buffered by the execution follower
//! - `archive_indexed_height`: Last height fully written to the index
//!
//! ### Counters
//! - `archive_blocks_ingested_total`: Block files decoded and buffered
//! - `archive_registers_written_total`: Register values staged for writing
//! - `archive_finalization_failures_total`: Finalized blocks whose metadata could not be loaded
//! - `archive_transactions_committed_total`: Index write transactions committed
//! - `archive_operations_committed_total`: Records committed to the index

#![allow(clippy::cast_precision_loss)]

use metrics::{
    counter,
    gauge,
};

/// Record a block file buffered by the execution follower.
pub fn record_ingested(height: u64, cache_size: usize) {
    gauge!("archive_ingested_height").set(height as f64);
    gauge!("archive_follower_cache_size").set(cache_size as f64);
    counter!("archive_blocks_ingested_total").increment(1);
}

pub fn set_cache_size(cache_size: usize) {
    gauge!("archive_follower_cache_size").set(cache_size as f64);
}

pub fn set_indexed_height(height: u64) {
    gauge!("archive_indexed_height").set(height as f64);
}

pub fn record_registers_written(count: usize) {
    counter!("archive_registers_written_total").increment(count as u64);
}

pub fn record_finalization_failure() {
    counter!("archive_finalization_failures_total").increment(1);
}

/// Record a committed index write transaction holding `operations` records.
pub fn record_commit(operations: usize) {
    counter!("archive_transactions_committed_total").increment(1);
    counter!("archive_operations_committed_total").increment(operations as u64);
}
