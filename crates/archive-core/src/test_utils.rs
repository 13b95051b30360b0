//! Deterministic fixtures shared by the unit and integration tests.

use crate::{
    AccountAddress,
    Block,
    BlockData,
    BlockPayload,
    Bytes,
    Chunk,
    CollectionGuarantee,
    CompleteCollection,
    Event,
    EventType,
    ExecutionResult,
    Header,
    Identifier,
    Path,
    Payload,
    Seal,
    StateCommitment,
    TransactionBody,
    TransactionResult,
    TrieUpdate,
};

use alloy_primitives::keccak256;

pub const GENERIC_HEIGHT: u64 = 100;

/// Transactions packed into every generic collection.
pub const TRANSACTIONS_PER_COLLECTION: usize = 2;

fn seeded(domain: &str, seed: u64) -> Identifier {
    keccak256([domain.as_bytes(), &seed.to_be_bytes()].concat())
}

pub fn generic_identifier(seed: u64) -> Identifier {
    seeded("identifier", seed)
}

pub fn generic_commit(seed: u64) -> StateCommitment {
    seeded("commit", seed)
}

pub fn generic_header(height: u64) -> Header {
    Header {
        parent_id: generic_identifier(height.wrapping_sub(1)),
        height,
        view: height,
        timestamp: 1_700_000_000_000 + height * 1_000,
        payload_hash: seeded("payload", height),
    }
}

pub fn generic_transactions(height: u64, count: usize) -> Vec<TransactionBody> {
    (0..count)
        .map(|i| {
            TransactionBody {
                reference_block_id: generic_identifier(height),
                script: Bytes::from(format!("transaction {height}/{i}").into_bytes()),
                arguments: vec![Bytes::from((i as u64).to_be_bytes().to_vec())],
                gas_limit: 9_999,
                payer: AccountAddress::with_last_byte(1),
                authorizers: vec![AccountAddress::with_last_byte(1)],
            }
        })
        .collect()
}

/// Collections whose guarantees reference the collection they carry.
pub fn generic_collections(height: u64, count: usize) -> Vec<CompleteCollection> {
    generic_transactions(height, count * TRANSACTIONS_PER_COLLECTION)
        .chunks(TRANSACTIONS_PER_COLLECTION)
        .enumerate()
        .map(|(i, transactions)| {
            let mut collection = CompleteCollection {
                guarantee: CollectionGuarantee {
                    collection_id: Identifier::ZERO,
                    reference_block_id: generic_identifier(height),
                    signer_ids: vec![generic_identifier(i as u64)],
                    signature: Bytes::from_static(b"signature"),
                },
                transactions: transactions.to_vec(),
            };
            collection.guarantee.collection_id = collection.light().id();
            collection
        })
        .collect()
}

pub fn generic_guarantees(height: u64, count: usize) -> Vec<CollectionGuarantee> {
    generic_collections(height, count)
        .into_iter()
        .map(|collection| collection.guarantee)
        .collect()
}

pub fn generic_seals(count: usize) -> Vec<Seal> {
    (0..count as u64)
        .map(|i| {
            Seal {
                block_id: generic_identifier(i),
                result_id: seeded("result", i),
                final_state: generic_commit(i),
            }
        })
        .collect()
}

pub fn generic_results(transactions: &[TransactionBody]) -> Vec<TransactionResult> {
    transactions
        .iter()
        .enumerate()
        .map(|(i, transaction)| {
            TransactionResult {
                transaction_id: transaction.id(),
                error_message: String::new(),
                computation_used: 10 + i as u64,
            }
        })
        .collect()
}

pub fn generic_event_type(index: usize) -> EventType {
    match index % 2 {
        0 => EventType::from("A.0000000000000001.Token.Deposited"),
        _ => EventType::from("A.0000000000000001.Token.Withdrawn"),
    }
}

/// Two events per transaction, alternating between the two generic event types.
pub fn generic_events(count: usize) -> Vec<Event> {
    (0..count)
        .map(|i| {
            Event {
                event_type: generic_event_type(i),
                transaction_id: generic_identifier((i / 2) as u64),
                transaction_index: (i / 2) as u32,
                event_index: (i % 2) as u32,
                payload: Bytes::from(format!("event {i}").into_bytes()),
            }
        })
        .collect()
}

fn events_for(transactions: &[TransactionBody]) -> Vec<Event> {
    let mut events = generic_events(transactions.len() * 2);
    for event in &mut events {
        event.transaction_id = transactions[event.transaction_index as usize].id();
    }
    events
}

pub fn generic_paths(count: usize) -> Vec<Path> {
    (0..count as u64).map(|i| seeded("path", i)).collect()
}

pub fn generic_payloads(height: u64, count: usize) -> Vec<Payload> {
    (0..count)
        .map(|i| {
            Payload {
                key: Bytes::from(format!("key {i}").into_bytes()),
                value: Bytes::from(format!("value {height}/{i}").into_bytes()),
            }
        })
        .collect()
}

/// Writes `count` generic paths with values specific to `height`.
pub fn generic_trie_update(height: u64, count: usize) -> TrieUpdate {
    TrieUpdate {
        root_hash: generic_commit(height.wrapping_sub(1)),
        paths: generic_paths(count),
        payloads: generic_payloads(height, count),
    }
}

/// Structurally valid block data for `height`, without seals or results.
pub fn generic_block_data(height: u64) -> BlockData {
    let collections = generic_collections(height, 2);
    let transactions: Vec<TransactionBody> = collections
        .iter()
        .flat_map(|collection| collection.transactions.iter().cloned())
        .collect();

    BlockData {
        block: Block {
            header: generic_header(height),
            payload: BlockPayload {
                guarantees: collections
                    .iter()
                    .map(|collection| collection.guarantee.clone())
                    .collect(),
                seals: Vec::new(),
                results: Vec::new(),
            },
        },
        tx_results: generic_results(&transactions),
        events: events_for(&transactions),
        trie_updates: vec![generic_trie_update(height, 3)],
        commit: generic_commit(height),
        collections,
    }
}

/// Seal and execution result attesting that `data` ends in `data.commit`.
pub fn generic_seal_for(data: &BlockData) -> (Seal, ExecutionResult) {
    let result = ExecutionResult {
        previous_result_id: Identifier::ZERO,
        block_id: data.block_id(),
        chunks: vec![Chunk {
            index: 0,
            start_state: data
                .trie_updates
                .first()
                .map(|update| update.root_hash)
                .unwrap_or_default(),
            end_state: data.commit,
            event_collection: seeded("events", data.height()),
        }],
    };
    let seal = Seal {
        block_id: data.block_id(),
        result_id: result.id(),
        final_state: data.commit,
    };
    (seal, result)
}

/// `count` consecutive blocks starting at `first`.
///
/// Each block links to its parent and carries the seal and execution result
/// of the block before it, so the chain passes the seal/result cross-check.
pub fn generic_chain(first: u64, count: usize) -> Vec<BlockData> {
    let mut chain: Vec<BlockData> = Vec::with_capacity(count);
    for offset in 0..count as u64 {
        let mut data = generic_block_data(first + offset);
        if let Some(previous) = chain.last() {
            data.block.header.parent_id = previous.block_id();
            let (seal, result) = generic_seal_for(previous);
            data.block.payload.seals.push(seal);
            data.block.payload.results.push(result);
        }
        chain.push(data);
    }
    chain
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chain_links_parents_and_seals() {
        let chain = generic_chain(10, 3);

        assert_eq!(chain[1].block.header.parent_id, chain[0].block_id());
        assert_eq!(chain[2].block.payload.seals[0].block_id, chain[1].block_id());
        assert_eq!(
            chain[2].block.payload.results[0].final_state_commitment(),
            Ok(chain[1].commit)
        );
        assert!(chain[0].block.payload.seals.is_empty());
    }

    #[test]
    fn test_transactions_differ_between_heights() {
        let a = generic_transactions(1, 1);
        let b = generic_transactions(2, 1);

        assert_ne!(a[0].id(), b[0].id());
    }
}
