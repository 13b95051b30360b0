use crate::{
    CollectionGuarantee,
    Identifier,
};

use alloy_primitives::{
    Bytes,
    FixedBytes,
    Keccak256,
};
use serde::{
    Deserialize,
    Serialize,
};
use std::fmt;

/// On-chain account address.
pub type AccountAddress = FixedBytes<8>;

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionBody {
    pub reference_block_id: Identifier,
    pub script: Bytes,
    pub arguments: Vec<Bytes>,
    pub gas_limit: u64,
    pub payer: AccountAddress,
    pub authorizers: Vec<AccountAddress>,
}

impl TransactionBody {
    pub fn id(&self) -> Identifier {
        let mut hasher = Keccak256::new();
        hasher.update(self.reference_block_id);
        hasher.update(&self.script);
        for argument in &self.arguments {
            hasher.update((argument.len() as u64).to_be_bytes());
            hasher.update(argument);
        }
        hasher.update(self.gas_limit.to_be_bytes());
        hasher.update(self.payer);
        for authorizer in &self.authorizers {
            hasher.update(authorizer);
        }
        hasher.finalize()
    }
}

/// A collection reduced to the identifiers of its transactions.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LightCollection {
    pub transactions: Vec<Identifier>,
}

impl LightCollection {
    pub fn id(&self) -> Identifier {
        let mut hasher = Keccak256::new();
        for tx_id in &self.transactions {
            hasher.update(tx_id);
        }
        hasher.finalize()
    }
}

/// A guaranteed collection together with its full transaction bodies.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompleteCollection {
    pub guarantee: CollectionGuarantee,
    pub transactions: Vec<TransactionBody>,
}

impl CompleteCollection {
    pub fn light(&self) -> LightCollection {
        LightCollection {
            transactions: self.transactions.iter().map(TransactionBody::id).collect(),
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionResult {
    pub transaction_id: Identifier,
    /// Empty when the transaction succeeded.
    pub error_message: String,
    pub computation_used: u64,
}

/// Fully qualified type of an emitted event, e.g. `A.0x1.FlowToken.TokensDeposited`.
#[derive(Debug, Default, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EventType(pub String);

impl EventType {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EventType {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for EventType {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub event_type: EventType,
    pub transaction_id: Identifier,
    pub transaction_index: u32,
    pub event_index: u32,
    pub payload: Bytes,
}
