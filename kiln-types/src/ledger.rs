use borsh::{BorshDeserialize, BorshSerialize};
use serde::{Deserialize, Serialize};

use crate::primitives::{Address, Amount, Hash, ObjectId};

/// A block in the chain. Heights are unique and monotonically increasing;
/// the hash is unique across all blocks.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize,
)]
pub struct Block {
    pub height: u64,
    /// Unix timestamp in seconds.
    pub time: u64,
    pub hash: Hash,
}

/// A transaction, anchored to the block it was included in.
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub struct Transaction {
    pub hash: Hash,
    pub block_height: u64,
    pub from: Address,
    pub to: Address,
    pub value: Amount,
    pub data: Vec<u8>,
}

/// An object header: identity, owner, and the contract the object belongs to.
/// The object's fields live in a separate keyed table.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize,
)]
pub struct ObjectRecord {
    pub id: ObjectId,
    pub owner: Address,
    pub contract: Address,
}

/// An event emitted during contract execution. The payload is the borsh
/// encoding of the attribute list `Vec<(String, Value)>`. The event log is
/// append-only.
#[derive(Debug, Clone, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub struct Event {
    pub block_height: u64,
    pub tx_hash: Hash,
    pub contract: Address,
    pub name: String,
    pub payload: Vec<u8>,
}
