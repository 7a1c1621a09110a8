//! Wire protocol between host and guest.
//!
//! Contracts reach the host through a small import surface in the `kiln`
//! namespace. Two generic channels carry most traffic, both taking
//! `(func_id, args_ptr, args_len)`:
//!
//! - `host_call` for mutations: returns a status code, `0` on success or a
//!   negative sentinel.
//! - `host_read` for queries: writes the result into the registered shared
//!   buffer and returns the byte count (or a negative sentinel).
//!
//! Three scalar accessors (`block_height`, `block_time`, `balance_of`)
//! return their value directly. Arguments are borsh-encoded structs defined
//! below; everything larger than a scalar travels through the shared buffer,
//! of which exactly one is registered per instance via `set_host_buffer`.

use borsh::{BorshDeserialize, BorshSerialize};
use serde::{Deserialize, Serialize};

use kiln_types::primitives::{Address, ObjectId};
use kiln_types::value::Value;

/// Import namespace for all host functions.
pub const HOST_MODULE: &str = "kiln";

/// Size of the shared host-to-guest result buffer.
pub const HOST_BUFFER_SIZE: usize = 16 * 1024;

/// Guest exports every contract must provide.
pub const EXPORT_MEMORY: &str = "memory";
pub const EXPORT_ALLOCATE: &str = "allocate";
pub const EXPORT_DEALLOCATE: &str = "deallocate";
pub const EXPORT_RESULT_PTR: &str = "result_ptr";
pub const EXPORT_SET_HOST_BUFFER: &str = "set_host_buffer";
pub const EXPORT_INVOKE: &str = "invoke";

/// ABI utility exports that stay outside call-context tracking.
pub const RESERVED_EXPORTS: [&str; 4] = [
    EXPORT_ALLOCATE,
    EXPORT_DEALLOCATE,
    EXPORT_RESULT_PTR,
    EXPORT_SET_HOST_BUFFER,
];

// ─── Status Sentinels ───────────────────────────────────────────────────────

pub const STATUS_OK: i32 = 0;
pub const ERR_NOT_FOUND: i32 = -1;
pub const ERR_PERMISSION_DENIED: i32 = -2;
pub const ERR_INSUFFICIENT_BALANCE: i32 = -3;
pub const ERR_VALIDATION: i32 = -4;
pub const ERR_PROTOCOL: i32 = -5;
pub const ERR_BUFFER_TOO_SMALL: i32 = -6;
pub const ERR_UNKNOWN_FUNCTION: i32 = -7;

// ─── Function Identifiers ───────────────────────────────────────────────────

/// Host function ids carried in the first argument of `host_call` and
/// `host_read`. Ids 3 to 5 are listed for completeness; they are served by
/// the dedicated scalar imports rather than the generic channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum HostFunc {
    GetSender = 1,
    GetContractAddress = 2,
    GetBlockHeight = 3,
    GetBlockTime = 4,
    GetBalance = 5,
    Transfer = 6,
    CreateObject = 7,
    CreateObjectWithId = 8,
    GetObject = 9,
    GetObjectByOwner = 10,
    DeleteObject = 11,
    GetObjectOwner = 12,
    SetObjectOwner = 13,
    GetObjectField = 14,
    SetObjectField = 15,
    EmitEvent = 16,
    ContractCall = 17,
    GetCaller = 18,
}

impl HostFunc {
    pub fn from_id(id: i32) -> Option<Self> {
        Some(match id {
            1 => Self::GetSender,
            2 => Self::GetContractAddress,
            3 => Self::GetBlockHeight,
            4 => Self::GetBlockTime,
            5 => Self::GetBalance,
            6 => Self::Transfer,
            7 => Self::CreateObject,
            8 => Self::CreateObjectWithId,
            9 => Self::GetObject,
            10 => Self::GetObjectByOwner,
            11 => Self::DeleteObject,
            12 => Self::GetObjectOwner,
            13 => Self::SetObjectOwner,
            14 => Self::GetObjectField,
            15 => Self::SetObjectField,
            16 => Self::EmitEvent,
            17 => Self::ContractCall,
            18 => Self::GetCaller,
            _ => return None,
        })
    }
}

// ─── Argument Payloads ──────────────────────────────────────────────────────

#[derive(Debug, Clone, BorshSerialize, BorshDeserialize)]
pub struct TransferArgs {
    pub from: Address,
    pub to: Address,
    pub amount: u64,
}

#[derive(Debug, Clone, BorshSerialize, BorshDeserialize)]
pub struct ObjectIdArgs {
    pub id: ObjectId,
}

#[derive(Debug, Clone, BorshSerialize, BorshDeserialize)]
pub struct OwnerQueryArgs {
    pub owner: Address,
}

#[derive(Debug, Clone, BorshSerialize, BorshDeserialize)]
pub struct GetFieldArgs {
    pub id: ObjectId,
    pub key: String,
}

#[derive(Debug, Clone, BorshSerialize, BorshDeserialize)]
pub struct SetFieldArgs {
    pub id: ObjectId,
    pub key: String,
    pub value: Vec<u8>,
}

#[derive(Debug, Clone, BorshSerialize, BorshDeserialize)]
pub struct SetOwnerArgs {
    pub id: ObjectId,
    pub new_owner: Address,
}

#[derive(Debug, Clone, BorshSerialize, BorshDeserialize)]
pub struct EmitEventArgs {
    pub name: String,
    pub attributes: Vec<(String, Value)>,
}

#[derive(Debug, Clone, BorshSerialize, BorshDeserialize)]
pub struct ContractCallArgs {
    pub target: Address,
    pub function: String,
    pub args: Vec<u8>,
}

// ─── Invocation Envelopes ───────────────────────────────────────────────────

/// Request handed to the guest `invoke` entry point. Carries the executing
/// contract, the transaction sender, and the invocation gas limit so guests
/// read them straight from the envelope instead of issuing host reads.
#[derive(Debug, Clone, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub struct CallRequest {
    pub contract: Address,
    pub sender: Address,
    pub function: String,
    pub args: Vec<u8>,
    pub gas_limit: u64,
}

/// Response the guest writes at `result_ptr`. A `success = false` response
/// is a contract-level failure: the invocation completes but none of its
/// staged effects are committed.
#[derive(Debug, Clone, BorshSerialize, BorshDeserialize, Serialize, Deserialize)]
pub struct CallResponse {
    pub success: bool,
    pub data: Value,
    pub error: String,
}

impl CallResponse {
    pub fn ok(data: Value) -> Self {
        Self {
            success: true,
            data,
            error: String::new(),
        }
    }

    pub fn fail(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: Value::unit(),
            error: error.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_func_id_roundtrip() {
        for id in 1..=18 {
            let func = HostFunc::from_id(id).unwrap();
            assert_eq!(func as i32, id);
        }
        assert!(HostFunc::from_id(0).is_none());
        assert!(HostFunc::from_id(19).is_none());
        assert!(HostFunc::from_id(-1).is_none());
    }

    #[test]
    fn test_call_response_encoding_layout() {
        // Guests build this envelope by hand, so the layout is load-bearing:
        // success (1 byte), value tag (1 byte), payload, error length (u32).
        let encoded = borsh::to_vec(&CallResponse::ok(Value::Int(7))).unwrap();
        assert_eq!(encoded.len(), 14);
        assert_eq!(encoded[0], 1);
        assert_eq!(encoded[1], 1);
        assert_eq!(&encoded[2..10], &7i64.to_le_bytes());
        assert_eq!(&encoded[10..14], &0u32.to_le_bytes());
    }

    #[test]
    fn test_call_request_encoding_layout() {
        // Guests parse this by hand too: contract (20 bytes), sender
        // (20 bytes), function, args, gas limit (u64).
        let encoded = borsh::to_vec(&CallRequest {
            contract: [0xAAu8; 20],
            sender: [0xBBu8; 20],
            function: "get".to_string(),
            args: vec![1, 2],
            gas_limit: 9_000,
        })
        .unwrap();
        assert_eq!(encoded.len(), 61);
        assert_eq!(&encoded[0..20], &[0xAAu8; 20]);
        assert_eq!(&encoded[20..40], &[0xBBu8; 20]);
        assert_eq!(&encoded[40..44], &3u32.to_le_bytes());
        assert_eq!(&encoded[44..47], b"get");
        assert_eq!(&encoded[47..51], &2u32.to_le_bytes());
        assert_eq!(&encoded[51..53], &[1, 2]);
        assert_eq!(&encoded[53..61], &9_000u64.to_le_bytes());
    }
}
