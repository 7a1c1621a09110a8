use std::sync::{Arc, Mutex, MutexGuard};

use wasmtime::{StoreLimits, StoreLimitsBuilder};

use kiln_ledger::{LedgerError, StagedLedger};
use kiln_types::primitives::{Address, Hash};

use crate::call_stack::CallStack;
use crate::engine::{self, EngineShared};
use crate::error::VmError;
use crate::gas::*;
use crate::protocol::*;

/// Maximum guest linear memory: 16 MB.
pub const MAX_WASM_MEMORY_BYTES: usize = 16 * 1024 * 1024;

/// Immutable facts of one invocation, captured when the session starts.
#[derive(Debug, Clone, Copy)]
pub struct ExecEnv {
    pub sender: Address,
    pub block_height: u64,
    pub block_time: u64,
    pub tx_hash: Hash,
}

/// Per-invocation execution session, shared by every nested call within the
/// invocation. One gas meter, one call stack, one staged overlay; none of
/// them outlives the invocation and nothing here is process-global.
pub struct Session {
    pub env: ExecEnv,
    gas: Mutex<GasMeter>,
    stack: Mutex<CallStack>,
    staged: Mutex<StagedLedger>,
}

impl Session {
    pub fn new(env: ExecEnv, gas_limit: u64, staged: StagedLedger) -> Self {
        Self {
            env,
            gas: Mutex::new(GasMeter::new(gas_limit)),
            stack: Mutex::new(CallStack::new()),
            staged: Mutex::new(staged),
        }
    }

    fn lock<'a, T>(mutex: &'a Mutex<T>) -> Result<MutexGuard<'a, T>, VmError> {
        mutex.lock().map_err(|e| VmError::Runtime {
            reason: e.to_string(),
        })
    }

    pub fn consume_gas(&self, amount: u64) -> Result<(), VmError> {
        Self::lock(&self.gas)?.consume(amount)
    }

    pub fn refund_gas(&self, amount: u64) -> Result<(), VmError> {
        Self::lock(&self.gas)?.refund(amount)
    }

    pub fn refund_gas_capped(&self, amount: u64) -> Result<u64, VmError> {
        Ok(Self::lock(&self.gas)?.refund_capped(amount))
    }

    pub fn gas_used(&self) -> u64 {
        self.gas.lock().map(|g| g.used()).unwrap_or(0)
    }

    pub fn gas_limit(&self) -> Result<u64, VmError> {
        Ok(Self::lock(&self.gas)?.limit())
    }

    pub fn enter(&self, contract: Address) -> Result<(), VmError> {
        Self::lock(&self.stack)?.enter(contract)
    }

    pub fn exit(&self, contract: Address) -> Result<(), VmError> {
        Self::lock(&self.stack)?.exit(contract)
    }

    pub fn current_contract(&self) -> Result<Address, VmError> {
        Ok(Self::lock(&self.stack)?.current_contract())
    }

    pub fn caller(&self) -> Result<Address, VmError> {
        Ok(Self::lock(&self.stack)?.caller())
    }

    pub fn depth(&self) -> Result<u8, VmError> {
        Ok(Self::lock(&self.stack)?.depth())
    }

    pub fn truncate_stack(&self, depth: u8) -> Result<(), VmError> {
        Self::lock(&self.stack)?.truncate(depth);
        Ok(())
    }

    pub fn staged(&self) -> Result<MutexGuard<'_, StagedLedger>, VmError> {
        Self::lock(&self.staged)
    }

    /// Consume the session and yield the staged overlay, for commit after a
    /// clean completion. Fails if an instance still holds the session.
    pub fn into_staged(self: Arc<Self>) -> Result<StagedLedger, VmError> {
        let session = Arc::try_unwrap(self).map_err(|_| VmError::Runtime {
            reason: "session still referenced at commit".to_string(),
        })?;
        session.staged.into_inner().map_err(|e| VmError::Runtime {
            reason: e.to_string(),
        })
    }
}

/// Store data for one contract instance. Several instances (nested calls)
/// may share one session; each knows which contract it is.
pub struct HostState {
    pub contract: Address,
    pub session: Arc<Session>,
    pub engine: Arc<EngineShared>,
    /// Guest pointer of the registered shared buffer.
    pub host_buffer: Option<u32>,
    pub store_limits: StoreLimits,
}

impl HostState {
    pub fn new(contract: Address, session: Arc<Session>, engine: Arc<EngineShared>) -> Self {
        Self {
            contract,
            session,
            engine,
            host_buffer: None,
            store_limits: StoreLimitsBuilder::new()
                .memory_size(MAX_WASM_MEMORY_BYTES)
                .build(),
        }
    }
}

/// Outcome of a dispatched host function: either a status code for the
/// guest, or payload bytes to place in the shared buffer. Recoverable
/// failures become negative statuses; fatal conditions (gas, protocol
/// violations, storage faults) surface as `VmError` and trap the guest.
pub enum HostReply {
    Status(i32),
    Data(Vec<u8>),
}

fn sentinel(err: LedgerError) -> Result<i32, VmError> {
    match err {
        LedgerError::NotFound { .. } => Ok(ERR_NOT_FOUND),
        LedgerError::PermissionDenied { .. } => Ok(ERR_PERMISSION_DENIED),
        LedgerError::InsufficientBalance { .. } => Ok(ERR_INSUFFICIENT_BALANCE),
        LedgerError::Validation { .. } => Ok(ERR_VALIDATION),
        err @ LedgerError::Storage { .. } => Err(VmError::Ledger(err)),
    }
}

fn decode<T: borsh::BorshDeserialize>(args: &[u8]) -> Result<T, i32> {
    borsh::from_slice(args).map_err(|_| ERR_VALIDATION)
}

macro_rules! try_decode {
    ($args:expr) => {
        match decode($args) {
            Ok(v) => v,
            Err(status) => return Ok(HostReply::Status(status)),
        }
    };
}

/// Dispatch a `host_call` mutation. `contract` is the executing instance's
/// address and `sender` the transaction sender; guests never supply either.
pub fn handle_call(state: &mut HostState, func_id: i32, args: &[u8]) -> Result<HostReply, VmError> {
    let session = Arc::clone(&state.session);
    let contract = state.contract;
    let sender = session.env.sender;

    let func = match HostFunc::from_id(func_id) {
        Some(func) => func,
        None => return Ok(HostReply::Status(ERR_UNKNOWN_FUNCTION)),
    };

    let status = match func {
        HostFunc::Transfer => {
            let args: TransferArgs = try_decode!(args);
            session.consume_gas(GAS_TRANSFER)?;
            // Contracts move their own funds or the sender's; nothing else.
            if args.from != contract && args.from != sender {
                ERR_PERMISSION_DENIED
            } else {
                match session.staged()?.transfer(&args.from, &args.to, args.amount) {
                    Ok(()) => STATUS_OK,
                    Err(err) => sentinel(err)?,
                }
            }
        }
        HostFunc::CreateObjectWithId => {
            let args: ObjectIdArgs = try_decode!(args);
            session.consume_gas(GAS_OBJECT_CREATE)?;
            match session.staged()?.create_object_with_id(&contract, &args.id) {
                Ok(_) => STATUS_OK,
                Err(err) => sentinel(err)?,
            }
        }
        HostFunc::DeleteObject => {
            let args: ObjectIdArgs = try_decode!(args);
            session.consume_gas(GAS_OBJECT_WRITE)?;
            match session.staged()?.delete_object(&contract, &sender, &args.id) {
                Ok(()) => {
                    // Capped: a delete early in a cheap invocation may have
                    // used less than the full refund.
                    session.refund_gas_capped(GAS_OBJECT_DELETE_REFUND)?;
                    STATUS_OK
                }
                Err(err) => sentinel(err)?,
            }
        }
        HostFunc::SetObjectOwner => {
            let args: SetOwnerArgs = try_decode!(args);
            session.consume_gas(GAS_OBJECT_WRITE)?;
            match session
                .staged()?
                .set_owner(&contract, &sender, &args.id, &args.new_owner)
            {
                Ok(()) => STATUS_OK,
                Err(err) => sentinel(err)?,
            }
        }
        HostFunc::SetObjectField => {
            let args: SetFieldArgs = try_decode!(args);
            session.consume_gas(
                GAS_OBJECT_WRITE.saturating_add(GAS_BYTE_WRITE.saturating_mul(args.value.len() as u64)),
            )?;
            match session
                .staged()?
                .set_field(&contract, &sender, &args.id, &args.key, &args.value)
            {
                Ok(()) => STATUS_OK,
                Err(err) => sentinel(err)?,
            }
        }
        HostFunc::EmitEvent => {
            let args: EmitEventArgs = try_decode!(args);
            session.consume_gas(GAS_EMIT_EVENT)?;
            match session.staged()?.log(&contract, &args.name, &args.attributes) {
                Ok(()) => STATUS_OK,
                Err(err) => sentinel(err)?,
            }
        }
        _ => ERR_UNKNOWN_FUNCTION,
    };
    Ok(HostReply::Status(status))
}

/// Dispatch a `host_read` query. On success the returned bytes are copied
/// into the registered buffer by the caller.
pub fn handle_read(state: &mut HostState, func_id: i32, args: &[u8]) -> Result<HostReply, VmError> {
    let session = Arc::clone(&state.session);
    let contract = state.contract;
    let sender = session.env.sender;

    let func = match HostFunc::from_id(func_id) {
        Some(func) => func,
        None => return Ok(HostReply::Status(ERR_UNKNOWN_FUNCTION)),
    };

    let data = match func {
        HostFunc::GetSender => sender.to_vec(),
        HostFunc::GetContractAddress => session.current_contract()?.to_vec(),
        HostFunc::GetCaller => session.caller()?.to_vec(),
        HostFunc::CreateObject => {
            session.consume_gas(GAS_OBJECT_CREATE)?;
            match session.staged()?.create_object(&contract, &sender) {
                Ok(record) => record.id.to_vec(),
                Err(err) => return Ok(HostReply::Status(sentinel(err)?)),
            }
        }
        HostFunc::GetObject => {
            let args: ObjectIdArgs = try_decode!(args);
            session.consume_gas(GAS_OBJECT_READ)?;
            match session.staged()?.get_object(&args.id) {
                Ok(record) => borsh::to_vec(&record).map_err(|e| VmError::Runtime {
                    reason: e.to_string(),
                })?,
                Err(err) => return Ok(HostReply::Status(sentinel(err)?)),
            }
        }
        HostFunc::GetObjectByOwner => {
            let args: OwnerQueryArgs = try_decode!(args);
            session.consume_gas(GAS_OBJECT_READ)?;
            match session.staged()?.get_object_by_owner(&contract, &args.owner) {
                Ok(record) => borsh::to_vec(&record).map_err(|e| VmError::Runtime {
                    reason: e.to_string(),
                })?,
                Err(err) => return Ok(HostReply::Status(sentinel(err)?)),
            }
        }
        HostFunc::GetObjectOwner => {
            let args: ObjectIdArgs = try_decode!(args);
            session.consume_gas(GAS_OBJECT_READ)?;
            match session.staged()?.get_object(&args.id) {
                Ok(record) => record.owner.to_vec(),
                Err(err) => return Ok(HostReply::Status(sentinel(err)?)),
            }
        }
        HostFunc::GetObjectField => {
            let args: GetFieldArgs = try_decode!(args);
            session.consume_gas(GAS_OBJECT_READ)?;
            match session.staged()?.get_field(&contract, &sender, &args.id, &args.key) {
                Ok(value) => {
                    session.consume_gas(GAS_BYTE_READ.saturating_mul(value.len() as u64))?;
                    value
                }
                Err(err) => return Ok(HostReply::Status(sentinel(err)?)),
            }
        }
        HostFunc::ContractCall => {
            let args: ContractCallArgs = try_decode!(args);
            return contract_call(state, args);
        }
        _ => return Ok(HostReply::Status(ERR_UNKNOWN_FUNCTION)),
    };

    if data.len() > HOST_BUFFER_SIZE {
        return Ok(HostReply::Status(ERR_BUFFER_TOO_SMALL));
    }
    Ok(HostReply::Data(data))
}

/// Synchronous nested call into another contract, sharing this session.
/// The staging overlay is snapshotted first; a failing callee rolls back to
/// the snapshot, so only its own writes are discarded. The callee's
/// response envelope is returned to the caller verbatim.
fn contract_call(state: &mut HostState, args: ContractCallArgs) -> Result<HostReply, VmError> {
    let session = Arc::clone(&state.session);
    session.consume_gas(GAS_CALL_BASE)?;
    let depth_before = session.depth()?;
    if depth_before >= MAX_CALL_DEPTH {
        return Ok(HostReply::Status(ERR_PROTOCOL));
    }

    // Snapshot outside the lock held during recursion.
    let snapshot = session.staged()?.snapshot();

    let result = engine::invoke_in_session(
        &state.engine,
        &session,
        &args.target,
        &args.function,
        &args.args,
    );

    let response = match result {
        Ok(response) => {
            if !response.success {
                session.staged()?.restore(snapshot);
            }
            response
        }
        Err(err @ (VmError::OutOfGas { .. } | VmError::InvalidRefund { .. })) => {
            // Gas faults abort the whole invocation, not just the callee.
            return Err(err);
        }
        Err(VmError::ContractNotFound { .. }) => {
            session.staged()?.restore(snapshot);
            return Ok(HostReply::Status(ERR_NOT_FOUND));
        }
        Err(err) => {
            // A trapped callee never ran its exits; unwind its frames along
            // with its writes.
            session.truncate_stack(depth_before)?;
            session.staged()?.restore(snapshot);
            CallResponse::fail(err.to_string())
        }
    };

    let bytes = borsh::to_vec(&response).map_err(|e| VmError::Runtime {
        reason: e.to_string(),
    })?;
    if bytes.len() > HOST_BUFFER_SIZE {
        return Ok(HostReply::Status(ERR_BUFFER_TOO_SMALL));
    }
    Ok(HostReply::Data(bytes))
}
