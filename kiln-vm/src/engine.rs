use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use kiln_crypto::address::contract_address;
use kiln_crypto::hash::blake3_hash;
use kiln_ledger::Context;
use kiln_types::primitives::{object_id_for_address, Address, Hash, ZERO_HASH};
use kiln_types::value::Value;

use crate::error::VmError;
use crate::gas::DEFAULT_GAS_LIMIT;
use crate::host::{ExecEnv, HostState, Session};
use crate::instrument::instrument;
use crate::protocol::{CallRequest, CallResponse};
use crate::runtime::KilnRuntime;

/// Lifecycle of a single invocation, for tracing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationState {
    Idle,
    Compiled,
    Instantiated,
    Running,
    Completed,
    Trapped,
    GasExhausted,
    Closed,
}

/// Deployed-code registry. Addresses map to the BLAKE3 hash of the raw
/// bytecode, and compiled modules are stored once per hash, so two
/// deployments of identical code share one compiled copy.
#[derive(Default)]
struct CodeRegistry {
    by_address: HashMap<Address, Hash>,
    by_hash: HashMap<Hash, wasmtime::Module>,
}

/// State shared between the engine facade and the host callbacks that
/// re-enter it for nested calls.
pub struct EngineShared {
    pub(crate) runtime: KilnRuntime,
    pub(crate) ctx: Arc<Context>,
    code: RwLock<CodeRegistry>,
}

impl EngineShared {
    fn code_read(&self) -> Result<std::sync::RwLockReadGuard<'_, CodeRegistry>, VmError> {
        self.code.read().map_err(|e| VmError::Runtime {
            reason: e.to_string(),
        })
    }
}

/// What an invocation produced: the value the contract returned and the gas
/// the whole call tree consumed.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionOutcome {
    pub data: Value,
    pub gas_used: u64,
}

/// The contract execution engine.
///
/// Owns the Wasm runtime, the deployed-code registry, and a handle to the
/// ledger. Deployment instruments and compiles bytecode once; execution
/// stages all writes against the ledger and commits them only when the
/// invocation completes successfully.
pub struct ContractEngine {
    shared: Arc<EngineShared>,
}

impl ContractEngine {
    pub fn new(ctx: Arc<Context>) -> Result<Self, VmError> {
        Ok(Self {
            shared: Arc::new(EngineShared {
                runtime: KilnRuntime::new()?,
                ctx,
                code: RwLock::new(CodeRegistry::default()),
            }),
        })
    }

    pub fn ctx(&self) -> &Arc<Context> {
        &self.shared.ctx
    }

    /// The bytecode hash of a deployed contract, if any.
    pub fn code_hash(&self, contract: &Address) -> Result<Option<Hash>, VmError> {
        Ok(self.shared.code_read()?.by_address.get(contract).copied())
    }

    /// Deploy contract bytecode. The address is derived from the code and
    /// the sender, so the same pair always lands at the same address; a
    /// second deployment there is rejected. The module is instrumented,
    /// compiled, and registered, and the contract's default object is
    /// created with the contract itself as owner.
    pub fn deploy(&self, bytecode: &[u8], sender: &Address) -> Result<Address, VmError> {
        if bytecode.is_empty() {
            return Err(VmError::Validation {
                reason: "empty bytecode".to_string(),
            });
        }
        let address = contract_address(bytecode, sender);
        let code_hash = blake3_hash(bytecode);

        // Reuse the compiled module when this exact code is already stored.
        let existing = {
            let code = self.shared.code_read()?;
            if code.by_address.contains_key(&address) {
                return Err(VmError::Validation {
                    reason: format!("contract already deployed at {address:02x?}"),
                });
            }
            code.by_hash.get(&code_hash).cloned()
        };
        let module = match existing {
            Some(module) => module,
            None => {
                let instrumented = instrument(bytecode)?;
                let module = self.shared.runtime.compile(&instrumented)?;
                tracing::debug!(state = ?InvocationState::Compiled, "bytecode compiled");
                module
            }
        };

        let mut staged = self.shared.ctx.begin()?;
        staged.create_object_with_id(&address, &object_id_for_address(&address))?;
        staged.commit()?;

        let mut code = self.shared.code.write().map_err(|e| VmError::Runtime {
            reason: e.to_string(),
        })?;
        code.by_hash.entry(code_hash).or_insert(module);
        code.by_address.insert(address, code_hash);
        tracing::info!(contract = ?address, "contract deployed");
        Ok(address)
    }

    /// Invoke `function` on a deployed contract.
    ///
    /// All state mutations of the invocation, including those of nested
    /// calls, are staged and committed atomically on success. A trap, gas
    /// exhaustion, or a `success = false` response discards the whole
    /// overlay.
    pub fn execute(
        &self,
        contract: &Address,
        function: &str,
        args: &[u8],
        sender: &Address,
        gas_limit: u64,
    ) -> Result<ExecutionOutcome, VmError> {
        tracing::debug!(state = ?InvocationState::Idle, contract = ?contract, function, "invocation started");

        let block = self.shared.ctx.current_block()?;
        let tx = self.shared.ctx.current_transaction()?;
        let env = ExecEnv {
            sender: *sender,
            block_height: block.as_ref().map(|b| b.height).unwrap_or(0),
            block_time: block.as_ref().map(|b| b.time).unwrap_or(0),
            tx_hash: tx.as_ref().map(|t| t.hash).unwrap_or(ZERO_HASH),
        };

        let staged = self.shared.ctx.begin()?;
        let session = Arc::new(Session::new(env, gas_limit, staged));

        let result = invoke_in_session(&self.shared, &session, contract, function, args);
        let gas_used = session.gas_used();

        match result {
            Ok(response) if response.success => {
                tracing::debug!(state = ?InvocationState::Completed, gas_used, "invocation completed");
                session.into_staged()?.commit()?;
                tracing::debug!(state = ?InvocationState::Closed, "effects committed");
                Ok(ExecutionOutcome {
                    data: response.data,
                    gas_used,
                })
            }
            Ok(response) => {
                tracing::debug!(state = ?InvocationState::Completed, gas_used, error = %response.error, "contract reported failure");
                Err(VmError::Contract {
                    message: response.error,
                })
            }
            Err(err @ VmError::OutOfGas { .. }) => {
                tracing::debug!(state = ?InvocationState::GasExhausted, gas_used, "invocation ran out of gas");
                Err(err)
            }
            Err(err) => {
                tracing::debug!(state = ?InvocationState::Trapped, gas_used, %err, "invocation trapped");
                Err(err)
            }
        }
    }

    /// Invoke with the default gas limit.
    pub fn execute_default(
        &self,
        contract: &Address,
        function: &str,
        args: &[u8],
        sender: &Address,
    ) -> Result<ExecutionOutcome, VmError> {
        self.execute(contract, function, args, sender, DEFAULT_GAS_LIMIT)
    }
}

/// Run one guest call inside an existing session. Used for the top-level
/// invocation and re-entered by the host for nested contract calls; the
/// session carries the shared gas meter, call stack and staging overlay.
pub(crate) fn invoke_in_session(
    shared: &Arc<EngineShared>,
    session: &Arc<Session>,
    contract: &Address,
    function: &str,
    args: &[u8],
) -> Result<CallResponse, VmError> {
    let module = {
        let code = shared.code_read()?;
        match code
            .by_address
            .get(contract)
            .and_then(|hash| code.by_hash.get(hash))
        {
            Some(module) => module.clone(),
            None => return Err(VmError::ContractNotFound { address: *contract }),
        }
    };

    let state = HostState::new(*contract, Arc::clone(session), Arc::clone(shared));
    let mut instance = shared.runtime.instantiate(&module, state)?;
    tracing::debug!(state = ?InvocationState::Instantiated, contract = ?contract, "instance ready");
    instance.setup_buffer()?;
    tracing::debug!(state = ?InvocationState::Running, function, "entering guest");
    instance.invoke(&CallRequest {
        contract: *contract,
        sender: session.env.sender,
        function: function.to_string(),
        args: args.to_vec(),
        gas_limit: session.gas_limit()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_ledger::{MemoryLedger, SqliteLedger};
    use kiln_types::ledger::{Block, Transaction};

    /// A counter contract exercising the full ABI: it keeps a u64 `count`
    /// field on its default object, reached through the generic channels.
    const COUNTER_WAT: &str = r#"
        (module
            (import "kiln" "host_call" (func $host_call (param i32 i32 i32) (result i32)))
            (import "kiln" "host_read" (func $host_read (param i32 i32 i32) (result i32)))
            (memory (export "memory") 2)
            (global $heap (mut i32) (i32.const 8192))
            (global $hbuf (mut i32) (i32.const 0))

            ;; Function-name table.
            (data (i32.const 0) "init")
            (data (i32.const 8) "increment")
            (data (i32.const 20) "get")
            (data (i32.const 24) "del")
            ;; Field-args template at 1024: 32-byte object id, then
            ;; key len 5, "count", value len 8, value.
            (data (i32.const 1056) "\05\00\00\00count\08\00\00\00")

            (func (export "allocate") (param $size i32) (result i32)
                (local $ptr i32)
                (local.set $ptr (global.get $heap))
                (global.set $heap
                    (i32.and
                        (i32.add (i32.add (global.get $heap) (local.get $size)) (i32.const 7))
                        (i32.const -8)))
                (local.get $ptr))
            (func (export "deallocate") (param i32))
            (func (export "result_ptr") (result i32) (i32.const 4096))
            (func (export "set_host_buffer") (param $ptr i32)
                (global.set $hbuf (local.get $ptr)))

            (func $streq (param $a i32) (param $b i32) (param $len i32) (result i32)
                (local $i i32)
                (loop $l
                    (if (i32.ge_u (local.get $i) (local.get $len))
                        (then (return (i32.const 1))))
                    (if (i32.ne
                            (i32.load8_u (i32.add (local.get $a) (local.get $i)))
                            (i32.load8_u (i32.add (local.get $b) (local.get $i))))
                        (then (return (i32.const 0))))
                    (local.set $i (i32.add (local.get $i) (i32.const 1)))
                    (br $l))
                (i32.const 0))

            (func $copy (param $dst i32) (param $src i32) (param $len i32)
                (local $i i32)
                (loop $l
                    (if (i32.lt_u (local.get $i) (local.get $len))
                        (then
                            (i32.store8
                                (i32.add (local.get $dst) (local.get $i))
                                (i32.load8_u (i32.add (local.get $src) (local.get $i))))
                            (local.set $i (i32.add (local.get $i) (i32.const 1)))
                            (br $l)))))

            ;; Fetch our own address (func 2) and zero-extend it into the
            ;; default object id at 1024.
            (func $prepare_id
                (if (i32.ne
                        (call $host_read (i32.const 2) (i32.const 0) (i32.const 0))
                        (i32.const 20))
                    (then unreachable))
                (call $copy (i32.const 1024) (global.get $hbuf) (i32.const 20)))

            ;; Read the count field (func 14); a missing field reads as zero.
            (func $read_count (result i64)
                (local $r i32)
                (call $prepare_id)
                (local.set $r
                    (call $host_read (i32.const 14) (i32.const 1024) (i32.const 41)))
                (if (i32.eq (local.get $r) (i32.const -1))
                    (then (return (i64.const 0))))
                (if (i32.lt_s (local.get $r) (i32.const 0))
                    (then unreachable))
                (i64.load (global.get $hbuf)))

            ;; Write the count field (func 15). Assumes $prepare_id ran.
            (func $store_count (param $v i64) (result i64)
                (i64.store (i32.const 1069) (local.get $v))
                (if (i32.ne
                        (call $host_call (i32.const 15) (i32.const 1024) (i32.const 53))
                        (i32.const 0))
                    (then unreachable))
                (local.get $v))

            ;; Leave a success envelope carrying an Int at result_ptr.
            (func $respond_int (param $v i64) (result i32)
                (i32.store8 (i32.const 4096) (i32.const 1))
                (i32.store8 (i32.const 4097) (i32.const 1))
                (i64.store (i32.const 4098) (local.get $v))
                (i32.store (i32.const 4106) (i32.const 0))
                (i32.const 14))

            ;; Request envelope: contract (20), sender (20), function name
            ;; (u32 length + bytes), args (u32 length + bytes), gas limit.
            (func (export "invoke") (param $ptr i32) (param $len i32) (result i32)
                (local $fnlen i32)
                (local $fnptr i32)
                (local $args i32)
                (local.set $fnlen (i32.load (i32.add (local.get $ptr) (i32.const 40))))
                (local.set $fnptr (i32.add (local.get $ptr) (i32.const 44)))
                (local.set $args
                    (i32.add (i32.add (local.get $ptr) (i32.const 48)) (local.get $fnlen)))
                (if (i32.and
                        (i32.eq (local.get $fnlen) (i32.const 4))
                        (call $streq (local.get $fnptr) (i32.const 0) (i32.const 4)))
                    (then
                        (call $prepare_id)
                        (drop (call $store_count (i64.const 0)))
                        (return (call $respond_int (i64.const 0)))))
                (if (i32.and
                        (i32.eq (local.get $fnlen) (i32.const 9))
                        (call $streq (local.get $fnptr) (i32.const 8) (i32.const 9)))
                    (then
                        (return (call $respond_int
                            (call $store_count
                                (i64.add
                                    (call $read_count)
                                    (i64.load (local.get $args))))))))
                (if (i32.and
                        (i32.eq (local.get $fnlen) (i32.const 3))
                        (call $streq (local.get $fnptr) (i32.const 20) (i32.const 3)))
                    (then (return (call $respond_int (call $read_count)))))
                (if (i32.and
                        (i32.eq (local.get $fnlen) (i32.const 3))
                        (call $streq (local.get $fnptr) (i32.const 24) (i32.const 3)))
                    (then
                        (call $prepare_id)
                        (if (i32.ne
                                (call $host_call
                                    (i32.const 11) (i32.const 1024) (i32.const 32))
                                (i32.const 0))
                            (then unreachable))
                        (return (call $respond_int (i64.const 0)))))
                unreachable)
        )
    "#;

    /// Forwards `forward(target, delta)` to `target.increment(delta)` via a
    /// nested contract call and relays the callee's envelope verbatim.
    const FORWARDER_WAT: &str = r#"
        (module
            (import "kiln" "host_read" (func $host_read (param i32 i32 i32) (result i32)))
            (memory (export "memory") 2)
            (global $heap (mut i32) (i32.const 8192))
            (global $hbuf (mut i32) (i32.const 0))

            (data (i32.const 0) "forward")
            (data (i32.const 8) "increment")

            (func (export "allocate") (param $size i32) (result i32)
                (local $ptr i32)
                (local.set $ptr (global.get $heap))
                (global.set $heap
                    (i32.and
                        (i32.add (i32.add (global.get $heap) (local.get $size)) (i32.const 7))
                        (i32.const -8)))
                (local.get $ptr))
            (func (export "deallocate") (param i32))
            (func (export "result_ptr") (result i32) (i32.const 4096))
            (func (export "set_host_buffer") (param $ptr i32)
                (global.set $hbuf (local.get $ptr)))

            (func $copy (param $dst i32) (param $src i32) (param $len i32)
                (local $i i32)
                (loop $l
                    (if (i32.lt_u (local.get $i) (local.get $len))
                        (then
                            (i32.store8
                                (i32.add (local.get $dst) (local.get $i))
                                (i32.load8_u (i32.add (local.get $src) (local.get $i))))
                            (local.set $i (i32.add (local.get $i) (i32.const 1)))
                            (br $l)))))

            (func (export "invoke") (param $ptr i32) (param $len i32) (result i32)
                (local $args i32)
                (local $r i32)
                (if (i32.ne
                        (i32.load (i32.add (local.get $ptr) (i32.const 40)))
                        (i32.const 7))
                    (then unreachable))
                ;; args: 20-byte target address then an 8-byte delta,
                ;; past the envelope's contract/sender/name prefix.
                (local.set $args (i32.add (local.get $ptr) (i32.const 55)))
                ;; Build ContractCallArgs at 2048:
                ;; target, "increment", and the delta as raw call args.
                (call $copy (i32.const 2048) (local.get $args) (i32.const 20))
                (i32.store (i32.const 2068) (i32.const 9))
                (call $copy (i32.const 2072) (i32.const 8) (i32.const 9))
                (i32.store (i32.const 2081) (i32.const 8))
                (call $copy
                    (i32.const 2085)
                    (i32.add (local.get $args) (i32.const 20))
                    (i32.const 8))
                (local.set $r
                    (call $host_read (i32.const 17) (i32.const 2048) (i32.const 45)))
                (if (i32.lt_s (local.get $r) (i32.const 0))
                    (then unreachable))
                ;; Relay the callee's envelope.
                (call $copy (i32.const 4096) (global.get $hbuf) (local.get $r))
                (local.get $r))
        )
    "#;

    fn engines() -> Vec<ContractEngine> {
        vec![
            ContractEngine::new(Arc::new(Context::new(Box::new(MemoryLedger::new())))).unwrap(),
            ContractEngine::new(Arc::new(Context::new(Box::new(
                SqliteLedger::open(":memory:").unwrap(),
            ))))
            .unwrap(),
        ]
    }

    fn open_frame(ctx: &Arc<Context>) {
        ctx.set_block(Block {
            height: 1,
            time: 1_000,
            hash: [7u8; 32],
        })
        .unwrap();
        ctx.set_transaction(Transaction {
            hash: [8u8; 32],
            block_height: 1,
            from: [9u8; 20],
            to: [0u8; 20],
            value: 0,
            data: vec![],
        })
        .unwrap();
    }

    fn counter_wasm() -> Vec<u8> {
        wat::parse_str(COUNTER_WAT).expect("failed to compile WAT")
    }

    #[test]
    fn test_counter_lifecycle() {
        for engine in engines() {
            open_frame(engine.ctx());
            let sender = [9u8; 20];
            let addr = engine.deploy(&counter_wasm(), &sender).unwrap();

            let out = engine.execute_default(&addr, "init", &[], &sender).unwrap();
            assert_eq!(out.data, Value::Int(0));
            assert!(out.gas_used > 0);

            let delta = 2i64.to_le_bytes();
            let out = engine
                .execute_default(&addr, "increment", &delta, &sender)
                .unwrap();
            assert_eq!(out.data, Value::Int(2));
            let out = engine
                .execute_default(&addr, "increment", &delta, &sender)
                .unwrap();
            assert_eq!(out.data, Value::Int(4));

            // A trap discards the invocation but not prior commits.
            assert!(matches!(
                engine.execute_default(&addr, "boom", &[], &sender),
                Err(VmError::Runtime { .. })
            ));
            let out = engine.execute_default(&addr, "get", &[], &sender).unwrap();
            assert_eq!(out.data, Value::Int(4));
        }
    }

    #[test]
    fn test_deploy_creates_default_object() {
        for engine in engines() {
            let sender = [9u8; 20];
            let addr = engine.deploy(&counter_wasm(), &sender).unwrap();
            let record = engine
                .ctx()
                .object_by_id(&object_id_for_address(&addr))
                .unwrap()
                .expect("default object missing");
            assert_eq!(record.owner, addr);
            assert_eq!(record.contract, addr);
            assert_eq!(engine.code_hash(&addr).unwrap(), Some(blake3_hash(&counter_wasm())));
        }
    }

    #[test]
    fn test_delete_refund_capped_on_cheap_invocation() {
        for engine in engines() {
            open_frame(engine.ctx());
            let sender = [9u8; 20];
            let addr = engine.deploy(&counter_wasm(), &sender).unwrap();

            // Deleting as the very first action has used well under the
            // fixed refund; the invocation must still complete.
            let out = engine.execute_default(&addr, "del", &[], &sender).unwrap();
            assert_eq!(out.data, Value::Int(0));
            assert!(engine
                .ctx()
                .object_by_id(&object_id_for_address(&addr))
                .unwrap()
                .is_none());
        }
    }

    #[test]
    fn test_identical_code_shares_one_stored_module() {
        for engine in engines() {
            open_frame(engine.ctx());
            let a = engine.deploy(&counter_wasm(), &[1u8; 20]).unwrap();
            let b = engine.deploy(&counter_wasm(), &[2u8; 20]).unwrap();
            assert_ne!(a, b);

            let code = engine.shared.code_read().unwrap();
            assert_eq!(code.by_address.len(), 2);
            assert_eq!(code.by_hash.len(), 1);
            drop(code);

            // Both addresses execute through the shared copy.
            let sender = [9u8; 20];
            assert_eq!(
                engine.execute_default(&a, "init", &[], &sender).unwrap().data,
                Value::Int(0)
            );
            assert_eq!(
                engine.execute_default(&b, "init", &[], &sender).unwrap().data,
                Value::Int(0)
            );
        }
    }

    #[test]
    fn test_deploy_address_is_deterministic() {
        let mut addrs = Vec::new();
        for engine in engines() {
            addrs.push(engine.deploy(&counter_wasm(), &[9u8; 20]).unwrap());
        }
        assert_eq!(addrs[0], addrs[1]);
    }

    #[test]
    fn test_duplicate_deploy_rejected() {
        for engine in engines() {
            let sender = [9u8; 20];
            engine.deploy(&counter_wasm(), &sender).unwrap();
            assert!(matches!(
                engine.deploy(&counter_wasm(), &sender),
                Err(VmError::Validation { .. })
            ));
        }
    }

    #[test]
    fn test_empty_bytecode_rejected() {
        for engine in engines() {
            assert!(matches!(
                engine.deploy(&[], &[9u8; 20]),
                Err(VmError::Validation { .. })
            ));
        }
    }

    #[test]
    fn test_execute_unknown_contract() {
        for engine in engines() {
            assert!(matches!(
                engine.execute_default(&[1u8; 20], "init", &[], &[9u8; 20]),
                Err(VmError::ContractNotFound { .. })
            ));
        }
    }

    #[test]
    fn test_gas_exhaustion_aborts_without_commit() {
        for engine in engines() {
            open_frame(engine.ctx());
            let sender = [9u8; 20];
            let addr = engine.deploy(&counter_wasm(), &sender).unwrap();
            engine.execute_default(&addr, "init", &[], &sender).unwrap();

            let err = engine
                .execute(&addr, "increment", &2i64.to_le_bytes(), &sender, 10)
                .unwrap_err();
            assert!(matches!(err, VmError::OutOfGas { .. }));

            // Nothing of the aborted invocation landed.
            let out = engine.execute_default(&addr, "get", &[], &sender).unwrap();
            assert_eq!(out.data, Value::Int(0));
        }
    }

    #[test]
    fn test_nested_call_commits_with_caller() {
        for engine in engines() {
            open_frame(engine.ctx());
            let sender = [9u8; 20];
            let counter = engine.deploy(&counter_wasm(), &sender).unwrap();
            let forwarder = engine
                .deploy(&wat::parse_str(FORWARDER_WAT).unwrap(), &sender)
                .unwrap();

            engine
                .execute_default(&counter, "init", &[], &sender)
                .unwrap();

            let mut args = Vec::new();
            args.extend_from_slice(&counter);
            args.extend_from_slice(&5i64.to_le_bytes());
            let out = engine
                .execute_default(&forwarder, "forward", &args, &sender)
                .unwrap();
            assert_eq!(out.data, Value::Int(5));

            // The callee's write went through the shared overlay and
            // committed with the caller's invocation.
            let out = engine
                .execute_default(&counter, "get", &[], &sender)
                .unwrap();
            assert_eq!(out.data, Value::Int(5));
        }
    }
}
