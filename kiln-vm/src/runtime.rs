use wasmtime::{Caller, Config, Engine, Instance, Linker, Memory, Module, Store};

use crate::error::VmError;
use crate::gas::GAS_OBJECT_READ;
use crate::host::{handle_call, handle_read, HostReply, HostState};
use crate::instrument::{IMPORT_CONSUME_GAS, IMPORT_CTX_ENTER, IMPORT_CTX_EXIT};
use crate::protocol::*;

/// The Wasm runtime for kiln contracts.
///
/// Wraps a wasmtime `Engine`. Gas accounting does not use engine fuel: the
/// charges injected by the instrumentation pass and the host-side cost
/// schedule share one meter, and fuel would count the same work twice.
pub struct KilnRuntime {
    engine: Engine,
}

/// A live contract instance bound to an execution session.
///
/// Owns the wasmtime `Store` (which holds the `HostState`) and the
/// instantiated module.
pub struct KilnInstance {
    store: Store<HostState>,
    instance: Instance,
}

/// Recover a typed error from a wasmtime trap; anything else is a plain
/// runtime fault.
pub(crate) fn map_trap(err: wasmtime::Error) -> VmError {
    match err.downcast::<VmError>() {
        Ok(vm) => vm,
        Err(err) => VmError::Runtime {
            reason: format!("wasm trap: {err}"),
        },
    }
}

fn caller_memory(caller: &mut Caller<'_, HostState>) -> Result<Memory, wasmtime::Error> {
    caller
        .get_export(EXPORT_MEMORY)
        .and_then(|e| e.into_memory())
        .ok_or_else(|| wasmtime::Error::msg("missing memory export"))
}

/// Copy guest bytes out of linear memory. Out-of-range requests are the
/// guest's error, reported through the sentinel channel rather than a trap.
fn read_guest_bytes(
    caller: &mut Caller<'_, HostState>,
    memory: &Memory,
    ptr: i32,
    len: i32,
) -> Result<Vec<u8>, i32> {
    if ptr < 0 || len < 0 {
        return Err(ERR_PROTOCOL);
    }
    let start = ptr as usize;
    let end = start + len as usize;
    let data = memory.data(caller);
    if end > data.len() {
        return Err(ERR_PROTOCOL);
    }
    Ok(data[start..end].to_vec())
}

impl KilnRuntime {
    pub fn new() -> Result<Self, VmError> {
        let config = Config::new();
        let engine = Engine::new(&config).map_err(|e| VmError::Runtime {
            reason: format!("failed to create wasmtime engine: {e}"),
        })?;
        Ok(Self { engine })
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Compile instrumented bytecode. Done once per deployment.
    pub fn compile(&self, bytecode: &[u8]) -> Result<Module, VmError> {
        Module::new(&self.engine, bytecode).map_err(|e| VmError::Validation {
            reason: format!("failed to compile wasm module: {e}"),
        })
    }

    /// Instantiate a compiled module with the given host state and link the
    /// host imports in the `kiln` namespace.
    pub fn instantiate(
        &self,
        module: &Module,
        host_state: HostState,
    ) -> Result<KilnInstance, VmError> {
        let mut store = Store::new(&self.engine, host_state);
        store.limiter(|state| &mut state.store_limits);

        let mut linker: Linker<HostState> = Linker::new(&self.engine);
        let register = |err: wasmtime::Error, name: &str| VmError::Runtime {
            reason: format!("failed to register {name}: {err}"),
        };

        // ── Host function: host_call ─────────────────────────────────────
        linker
            .func_wrap(
                HOST_MODULE,
                "host_call",
                |mut caller: Caller<'_, HostState>,
                 func_id: i32,
                 args_ptr: i32,
                 args_len: i32|
                 -> Result<i32, wasmtime::Error> {
                    let memory = caller_memory(&mut caller)?;
                    let args = match read_guest_bytes(&mut caller, &memory, args_ptr, args_len) {
                        Ok(bytes) => bytes,
                        Err(status) => return Ok(status),
                    };
                    match handle_call(caller.data_mut(), func_id, &args)
                        .map_err(wasmtime::Error::new)?
                    {
                        HostReply::Status(status) => Ok(status),
                        HostReply::Data(_) => Ok(ERR_UNKNOWN_FUNCTION),
                    }
                },
            )
            .map_err(|e| register(e, "host_call"))?;

        // ── Host function: host_read ─────────────────────────────────────
        linker
            .func_wrap(
                HOST_MODULE,
                "host_read",
                |mut caller: Caller<'_, HostState>,
                 func_id: i32,
                 args_ptr: i32,
                 args_len: i32|
                 -> Result<i32, wasmtime::Error> {
                    let memory = caller_memory(&mut caller)?;
                    let args = match read_guest_bytes(&mut caller, &memory, args_ptr, args_len) {
                        Ok(bytes) => bytes,
                        Err(status) => return Ok(status),
                    };
                    let data = match handle_read(caller.data_mut(), func_id, &args)
                        .map_err(wasmtime::Error::new)?
                    {
                        HostReply::Status(status) => return Ok(status),
                        HostReply::Data(data) => data,
                    };
                    // An unregistered buffer means the instance never
                    // finished its ABI handshake; that is fatal.
                    let buffer_ptr = caller.data().host_buffer.ok_or_else(|| {
                        wasmtime::Error::new(VmError::Protocol {
                            reason: "no host buffer registered".to_string(),
                        })
                    })? as usize;
                    let end = buffer_ptr + data.len();
                    let mem = memory.data_mut(&mut caller);
                    if end > mem.len() {
                        return Err(wasmtime::Error::new(VmError::Protocol {
                            reason: "host buffer out of bounds".to_string(),
                        }));
                    }
                    mem[buffer_ptr..end].copy_from_slice(&data);
                    Ok(data.len() as i32)
                },
            )
            .map_err(|e| register(e, "host_read"))?;

        // ── Host function: block_height ──────────────────────────────────
        linker
            .func_wrap(HOST_MODULE, "block_height", |caller: Caller<'_, HostState>| -> i64 {
                caller.data().session.env.block_height as i64
            })
            .map_err(|e| register(e, "block_height"))?;

        // ── Host function: block_time ────────────────────────────────────
        linker
            .func_wrap(HOST_MODULE, "block_time", |caller: Caller<'_, HostState>| -> i64 {
                caller.data().session.env.block_time as i64
            })
            .map_err(|e| register(e, "block_time"))?;

        // ── Host function: balance_of ────────────────────────────────────
        linker
            .func_wrap(
                HOST_MODULE,
                "balance_of",
                |mut caller: Caller<'_, HostState>, addr_ptr: i32| -> Result<i64, wasmtime::Error> {
                    let memory = caller_memory(&mut caller)?;
                    let bytes = read_guest_bytes(&mut caller, &memory, addr_ptr, 20).map_err(|_| {
                        wasmtime::Error::new(VmError::Protocol {
                            reason: "address out of bounds".to_string(),
                        })
                    })?;
                    let mut address = [0u8; 20];
                    address.copy_from_slice(&bytes);
                    let session = &caller.data().session;
                    session
                        .consume_gas(GAS_OBJECT_READ)
                        .map_err(wasmtime::Error::new)?;
                    let balance = session
                        .staged()
                        .map_err(wasmtime::Error::new)?
                        .balance(&address)
                        .map_err(|e| wasmtime::Error::new(VmError::Ledger(e)))?;
                    Ok(i64::try_from(balance).unwrap_or(i64::MAX))
                },
            )
            .map_err(|e| register(e, "balance_of"))?;

        // ── Accounting imports injected by instrumentation ───────────────
        linker
            .func_wrap(
                HOST_MODULE,
                IMPORT_CONSUME_GAS,
                |caller: Caller<'_, HostState>, amount: i64| -> Result<(), wasmtime::Error> {
                    if amount <= 0 {
                        return Ok(());
                    }
                    caller
                        .data()
                        .session
                        .consume_gas(amount as u64)
                        .map_err(wasmtime::Error::new)
                },
            )
            .map_err(|e| register(e, IMPORT_CONSUME_GAS))?;

        linker
            .func_wrap(
                HOST_MODULE,
                IMPORT_CTX_ENTER,
                |caller: Caller<'_, HostState>| -> Result<(), wasmtime::Error> {
                    let contract = caller.data().contract;
                    caller
                        .data()
                        .session
                        .enter(contract)
                        .map_err(wasmtime::Error::new)
                },
            )
            .map_err(|e| register(e, IMPORT_CTX_ENTER))?;

        linker
            .func_wrap(
                HOST_MODULE,
                IMPORT_CTX_EXIT,
                |caller: Caller<'_, HostState>| -> Result<(), wasmtime::Error> {
                    let contract = caller.data().contract;
                    caller
                        .data()
                        .session
                        .exit(contract)
                        .map_err(wasmtime::Error::new)
                },
            )
            .map_err(|e| register(e, IMPORT_CTX_EXIT))?;

        let instance = linker
            .instantiate(&mut store, module)
            .map_err(|e| VmError::Runtime {
                reason: format!("failed to instantiate module: {e}"),
            })?;

        Ok(KilnInstance { store, instance })
    }
}

impl KilnInstance {
    fn memory(&mut self) -> Result<Memory, VmError> {
        self.instance
            .get_memory(&mut self.store, EXPORT_MEMORY)
            .ok_or_else(|| VmError::Protocol {
                reason: "missing memory export".to_string(),
            })
    }

    /// Call the guest allocator and write `bytes` at the returned pointer.
    fn write_guest(&mut self, bytes: &[u8]) -> Result<i32, VmError> {
        let allocate = self
            .instance
            .get_typed_func::<i32, i32>(&mut self.store, EXPORT_ALLOCATE)
            .map_err(|e| VmError::Protocol {
                reason: format!("missing allocate export: {e}"),
            })?;
        let ptr = allocate
            .call(&mut self.store, bytes.len() as i32)
            .map_err(map_trap)?;
        let memory = self.memory()?;
        let start = ptr as usize;
        let end = start + bytes.len();
        if ptr <= 0 || end > memory.data_size(&self.store) {
            return Err(VmError::Protocol {
                reason: "allocator returned out-of-bounds pointer".to_string(),
            });
        }
        memory.data_mut(&mut self.store)[start..end].copy_from_slice(bytes);
        Ok(ptr)
    }

    /// Allocate and register the shared host buffer. Part of instance
    /// setup; host reads trap until this has run.
    pub fn setup_buffer(&mut self) -> Result<(), VmError> {
        let allocate = self
            .instance
            .get_typed_func::<i32, i32>(&mut self.store, EXPORT_ALLOCATE)
            .map_err(|e| VmError::Protocol {
                reason: format!("missing allocate export: {e}"),
            })?;
        let ptr = allocate
            .call(&mut self.store, HOST_BUFFER_SIZE as i32)
            .map_err(map_trap)?;
        let memory = self.memory()?;
        if ptr <= 0 || ptr as usize + HOST_BUFFER_SIZE > memory.data_size(&self.store) {
            return Err(VmError::Protocol {
                reason: "allocator returned out-of-bounds host buffer".to_string(),
            });
        }
        self.store.data_mut().host_buffer = Some(ptr as u32);

        let set_buffer = self
            .instance
            .get_typed_func::<i32, ()>(&mut self.store, EXPORT_SET_HOST_BUFFER)
            .map_err(|e| VmError::Protocol {
                reason: format!("missing set_host_buffer export: {e}"),
            })?;
        set_buffer.call(&mut self.store, ptr).map_err(map_trap)
    }

    /// Run the guest entry point and decode the response envelope it leaves
    /// at `result_ptr`.
    pub fn invoke(&mut self, request: &CallRequest) -> Result<CallResponse, VmError> {
        let encoded = borsh::to_vec(request).map_err(|e| VmError::Runtime {
            reason: e.to_string(),
        })?;
        let ptr = self.write_guest(&encoded)?;

        let invoke = self
            .instance
            .get_typed_func::<(i32, i32), i32>(&mut self.store, EXPORT_INVOKE)
            .map_err(|e| VmError::Protocol {
                reason: format!("missing invoke export: {e}"),
            })?;
        let response_len = invoke
            .call(&mut self.store, (ptr, encoded.len() as i32))
            .map_err(map_trap)?;
        if response_len < 0 {
            return Err(VmError::Protocol {
                reason: format!("invoke returned {response_len}"),
            });
        }

        let result_ptr = self
            .instance
            .get_typed_func::<(), i32>(&mut self.store, EXPORT_RESULT_PTR)
            .map_err(|e| VmError::Protocol {
                reason: format!("missing result_ptr export: {e}"),
            })?;
        let response_ptr = result_ptr.call(&mut self.store, ()).map_err(map_trap)?;

        let memory = self.memory()?;
        let start = response_ptr as usize;
        let end = start + response_len as usize;
        let data = memory.data(&self.store);
        if response_ptr < 0 || end > data.len() {
            return Err(VmError::Protocol {
                reason: "response envelope out of bounds".to_string(),
            });
        }
        borsh::from_slice(&data[start..end]).map_err(|e| VmError::Protocol {
            reason: format!("malformed response envelope: {e}"),
        })
    }
}
