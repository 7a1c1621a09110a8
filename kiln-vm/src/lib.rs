//! WebAssembly smart contract execution engine for Kiln.
//!
//! Provides bytecode instrumentation for gas metering and call-context
//! tracking, a Wasmtime-based runtime with host functions, and an execution
//! engine that stages all ledger writes and commits them atomically.

pub mod call_stack;
pub mod engine;
pub mod error;
pub mod gas;
pub mod host;
pub mod instrument;
pub mod protocol;
pub mod runtime;

pub use engine::{ContractEngine, ExecutionOutcome};
pub use error::VmError;
pub use gas::{GasMeter, DEFAULT_GAS_LIMIT, MAX_CALL_DEPTH};
pub use protocol::{CallRequest, CallResponse};
