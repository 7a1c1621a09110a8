//! Ledger state for the Kiln contract platform.
//!
//! Provides a [`LedgerStore`](store::LedgerStore) trait with memory and SQLite
//! backends, the [`Context`](context::Context) state container, and
//! [`StagedLedger`](staging::StagedLedger), the per-invocation overlay that
//! buffers mutations and commits them atomically.

pub mod context;
pub mod error;
pub mod memory;
pub mod sqlite;
pub mod staging;
pub mod store;

pub use context::Context;
pub use error::LedgerError;
pub use memory::MemoryLedger;
pub use sqlite::SqliteLedger;
pub use staging::StagedLedger;
pub use store::{Effect, LedgerStore};
