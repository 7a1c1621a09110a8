use std::sync::{Arc, Mutex};

use kiln_types::ledger::{Block, Event, ObjectRecord, Transaction};
use kiln_types::primitives::{Address, Amount, Hash, ObjectId};
use kiln_types::value::Value;

use crate::error::LedgerError;
use crate::staging::{StagedEnv, StagedLedger};
use crate::store::{Effect, LedgerStore};

#[derive(Default)]
struct FrameState {
    block: Option<Block>,
    tx: Option<Transaction>,
}

/// Ledger state container: the injected backend plus the current block and
/// transaction frame. One coarse lock guards the backend; invocations stage
/// their writes in a [`StagedLedger`] and commit through [`apply`](Self::apply)
/// in a single lock acquisition, so a committed batch is never interleaved
/// with another writer.
pub struct Context {
    store: Mutex<Box<dyn LedgerStore>>,
    frame: Mutex<FrameState>,
}

impl Context {
    /// Wrap a backend. The backend is chosen by the caller; nothing here
    /// knows or cares which one it is.
    pub fn new(store: Box<dyn LedgerStore>) -> Self {
        Self {
            store: Mutex::new(store),
            frame: Mutex::new(FrameState::default()),
        }
    }

    fn with_store<R>(
        &self,
        f: impl FnOnce(&mut dyn LedgerStore) -> Result<R, LedgerError>,
    ) -> Result<R, LedgerError> {
        let mut store = self.store.lock().map_err(|e| LedgerError::Storage {
            reason: e.to_string(),
        })?;
        f(store.as_mut())
    }

    // ─── Frame management ───────────────────────────────────────────────────

    /// Open a new block. Heights must strictly increase.
    pub fn set_block(&self, block: Block) -> Result<(), LedgerError> {
        let mut frame = self.frame.lock().map_err(|e| LedgerError::Storage {
            reason: e.to_string(),
        })?;
        if let Some(current) = &frame.block {
            if block.height <= current.height {
                return Err(LedgerError::Validation {
                    reason: format!(
                        "block height {} does not advance past {}",
                        block.height, current.height
                    ),
                });
            }
        }
        self.with_store(|store| store.put_block(&block))?;
        tracing::debug!(height = block.height, "block frame opened");
        frame.block = Some(block);
        frame.tx = None;
        Ok(())
    }

    /// Set the current transaction. It must belong to the current block.
    pub fn set_transaction(&self, tx: Transaction) -> Result<(), LedgerError> {
        let mut frame = self.frame.lock().map_err(|e| LedgerError::Storage {
            reason: e.to_string(),
        })?;
        match &frame.block {
            Some(block) if block.height == tx.block_height => {}
            Some(block) => {
                return Err(LedgerError::Validation {
                    reason: format!(
                        "transaction targets block {} but current block is {}",
                        tx.block_height, block.height
                    ),
                });
            }
            None => {
                return Err(LedgerError::Validation {
                    reason: "no current block".to_string(),
                });
            }
        }
        self.with_store(|store| store.put_transaction(&tx))?;
        tracing::debug!(height = tx.block_height, "transaction frame set");
        frame.tx = Some(tx);
        Ok(())
    }

    pub fn current_block(&self) -> Result<Option<Block>, LedgerError> {
        let frame = self.frame.lock().map_err(|e| LedgerError::Storage {
            reason: e.to_string(),
        })?;
        Ok(frame.block)
    }

    pub fn current_transaction(&self) -> Result<Option<Transaction>, LedgerError> {
        let frame = self.frame.lock().map_err(|e| LedgerError::Storage {
            reason: e.to_string(),
        })?;
        Ok(frame.tx.clone())
    }

    // ─── Reads ──────────────────────────────────────────────────────────────

    pub fn balance(&self, address: &Address) -> Result<Amount, LedgerError> {
        self.with_store(|store| store.balance(address))
    }

    pub fn object_by_id(&self, id: &ObjectId) -> Result<Option<ObjectRecord>, LedgerError> {
        self.with_store(|store| store.object_by_id(id))
    }

    pub fn objects_by_owner(
        &self,
        contract: &Address,
        owner: &Address,
    ) -> Result<Vec<ObjectRecord>, LedgerError> {
        self.with_store(|store| store.objects_by_owner(contract, owner))
    }

    pub fn field(&self, id: &ObjectId, key: &str) -> Result<Option<Vec<u8>>, LedgerError> {
        self.with_store(|store| store.field(id, key))
    }

    pub fn block_by_height(&self, height: u64) -> Result<Option<Block>, LedgerError> {
        self.with_store(|store| store.block_by_height(height))
    }

    pub fn transaction_by_hash(&self, hash: &Hash) -> Result<Option<Transaction>, LedgerError> {
        self.with_store(|store| store.transaction_by_hash(hash))
    }

    pub fn events_by_transaction(&self, tx_hash: &Hash) -> Result<Vec<Event>, LedgerError> {
        self.with_store(|store| store.events_by_transaction(tx_hash))
    }

    // ─── Writes ─────────────────────────────────────────────────────────────

    /// Commit a batch of effects atomically.
    pub fn apply(&self, effects: &[Effect]) -> Result<(), LedgerError> {
        self.with_store(|store| store.apply(effects))
    }

    /// Begin a staged overlay for one invocation, capturing the current
    /// frame.
    pub fn begin(self: &Arc<Self>) -> Result<StagedLedger, LedgerError> {
        let frame = self.frame.lock().map_err(|e| LedgerError::Storage {
            reason: e.to_string(),
        })?;
        let env = StagedEnv {
            block: frame.block,
            tx: frame.tx.clone(),
        };
        drop(frame);
        Ok(StagedLedger::new(Arc::clone(self), env))
    }

    // ─── Direct semantic operations ─────────────────────────────────────────
    //
    // Thin begin-op-commit wrappers so embedders mutating state outside a
    // contract invocation go through the same policy code the engine uses.

    pub fn transfer(
        self: &Arc<Self>,
        from: &Address,
        to: &Address,
        amount: Amount,
    ) -> Result<(), LedgerError> {
        let mut staged = self.begin()?;
        staged.transfer(from, to, amount)?;
        staged.commit()
    }

    pub fn create_object(
        self: &Arc<Self>,
        contract: &Address,
        sender: &Address,
    ) -> Result<ObjectRecord, LedgerError> {
        let mut staged = self.begin()?;
        let record = staged.create_object(contract, sender)?;
        staged.commit()?;
        Ok(record)
    }

    pub fn delete_object(
        self: &Arc<Self>,
        contract: &Address,
        sender: &Address,
        id: &ObjectId,
    ) -> Result<(), LedgerError> {
        let mut staged = self.begin()?;
        staged.delete_object(contract, sender, id)?;
        staged.commit()
    }

    pub fn set_owner(
        self: &Arc<Self>,
        contract: &Address,
        sender: &Address,
        id: &ObjectId,
        new_owner: &Address,
    ) -> Result<(), LedgerError> {
        let mut staged = self.begin()?;
        staged.set_owner(contract, sender, id, new_owner)?;
        staged.commit()
    }

    pub fn set_field(
        self: &Arc<Self>,
        contract: &Address,
        sender: &Address,
        id: &ObjectId,
        key: &str,
        value: &[u8],
    ) -> Result<(), LedgerError> {
        let mut staged = self.begin()?;
        staged.set_field(contract, sender, id, key, value)?;
        staged.commit()
    }

    pub fn log(
        self: &Arc<Self>,
        contract: &Address,
        name: &str,
        attributes: &[(String, Value)],
    ) -> Result<(), LedgerError> {
        let mut staged = self.begin()?;
        staged.log(contract, name, attributes)?;
        staged.commit()
    }
}
