use kiln_types::ledger::{Block, Event, ObjectRecord, Transaction};
use kiln_types::primitives::{Address, Amount, Hash, ObjectId};

use crate::error::LedgerError;

/// A buffered state mutation. Invocations accumulate effects in order and
/// hand the whole batch to [`LedgerStore::apply`] at commit time.
///
/// Balance movements are recorded as `Debit`/`Credit` deltas and validated
/// against the balance current at apply time, so overlays staged from the
/// same base commit without overwriting each other. `SetBalance` is
/// absolute and meant for embedder seeding, not transfers.
#[derive(Debug, Clone)]
pub enum Effect {
    SetBalance { address: Address, amount: Amount },
    Debit { address: Address, amount: Amount },
    Credit { address: Address, amount: Amount },
    InsertObject { record: ObjectRecord },
    SetObjectOwner { id: ObjectId, owner: Address },
    SetField { id: ObjectId, key: String, value: Vec<u8> },
    DeleteObject { id: ObjectId },
    AppendEvent { event: Event },
}

/// Backend storage contract for the ledger. Methods are storage only; all
/// authorization and balance policy lives above the trait, so every backend
/// behaves identically under the shared semantics.
///
/// Callers construct a backend and inject it into
/// [`Context::new`](crate::context::Context::new) as a boxed trait object.
pub trait LedgerStore: Send {
    fn put_block(&mut self, block: &Block) -> Result<(), LedgerError>;
    fn block_by_height(&mut self, height: u64) -> Result<Option<Block>, LedgerError>;

    fn put_transaction(&mut self, tx: &Transaction) -> Result<(), LedgerError>;
    fn transaction_by_hash(&mut self, hash: &Hash) -> Result<Option<Transaction>, LedgerError>;

    /// Balance of an address; addresses without an entry hold zero.
    fn balance(&mut self, address: &Address) -> Result<Amount, LedgerError>;
    fn set_balance(&mut self, address: &Address, amount: Amount) -> Result<(), LedgerError>;

    fn insert_object(&mut self, record: &ObjectRecord) -> Result<(), LedgerError>;
    fn object_by_id(&mut self, id: &ObjectId) -> Result<Option<ObjectRecord>, LedgerError>;
    /// All objects of a contract held by an owner, in ascending id order.
    fn objects_by_owner(
        &mut self,
        contract: &Address,
        owner: &Address,
    ) -> Result<Vec<ObjectRecord>, LedgerError>;
    fn set_object_owner(&mut self, id: &ObjectId, owner: &Address) -> Result<(), LedgerError>;
    /// Remove an object and all of its fields.
    fn delete_object(&mut self, id: &ObjectId) -> Result<(), LedgerError>;

    fn field(&mut self, id: &ObjectId, key: &str) -> Result<Option<Vec<u8>>, LedgerError>;
    fn set_field(&mut self, id: &ObjectId, key: &str, value: &[u8]) -> Result<(), LedgerError>;

    fn append_event(&mut self, event: &Event) -> Result<(), LedgerError>;
    /// Events emitted under a transaction, in append order.
    fn events_by_transaction(&mut self, tx_hash: &Hash) -> Result<Vec<Event>, LedgerError>;

    /// Apply a single effect in terms of the primitive methods. Debits and
    /// credits re-validate against the balance current at apply time.
    fn apply_effect(&mut self, effect: &Effect) -> Result<(), LedgerError> {
        match effect {
            Effect::SetBalance { address, amount } => self.set_balance(address, *amount),
            Effect::Debit { address, amount } => {
                let have = self.balance(address)?;
                let new = have
                    .checked_sub(*amount)
                    .ok_or(LedgerError::InsufficientBalance {
                        have,
                        need: *amount,
                    })?;
                self.set_balance(address, new)
            }
            Effect::Credit { address, amount } => {
                let have = self.balance(address)?;
                let new = have
                    .checked_add(*amount)
                    .ok_or_else(|| LedgerError::Validation {
                        reason: "balance overflow".to_string(),
                    })?;
                self.set_balance(address, new)
            }
            Effect::InsertObject { record } => self.insert_object(record),
            Effect::SetObjectOwner { id, owner } => self.set_object_owner(id, owner),
            Effect::SetField { id, key, value } => self.set_field(id, key, value),
            Effect::DeleteObject { id } => self.delete_object(id),
            Effect::AppendEvent { event } => self.append_event(event),
        }
    }

    /// Apply a batch of effects. The contract is all-or-nothing; both
    /// provided backends override this with a transactional (or
    /// copy-and-swap) version, since the plain replay below stops partway
    /// on a rejected delta.
    fn apply(&mut self, effects: &[Effect]) -> Result<(), LedgerError> {
        for effect in effects {
            self.apply_effect(effect)?;
        }
        Ok(())
    }
}
