use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use kiln_types::ledger::{Block, Event, ObjectRecord, Transaction};
use kiln_types::primitives::{Address, Amount, Hash, ObjectId, ZERO_HASH};
use kiln_types::value::Value;

use kiln_crypto::address::object_id;

use crate::context::Context;
use crate::error::LedgerError;
use crate::store::Effect;

/// Frame data captured when staging begins. Object-id derivation and event
/// emission read from this snapshot, so a block rollover mid-invocation
/// cannot change what an invocation observes.
#[derive(Debug, Clone)]
pub struct StagedEnv {
    pub block: Option<Block>,
    pub tx: Option<Transaction>,
}

impl StagedEnv {
    pub fn tx_hash(&self) -> Hash {
        self.tx.as_ref().map(|tx| tx.hash).unwrap_or(ZERO_HASH)
    }
}

/// Rollback point for a staged ledger, taken before a nested call so the
/// callee's writes can be discarded without touching the caller's.
pub struct StagedSnapshot {
    balances: HashMap<Address, Amount>,
    objects: BTreeMap<ObjectId, ObjectRecord>,
    deleted: BTreeSet<ObjectId>,
    fields: HashMap<(ObjectId, String), Vec<u8>>,
    journal_len: usize,
    nonce: u64,
}

/// Write overlay for a single invocation. Reads fall through to the
/// underlying [`Context`]; writes land in the overlay and an ordered effect
/// journal. Nothing reaches durable state until [`commit`](Self::commit);
/// dropping the overlay discards every buffered mutation.
///
/// All authorization and balance policy lives here. The `contract` and
/// `sender` parameters are supplied by the caller (the execution engine
/// passes the current call-stack contract and the transaction sender) and
/// never come from untrusted input.
pub struct StagedLedger {
    ctx: Arc<Context>,
    env: StagedEnv,
    balances: HashMap<Address, Amount>,
    objects: BTreeMap<ObjectId, ObjectRecord>,
    deleted: BTreeSet<ObjectId>,
    fields: HashMap<(ObjectId, String), Vec<u8>>,
    journal: Vec<Effect>,
    nonce: u64,
}

impl StagedLedger {
    pub(crate) fn new(ctx: Arc<Context>, env: StagedEnv) -> Self {
        Self {
            ctx,
            env,
            balances: HashMap::new(),
            objects: BTreeMap::new(),
            deleted: BTreeSet::new(),
            fields: HashMap::new(),
            journal: Vec::new(),
            nonce: 0,
        }
    }

    pub fn env(&self) -> &StagedEnv {
        &self.env
    }

    // ─── Reads (overlay first, then base) ───────────────────────────────────

    pub fn balance(&self, address: &Address) -> Result<Amount, LedgerError> {
        match self.balances.get(address) {
            Some(amount) => Ok(*amount),
            None => self.ctx.balance(address),
        }
    }

    pub fn get_object(&self, id: &ObjectId) -> Result<ObjectRecord, LedgerError> {
        self.lookup_object(id)?.ok_or_else(|| LedgerError::NotFound {
            what: "object".to_string(),
        })
    }

    fn lookup_object(&self, id: &ObjectId) -> Result<Option<ObjectRecord>, LedgerError> {
        if let Some(rec) = self.objects.get(id) {
            return Ok(Some(*rec));
        }
        if self.deleted.contains(id) {
            return Ok(None);
        }
        self.ctx.object_by_id(id)
    }

    /// The lowest-id object of `contract` held by `owner`, merging overlay
    /// and base state. The id order makes the result deterministic when the
    /// owner holds several.
    pub fn get_object_by_owner(
        &self,
        contract: &Address,
        owner: &Address,
    ) -> Result<ObjectRecord, LedgerError> {
        let mut best: Option<ObjectRecord> = None;
        for rec in self.ctx.objects_by_owner(contract, owner)? {
            // Overlay state overrides the base row for the same id.
            if self.deleted.contains(&rec.id) || self.objects.contains_key(&rec.id) {
                continue;
            }
            best = Some(rec);
            break;
        }
        for rec in self.objects.values() {
            if rec.contract != *contract || rec.owner != *owner {
                continue;
            }
            match best {
                Some(b) if b.id <= rec.id => {}
                _ => best = Some(*rec),
            }
        }
        best.ok_or_else(|| LedgerError::NotFound {
            what: "object with owner".to_string(),
        })
    }

    /// Field reads follow the same authorization rule as writes: only the
    /// owner or the owning contract sees an object's fields.
    pub fn get_field(
        &self,
        contract: &Address,
        sender: &Address,
        id: &ObjectId,
        key: &str,
    ) -> Result<Vec<u8>, LedgerError> {
        self.authorized(contract, sender, id)?;
        if let Some(value) = self.fields.get(&(*id, key.to_string())) {
            return Ok(value.clone());
        }
        if self.deleted.contains(id) {
            // Recreated id: base fields of the deleted incarnation are gone.
            return Err(LedgerError::NotFound {
                what: format!("field {key}"),
            });
        }
        self.ctx
            .field(id, key)?
            .ok_or_else(|| LedgerError::NotFound {
                what: format!("field {key}"),
            })
    }

    // ─── Mutations ──────────────────────────────────────────────────────────

    /// Move `amount` from one account to another. All or nothing: an
    /// insufficient balance leaves both accounts untouched.
    pub fn transfer(
        &mut self,
        from: &Address,
        to: &Address,
        amount: Amount,
    ) -> Result<(), LedgerError> {
        let from_balance = self.balance(from)?;
        if from_balance < amount {
            return Err(LedgerError::InsufficientBalance {
                have: from_balance,
                need: amount,
            });
        }
        if from == to || amount == 0 {
            return Ok(());
        }
        let to_balance = self.balance(to)?;
        let new_from = from_balance - amount;
        let new_to = to_balance.checked_add(amount).ok_or_else(|| {
            LedgerError::Validation {
                reason: "balance overflow".to_string(),
            }
        })?;
        self.balances.insert(*from, new_from);
        self.balances.insert(*to, new_to);
        // Journal deltas, not the absolute balances read here: the base may
        // move under a concurrent overlay, and `apply` re-validates deltas
        // against the then-current balance under the store lock.
        self.journal.push(Effect::Debit {
            address: *from,
            amount,
        });
        self.journal.push(Effect::Credit {
            address: *to,
            amount,
        });
        Ok(())
    }

    /// Create a fresh object owned by the creating contract. The id is
    /// derived from the contract, sender, transaction hash, and a counter,
    /// so repeated creation within one invocation yields distinct ids.
    pub fn create_object(
        &mut self,
        contract: &Address,
        sender: &Address,
    ) -> Result<ObjectRecord, LedgerError> {
        let id = object_id(contract, sender, &self.env.tx_hash(), self.nonce);
        self.nonce += 1;
        self.create_object_with_id(contract, &id)
    }

    /// Create an object with a caller-supplied id (used to alias a
    /// contract's address as its default object). The id must be unused.
    pub fn create_object_with_id(
        &mut self,
        contract: &Address,
        id: &ObjectId,
    ) -> Result<ObjectRecord, LedgerError> {
        if self.lookup_object(id)?.is_some() {
            return Err(LedgerError::Validation {
                reason: "object already exists".to_string(),
            });
        }
        let record = ObjectRecord {
            id: *id,
            owner: *contract,
            contract: *contract,
        };
        self.objects.insert(*id, record);
        self.journal.push(Effect::InsertObject { record });
        Ok(record)
    }

    pub fn set_owner(
        &mut self,
        contract: &Address,
        sender: &Address,
        id: &ObjectId,
        new_owner: &Address,
    ) -> Result<(), LedgerError> {
        let mut record = self.authorized(contract, sender, id)?;
        record.owner = *new_owner;
        self.objects.insert(*id, record);
        self.journal.push(Effect::SetObjectOwner {
            id: *id,
            owner: *new_owner,
        });
        Ok(())
    }

    pub fn delete_object(
        &mut self,
        contract: &Address,
        sender: &Address,
        id: &ObjectId,
    ) -> Result<(), LedgerError> {
        self.authorized(contract, sender, id)?;
        self.objects.remove(id);
        self.deleted.insert(*id);
        self.fields.retain(|(obj, _), _| obj != id);
        self.journal.push(Effect::DeleteObject { id: *id });
        Ok(())
    }

    pub fn set_field(
        &mut self,
        contract: &Address,
        sender: &Address,
        id: &ObjectId,
        key: &str,
        value: &[u8],
    ) -> Result<(), LedgerError> {
        self.authorized(contract, sender, id)?;
        self.fields.insert((*id, key.to_string()), value.to_vec());
        self.journal.push(Effect::SetField {
            id: *id,
            key: key.to_string(),
            value: value.to_vec(),
        });
        Ok(())
    }

    /// Record an event under the current block and transaction. A silent
    /// no-op when no frame is active, so contracts can log unconditionally.
    pub fn log(
        &mut self,
        contract: &Address,
        name: &str,
        attributes: &[(String, Value)],
    ) -> Result<(), LedgerError> {
        let (block, tx) = match (&self.env.block, &self.env.tx) {
            (Some(block), Some(tx)) => (block, tx),
            _ => return Ok(()),
        };
        let payload = borsh::to_vec(&attributes.to_vec()).map_err(|e| LedgerError::Storage {
            reason: e.to_string(),
        })?;
        self.journal.push(Effect::AppendEvent {
            event: Event {
                block_height: block.height,
                tx_hash: tx.hash,
                contract: *contract,
                name: name.to_string(),
                payload,
            },
        });
        Ok(())
    }

    /// An object may only be touched through its owning contract, and only
    /// by its owner or by that contract itself.
    fn authorized(
        &self,
        contract: &Address,
        sender: &Address,
        id: &ObjectId,
    ) -> Result<ObjectRecord, LedgerError> {
        let record = self.get_object(id)?;
        if record.contract != *contract {
            return Err(LedgerError::PermissionDenied {
                reason: "object belongs to another contract".to_string(),
            });
        }
        if record.owner != *sender && record.owner != *contract {
            return Err(LedgerError::PermissionDenied {
                reason: "sender is not the object owner".to_string(),
            });
        }
        Ok(record)
    }

    // ─── Snapshot / commit ──────────────────────────────────────────────────

    pub fn snapshot(&self) -> StagedSnapshot {
        StagedSnapshot {
            balances: self.balances.clone(),
            objects: self.objects.clone(),
            deleted: self.deleted.clone(),
            fields: self.fields.clone(),
            journal_len: self.journal.len(),
            nonce: self.nonce,
        }
    }

    pub fn restore(&mut self, snapshot: StagedSnapshot) {
        self.balances = snapshot.balances;
        self.objects = snapshot.objects;
        self.deleted = snapshot.deleted;
        self.fields = snapshot.fields;
        self.journal.truncate(snapshot.journal_len);
        self.nonce = snapshot.nonce;
    }

    /// Number of buffered effects.
    pub fn journal_len(&self) -> usize {
        self.journal.len()
    }

    /// Apply every buffered effect to the underlying context atomically.
    pub fn commit(self) -> Result<(), LedgerError> {
        self.ctx.apply(&self.journal)
    }
}
