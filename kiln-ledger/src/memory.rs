use std::collections::{BTreeMap, HashMap};

use kiln_types::ledger::{Block, Event, ObjectRecord, Transaction};
use kiln_types::primitives::{Address, Amount, Hash, ObjectId};

use crate::error::LedgerError;
use crate::store::LedgerStore;

/// In-memory ledger backend. Objects and fields live in BTreeMaps so that
/// owner scans come out in ascending id order without sorting.
#[derive(Clone)]
pub struct MemoryLedger {
    blocks: HashMap<u64, Block>,
    transactions: HashMap<Hash, Transaction>,
    balances: HashMap<Address, Amount>,
    objects: BTreeMap<ObjectId, ObjectRecord>,
    fields: BTreeMap<(ObjectId, String), Vec<u8>>,
    events: Vec<Event>,
}

impl MemoryLedger {
    /// Create a new empty in-memory ledger.
    pub fn new() -> Self {
        Self {
            blocks: HashMap::new(),
            transactions: HashMap::new(),
            balances: HashMap::new(),
            objects: BTreeMap::new(),
            fields: BTreeMap::new(),
            events: Vec::new(),
        }
    }
}

impl Default for MemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl LedgerStore for MemoryLedger {
    fn put_block(&mut self, block: &Block) -> Result<(), LedgerError> {
        self.blocks.insert(block.height, *block);
        Ok(())
    }

    fn block_by_height(&mut self, height: u64) -> Result<Option<Block>, LedgerError> {
        Ok(self.blocks.get(&height).copied())
    }

    fn put_transaction(&mut self, tx: &Transaction) -> Result<(), LedgerError> {
        self.transactions.insert(tx.hash, tx.clone());
        Ok(())
    }

    fn transaction_by_hash(&mut self, hash: &Hash) -> Result<Option<Transaction>, LedgerError> {
        Ok(self.transactions.get(hash).cloned())
    }

    fn balance(&mut self, address: &Address) -> Result<Amount, LedgerError> {
        Ok(self.balances.get(address).copied().unwrap_or(0))
    }

    fn set_balance(&mut self, address: &Address, amount: Amount) -> Result<(), LedgerError> {
        self.balances.insert(*address, amount);
        Ok(())
    }

    fn insert_object(&mut self, record: &ObjectRecord) -> Result<(), LedgerError> {
        self.objects.insert(record.id, *record);
        Ok(())
    }

    fn object_by_id(&mut self, id: &ObjectId) -> Result<Option<ObjectRecord>, LedgerError> {
        Ok(self.objects.get(id).copied())
    }

    fn objects_by_owner(
        &mut self,
        contract: &Address,
        owner: &Address,
    ) -> Result<Vec<ObjectRecord>, LedgerError> {
        Ok(self
            .objects
            .values()
            .filter(|rec| rec.contract == *contract && rec.owner == *owner)
            .copied()
            .collect())
    }

    fn set_object_owner(&mut self, id: &ObjectId, owner: &Address) -> Result<(), LedgerError> {
        match self.objects.get_mut(id) {
            Some(rec) => {
                rec.owner = *owner;
                Ok(())
            }
            None => Err(LedgerError::NotFound {
                what: format!("object {}", hex_id(id)),
            }),
        }
    }

    fn delete_object(&mut self, id: &ObjectId) -> Result<(), LedgerError> {
        self.objects.remove(id);
        let range_start = (*id, String::new());
        let keys: Vec<(ObjectId, String)> = self
            .fields
            .range(range_start..)
            .take_while(|((obj, _), _)| obj == id)
            .map(|(k, _)| k.clone())
            .collect();
        for key in keys {
            self.fields.remove(&key);
        }
        Ok(())
    }

    fn field(&mut self, id: &ObjectId, key: &str) -> Result<Option<Vec<u8>>, LedgerError> {
        Ok(self.fields.get(&(*id, key.to_string())).cloned())
    }

    fn set_field(&mut self, id: &ObjectId, key: &str, value: &[u8]) -> Result<(), LedgerError> {
        self.fields.insert((*id, key.to_string()), value.to_vec());
        Ok(())
    }

    fn append_event(&mut self, event: &Event) -> Result<(), LedgerError> {
        self.events.push(event.clone());
        Ok(())
    }

    fn events_by_transaction(&mut self, tx_hash: &Hash) -> Result<Vec<Event>, LedgerError> {
        Ok(self
            .events
            .iter()
            .filter(|ev| ev.tx_hash == *tx_hash)
            .cloned()
            .collect())
    }

    fn apply(&mut self, effects: &[crate::store::Effect]) -> Result<(), LedgerError> {
        // Replay onto a scratch copy and swap, so a rejected delta midway
        // through the batch leaves the ledger untouched.
        let mut staged = self.clone();
        for effect in effects {
            staged.apply_effect(effect)?;
        }
        *self = staged;
        Ok(())
    }
}

fn hex_id(id: &ObjectId) -> String {
    id.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_balance_defaults_to_zero() {
        let mut store = MemoryLedger::new();
        assert_eq!(store.balance(&[1u8; 20]).unwrap(), 0);
    }

    #[test]
    fn test_object_crud() {
        let mut store = MemoryLedger::new();
        let rec = ObjectRecord {
            id: [1u8; 32],
            owner: [2u8; 20],
            contract: [3u8; 20],
        };
        store.insert_object(&rec).unwrap();
        assert_eq!(store.object_by_id(&rec.id).unwrap(), Some(rec));

        store.set_object_owner(&rec.id, &[9u8; 20]).unwrap();
        assert_eq!(store.object_by_id(&rec.id).unwrap().unwrap().owner, [9u8; 20]);

        store.delete_object(&rec.id).unwrap();
        assert_eq!(store.object_by_id(&rec.id).unwrap(), None);
    }

    #[test]
    fn test_delete_cascades_fields() {
        let mut store = MemoryLedger::new();
        let id = [1u8; 32];
        store
            .insert_object(&ObjectRecord {
                id,
                owner: [2u8; 20],
                contract: [3u8; 20],
            })
            .unwrap();
        store.set_field(&id, "a", b"1").unwrap();
        store.set_field(&id, "b", b"2").unwrap();

        // Field on a different object survives the cascade.
        let other = [2u8; 32];
        store
            .insert_object(&ObjectRecord {
                id: other,
                owner: [2u8; 20],
                contract: [3u8; 20],
            })
            .unwrap();
        store.set_field(&other, "a", b"3").unwrap();

        store.delete_object(&id).unwrap();
        assert_eq!(store.field(&id, "a").unwrap(), None);
        assert_eq!(store.field(&id, "b").unwrap(), None);
        assert_eq!(store.field(&other, "a").unwrap(), Some(b"3".to_vec()));
    }

    #[test]
    fn test_objects_by_owner_ascending_order() {
        let mut store = MemoryLedger::new();
        let contract = [3u8; 20];
        let owner = [2u8; 20];
        for byte in [5u8, 1, 9] {
            store
                .insert_object(&ObjectRecord {
                    id: [byte; 32],
                    owner,
                    contract,
                })
                .unwrap();
        }
        let found = store.objects_by_owner(&contract, &owner).unwrap();
        assert_eq!(found.len(), 3);
        assert_eq!(found[0].id, [1u8; 32]);
        assert_eq!(found[1].id, [5u8; 32]);
        assert_eq!(found[2].id, [9u8; 32]);
    }

    #[test]
    fn test_apply_rejected_delta_leaves_batch_unapplied() {
        use crate::store::Effect;

        let mut store = MemoryLedger::new();
        store.set_balance(&[1u8; 20], 50).unwrap();
        let err = store
            .apply(&[
                Effect::Credit {
                    address: [2u8; 20],
                    amount: 10,
                },
                Effect::Debit {
                    address: [1u8; 20],
                    amount: 60,
                },
            ])
            .unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientBalance { .. }));
        // The credit before the failing debit did not land either.
        assert_eq!(store.balance(&[2u8; 20]).unwrap(), 0);
        assert_eq!(store.balance(&[1u8; 20]).unwrap(), 50);
    }

    #[test]
    fn test_set_owner_missing_object() {
        let mut store = MemoryLedger::new();
        assert!(matches!(
            store.set_object_owner(&[1u8; 32], &[2u8; 20]),
            Err(LedgerError::NotFound { .. })
        ));
    }
}
