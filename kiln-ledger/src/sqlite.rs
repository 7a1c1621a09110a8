use rusqlite::{params, Connection, OptionalExtension};

use kiln_types::ledger::{Block, Event, ObjectRecord, Transaction};
use kiln_types::primitives::{Address, Amount, Hash, ObjectId};

use crate::error::LedgerError;
use crate::store::{Effect, LedgerStore};

/// SQLite-backed ledger. One table per record kind; amounts are stored as
/// signed integers, so values above `i64::MAX` are rejected at the boundary.
///
/// The connection is not internally locked; exclusive access comes from the
/// `&mut self` contract (the owning [`Context`](crate::context::Context)
/// serializes callers behind its store lock).
pub struct SqliteLedger {
    conn: Connection,
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS blocks (
    height INTEGER PRIMARY KEY,
    time INTEGER NOT NULL,
    hash BLOB NOT NULL UNIQUE
);
CREATE TABLE IF NOT EXISTS transactions (
    hash BLOB PRIMARY KEY,
    block_height INTEGER NOT NULL,
    sender BLOB NOT NULL,
    recipient BLOB NOT NULL,
    value INTEGER NOT NULL,
    data BLOB NOT NULL
);
CREATE TABLE IF NOT EXISTS objects (
    id BLOB PRIMARY KEY,
    owner BLOB NOT NULL,
    contract BLOB NOT NULL
);
CREATE TABLE IF NOT EXISTS object_fields (
    object_id BLOB NOT NULL,
    key TEXT NOT NULL,
    value BLOB NOT NULL,
    PRIMARY KEY (object_id, key)
);
CREATE TABLE IF NOT EXISTS balances (
    address BLOB PRIMARY KEY,
    amount INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS events (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    block_height INTEGER NOT NULL,
    tx_hash BLOB NOT NULL,
    contract BLOB NOT NULL,
    name TEXT NOT NULL,
    payload BLOB NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_objects_owner ON objects (contract, owner);
CREATE INDEX IF NOT EXISTS idx_events_tx ON events (tx_hash);
";

impl SqliteLedger {
    /// Open (or create) a ledger database at the given path.
    /// Use `:memory:` for an in-memory database (useful for tests).
    pub fn open(path: &str) -> Result<Self, LedgerError> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    fn balance_in_tx(
        tx: &rusqlite::Transaction<'_>,
        address: &Address,
    ) -> Result<Amount, LedgerError> {
        let amount: Option<i64> = tx
            .query_row(
                "SELECT amount FROM balances WHERE address = ?1",
                params![address.as_slice()],
                |row| row.get(0),
            )
            .optional()?;
        match amount {
            Some(n) => amount_from_sql(n),
            None => Ok(0),
        }
    }

    fn apply_one(tx: &rusqlite::Transaction<'_>, effect: &Effect) -> Result<(), LedgerError> {
        match effect {
            Effect::SetBalance { address, amount } => {
                tx.execute(
                    "INSERT OR REPLACE INTO balances (address, amount) VALUES (?1, ?2)",
                    params![address.as_slice(), amount_to_sql(*amount)?],
                )?;
            }
            Effect::Debit { address, amount } => {
                let have = Self::balance_in_tx(tx, address)?;
                let new = have
                    .checked_sub(*amount)
                    .ok_or(LedgerError::InsufficientBalance {
                        have,
                        need: *amount,
                    })?;
                tx.execute(
                    "INSERT OR REPLACE INTO balances (address, amount) VALUES (?1, ?2)",
                    params![address.as_slice(), amount_to_sql(new)?],
                )?;
            }
            Effect::Credit { address, amount } => {
                let have = Self::balance_in_tx(tx, address)?;
                let new = have.checked_add(*amount).ok_or_else(|| {
                    LedgerError::Validation {
                        reason: "balance overflow".to_string(),
                    }
                })?;
                tx.execute(
                    "INSERT OR REPLACE INTO balances (address, amount) VALUES (?1, ?2)",
                    params![address.as_slice(), amount_to_sql(new)?],
                )?;
            }
            Effect::InsertObject { record } => {
                tx.execute(
                    "INSERT OR REPLACE INTO objects (id, owner, contract) VALUES (?1, ?2, ?3)",
                    params![
                        record.id.as_slice(),
                        record.owner.as_slice(),
                        record.contract.as_slice()
                    ],
                )?;
            }
            Effect::SetObjectOwner { id, owner } => {
                tx.execute(
                    "UPDATE objects SET owner = ?2 WHERE id = ?1",
                    params![id.as_slice(), owner.as_slice()],
                )?;
            }
            Effect::SetField { id, key, value } => {
                tx.execute(
                    "INSERT OR REPLACE INTO object_fields (object_id, key, value) \
                     VALUES (?1, ?2, ?3)",
                    params![id.as_slice(), key, value],
                )?;
            }
            Effect::DeleteObject { id } => {
                tx.execute("DELETE FROM objects WHERE id = ?1", params![id.as_slice()])?;
                tx.execute(
                    "DELETE FROM object_fields WHERE object_id = ?1",
                    params![id.as_slice()],
                )?;
            }
            Effect::AppendEvent { event } => {
                tx.execute(
                    "INSERT INTO events (block_height, tx_hash, contract, name, payload) \
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        event.block_height,
                        event.tx_hash.as_slice(),
                        event.contract.as_slice(),
                        event.name,
                        event.payload
                    ],
                )?;
            }
        }
        Ok(())
    }
}

impl LedgerStore for SqliteLedger {
    fn put_block(&mut self, block: &Block) -> Result<(), LedgerError> {
        self.conn.execute(
            "INSERT OR REPLACE INTO blocks (height, time, hash) VALUES (?1, ?2, ?3)",
            params![block.height, block.time, block.hash.as_slice()],
        )?;
        Ok(())
    }

    fn block_by_height(&mut self, height: u64) -> Result<Option<Block>, LedgerError> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT height, time, hash FROM blocks WHERE height = ?1")?;
        stmt.query_row(params![height], |row| {
            Ok((
                row.get::<_, u64>(0)?,
                row.get::<_, u64>(1)?,
                row.get::<_, Vec<u8>>(2)?,
            ))
        })
        .optional()?
        .map(|(height, time, hash)| {
            Ok(Block {
                height,
                time,
                hash: hash_from_blob(hash)?,
            })
        })
        .transpose()
    }

    fn put_transaction(&mut self, tx: &Transaction) -> Result<(), LedgerError> {
        self.conn.execute(
            "INSERT OR REPLACE INTO transactions (hash, block_height, sender, recipient, value, data) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                tx.hash.as_slice(),
                tx.block_height,
                tx.from.as_slice(),
                tx.to.as_slice(),
                amount_to_sql(tx.value)?,
                tx.data
            ],
        )?;
        Ok(())
    }

    fn transaction_by_hash(&mut self, hash: &Hash) -> Result<Option<Transaction>, LedgerError> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT hash, block_height, sender, recipient, value, data \
             FROM transactions WHERE hash = ?1",
        )?;
        stmt.query_row(params![hash.as_slice()], |row| {
            Ok((
                row.get::<_, Vec<u8>>(0)?,
                row.get::<_, u64>(1)?,
                row.get::<_, Vec<u8>>(2)?,
                row.get::<_, Vec<u8>>(3)?,
                row.get::<_, i64>(4)?,
                row.get::<_, Vec<u8>>(5)?,
            ))
        })
        .optional()?
        .map(|(hash, block_height, sender, recipient, value, data)| {
            Ok(Transaction {
                hash: hash_from_blob(hash)?,
                block_height,
                from: addr_from_blob(sender)?,
                to: addr_from_blob(recipient)?,
                value: amount_from_sql(value)?,
                data,
            })
        })
        .transpose()
    }

    fn balance(&mut self, address: &Address) -> Result<Amount, LedgerError> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT amount FROM balances WHERE address = ?1")?;
        let amount: Option<i64> = stmt
            .query_row(params![address.as_slice()], |row| row.get(0))
            .optional()?;
        match amount {
            Some(n) => amount_from_sql(n),
            None => Ok(0),
        }
    }

    fn set_balance(&mut self, address: &Address, amount: Amount) -> Result<(), LedgerError> {
        self.conn.execute(
            "INSERT OR REPLACE INTO balances (address, amount) VALUES (?1, ?2)",
            params![address.as_slice(), amount_to_sql(amount)?],
        )?;
        Ok(())
    }

    fn insert_object(&mut self, record: &ObjectRecord) -> Result<(), LedgerError> {
        self.conn.execute(
            "INSERT OR REPLACE INTO objects (id, owner, contract) VALUES (?1, ?2, ?3)",
            params![
                record.id.as_slice(),
                record.owner.as_slice(),
                record.contract.as_slice()
            ],
        )?;
        Ok(())
    }

    fn object_by_id(&mut self, id: &ObjectId) -> Result<Option<ObjectRecord>, LedgerError> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT id, owner, contract FROM objects WHERE id = ?1")?;
        stmt.query_row(params![id.as_slice()], |row| {
            Ok((
                row.get::<_, Vec<u8>>(0)?,
                row.get::<_, Vec<u8>>(1)?,
                row.get::<_, Vec<u8>>(2)?,
            ))
        })
        .optional()?
        .map(record_from_blobs)
        .transpose()
    }

    fn objects_by_owner(
        &mut self,
        contract: &Address,
        owner: &Address,
    ) -> Result<Vec<ObjectRecord>, LedgerError> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT id, owner, contract FROM objects \
             WHERE contract = ?1 AND owner = ?2 ORDER BY id",
        )?;
        let mut rows = stmt.query(params![contract.as_slice(), owner.as_slice()])?;
        let mut results = Vec::new();
        while let Some(row) = rows.next()? {
            results.push(record_from_blobs((
                row.get::<_, Vec<u8>>(0)?,
                row.get::<_, Vec<u8>>(1)?,
                row.get::<_, Vec<u8>>(2)?,
            ))?);
        }
        Ok(results)
    }

    fn set_object_owner(&mut self, id: &ObjectId, owner: &Address) -> Result<(), LedgerError> {
        let updated = self.conn.execute(
            "UPDATE objects SET owner = ?2 WHERE id = ?1",
            params![id.as_slice(), owner.as_slice()],
        )?;
        if updated == 0 {
            return Err(LedgerError::NotFound {
                what: "object".to_string(),
            });
        }
        Ok(())
    }

    fn delete_object(&mut self, id: &ObjectId) -> Result<(), LedgerError> {
        let tx = self.conn.unchecked_transaction()?;
        tx.execute("DELETE FROM objects WHERE id = ?1", params![id.as_slice()])?;
        tx.execute(
            "DELETE FROM object_fields WHERE object_id = ?1",
            params![id.as_slice()],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn field(&mut self, id: &ObjectId, key: &str) -> Result<Option<Vec<u8>>, LedgerError> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT value FROM object_fields WHERE object_id = ?1 AND key = ?2")?;
        Ok(stmt
            .query_row(params![id.as_slice(), key], |row| row.get(0))
            .optional()?)
    }

    fn set_field(&mut self, id: &ObjectId, key: &str, value: &[u8]) -> Result<(), LedgerError> {
        self.conn.execute(
            "INSERT OR REPLACE INTO object_fields (object_id, key, value) VALUES (?1, ?2, ?3)",
            params![id.as_slice(), key, value],
        )?;
        Ok(())
    }

    fn append_event(&mut self, event: &Event) -> Result<(), LedgerError> {
        self.conn.execute(
            "INSERT INTO events (block_height, tx_hash, contract, name, payload) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                event.block_height,
                event.tx_hash.as_slice(),
                event.contract.as_slice(),
                event.name,
                event.payload
            ],
        )?;
        Ok(())
    }

    fn events_by_transaction(&mut self, tx_hash: &Hash) -> Result<Vec<Event>, LedgerError> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT block_height, tx_hash, contract, name, payload \
             FROM events WHERE tx_hash = ?1 ORDER BY seq",
        )?;
        let mut rows = stmt.query(params![tx_hash.as_slice()])?;
        let mut results = Vec::new();
        while let Some(row) = rows.next()? {
            results.push(Event {
                block_height: row.get(0)?,
                tx_hash: hash_from_blob(row.get::<_, Vec<u8>>(1)?)?,
                contract: addr_from_blob(row.get::<_, Vec<u8>>(2)?)?,
                name: row.get(3)?,
                payload: row.get(4)?,
            });
        }
        Ok(results)
    }

    fn apply(&mut self, effects: &[Effect]) -> Result<(), LedgerError> {
        let tx = self.conn.unchecked_transaction()?;
        for effect in effects {
            Self::apply_one(&tx, effect)?;
        }
        tx.commit()?;
        Ok(())
    }
}

fn amount_to_sql(amount: Amount) -> Result<i64, LedgerError> {
    i64::try_from(amount).map_err(|_| LedgerError::Storage {
        reason: format!("amount {amount} exceeds storable range"),
    })
}

fn amount_from_sql(value: i64) -> Result<Amount, LedgerError> {
    Amount::try_from(value).map_err(|_| LedgerError::Storage {
        reason: format!("negative amount {value} in database"),
    })
}

fn hash_from_blob(blob: Vec<u8>) -> Result<Hash, LedgerError> {
    blob.try_into().map_err(|_| LedgerError::Storage {
        reason: "expected 32-byte hash".to_string(),
    })
}

fn addr_from_blob(blob: Vec<u8>) -> Result<Address, LedgerError> {
    blob.try_into().map_err(|_| LedgerError::Storage {
        reason: "expected 20-byte address".to_string(),
    })
}

fn record_from_blobs(
    (id, owner, contract): (Vec<u8>, Vec<u8>, Vec<u8>),
) -> Result<ObjectRecord, LedgerError> {
    Ok(ObjectRecord {
        id: hash_from_blob(id)?,
        owner: addr_from_blob(owner)?,
        contract: addr_from_blob(contract)?,
    })
}
