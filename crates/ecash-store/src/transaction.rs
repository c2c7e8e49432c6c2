//! Scoped, atomic transactions over the wallet stores.
//!
//! A transaction declares up front which stores it touches and whether it
//! writes. The body is a plain synchronous closure: it can read and write
//! records but cannot await anything, so no network or crypto call can ever
//! be interleaved with store access. Writes are buffered and applied as one
//! atomic batch when the body returns `Ok`; on `Err` they are dropped.

use std::collections::BTreeMap;
use std::marker::PhantomData;

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::backend::{KvBackend, Table, WriteOp};
use crate::cursor::Cursor;
use crate::error::StoreError;
use crate::memory::MemoryBackend;
use crate::schema::{IndexName, SCHEMA_VERSION, StoreName, StoreRecord, key_parts};

const META_SCHEMA_VERSION: &[u8] = b"schema_version";

pub(crate) type Overlay = BTreeMap<(Table, Vec<u8>), Option<Vec<u8>>>;

pub(crate) fn encode<T: bincode::Encode>(value: &T) -> Result<Vec<u8>, StoreError> {
    bincode::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| StoreError::Encode(e.to_string()))
}

pub(crate) fn decode<T: bincode::Decode<()>>(bytes: &[u8]) -> Result<T, StoreError> {
    let (value, _) = bincode::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| StoreError::Decode(e.to_string()))?;
    Ok(value)
}

/// Marker for read-only transactions.
pub struct ReadOnly;
/// Marker for read-write transactions.
pub struct ReadWrite;

/// Read access to committed data plus the transaction's own pending writes.
#[derive(Clone, Copy)]
pub(crate) struct TxView<'a> {
    backend: &'a dyn KvBackend,
    overlay: &'a Overlay,
}

impl TxView<'_> {
    pub(crate) fn get_raw(&self, table: Table, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        if let Some(pending) = self.overlay.get(&(table, key.to_vec())) {
            return Ok(pending.clone());
        }
        self.backend.get(table, key)
    }

    fn scan_raw(&self, table: Table, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        let mut merged: BTreeMap<Vec<u8>, Vec<u8>> =
            self.backend.scan_prefix(table, prefix)?.into_iter().collect();
        for ((t, k), v) in self.overlay.range((table, prefix.to_vec())..) {
            if *t != table || !k.starts_with(prefix) {
                break;
            }
            match v {
                Some(v) => merged.insert(k.clone(), v.clone()),
                None => merged.remove(k),
            };
        }
        Ok(merged.into_iter().collect())
    }
}

/// An open transaction. `M` is [`ReadOnly`] or [`ReadWrite`].
pub struct Tx<'db, M> {
    backend: &'db dyn KvBackend,
    scope: Vec<StoreName>,
    overlay: Overlay,
    _mode: PhantomData<M>,
}

impl<'db, M> Tx<'db, M> {
    fn new(backend: &'db dyn KvBackend, scope: Vec<StoreName>) -> Self {
        Self { backend, scope, overlay: Overlay::new(), _mode: PhantomData }
    }

    fn check_scope(&self, store: StoreName) -> Result<(), StoreError> {
        if self.scope.binary_search(&store).is_ok() {
            Ok(())
        } else {
            Err(StoreError::NotInScope(store))
        }
    }

    pub(crate) fn view(&self) -> TxView<'_> {
        TxView { backend: self.backend, overlay: &self.overlay }
    }

    pub fn get<R: StoreRecord>(&self, key: &R::Key) -> Result<Option<R>, StoreError> {
        self.check_scope(R::STORE)?;
        self.view()
            .get_raw(Table::Store(R::STORE), &R::encode_key(key))?
            .map(|bytes| decode(&bytes))
            .transpose()
    }

    /// Every record of the store, in primary-key order.
    pub fn iter<R: StoreRecord>(&self) -> Result<Cursor<'_, R>, StoreError> {
        self.check_scope(R::STORE)?;
        let entries = self.view().scan_raw(Table::Store(R::STORE), &[])?;
        Ok(Cursor::values(entries))
    }

    /// Records whose `index` value equals `value`, in primary-key order.
    pub fn index<R: StoreRecord>(&self, index: IndexName, value: &[u8]) -> Result<Cursor<'_, R>, StoreError> {
        self.check_scope(R::STORE)?;
        if index.store() != R::STORE {
            return Err(StoreError::Backend(format!(
                "index {index} does not belong to store {}",
                R::STORE
            )));
        }
        let entries = self.view().scan_raw(Table::Index(index), &key_parts(&[value]))?;
        Ok(Cursor::indexed(self.view(), R::STORE, entries))
    }

    pub fn index_first<R: StoreRecord>(&self, index: IndexName, value: &[u8]) -> Result<Option<R>, StoreError> {
        self.index::<R>(index, value)?.next().transpose()
    }
}

impl Tx<'_, ReadWrite> {
    /// Insert or replace a record, keeping its index entries in sync.
    pub fn put<R: StoreRecord>(&mut self, record: &R) -> Result<(), StoreError> {
        self.check_scope(R::STORE)?;
        let pk = R::encode_key(&record.key());
        self.remove_index_entries::<R>(&pk)?;
        for (index, value) in record.index_keys() {
            self.overlay
                .insert((Table::Index(index), key_parts(&[value.as_slice(), pk.as_slice()])), Some(pk.clone()));
        }
        self.overlay.insert((Table::Store(R::STORE), pk), Some(encode(record)?));
        Ok(())
    }

    /// Insert a record that must not exist yet.
    pub fn add<R: StoreRecord>(&mut self, record: &R) -> Result<(), StoreError> {
        if self.get::<R>(&record.key())?.is_some() {
            return Err(StoreError::KeyExists(R::STORE));
        }
        self.put(record)
    }

    /// Remove a record. Returns whether it existed.
    pub fn delete<R: StoreRecord>(&mut self, key: &R::Key) -> Result<bool, StoreError> {
        self.check_scope(R::STORE)?;
        let pk = R::encode_key(key);
        let existed = self.remove_index_entries::<R>(&pk)?;
        if existed {
            self.overlay.insert((Table::Store(R::STORE), pk), None);
        }
        Ok(existed)
    }

    fn remove_index_entries<R: StoreRecord>(&mut self, pk: &[u8]) -> Result<bool, StoreError> {
        let Some(bytes) = self.view().get_raw(Table::Store(R::STORE), pk)? else {
            return Ok(false);
        };
        let old: R = decode(&bytes)?;
        for (index, value) in old.index_keys() {
            self.overlay.insert((Table::Index(index), key_parts(&[value.as_slice(), pk])), None);
        }
        Ok(true)
    }

    fn into_ops(self) -> Vec<WriteOp> {
        self.overlay
            .into_iter()
            .map(|((table, key), value)| match value {
                Some(value) => WriteOp::Put { table, key, value },
                None => WriteOp::Delete { table, key },
            })
            .collect()
    }
}

/// Wallet database: a backend plus one reader/writer lock per store.
pub struct Database {
    backend: Box<dyn KvBackend>,
    locks: Vec<RwLock<()>>,
}

impl Database {
    /// Wrap a backend, initializing or checking the schema version.
    pub fn open(backend: impl KvBackend + 'static) -> Result<Self, StoreError> {
        match backend.get(Table::Meta, META_SCHEMA_VERSION)? {
            None => backend.write(vec![WriteOp::Put {
                table: Table::Meta,
                key: META_SCHEMA_VERSION.to_vec(),
                value: encode(&SCHEMA_VERSION)?,
            }])?,
            Some(bytes) => {
                let found: u32 = decode(&bytes)?;
                if found != SCHEMA_VERSION {
                    return Err(StoreError::SchemaVersion { found, expected: SCHEMA_VERSION });
                }
            }
        }
        Ok(Self {
            backend: Box::new(backend),
            locks: StoreName::ALL.iter().map(|_| RwLock::new(())).collect(),
        })
    }

    pub fn open_memory() -> Result<Self, StoreError> {
        Self::open(MemoryBackend::new())
    }

    #[cfg(feature = "rocksdb")]
    pub fn open_rocks(path: impl AsRef<std::path::Path>) -> Result<Self, StoreError> {
        Self::open(crate::rocks::RocksBackend::open(path)?)
    }

    fn normalized_scope(scope: &[StoreName]) -> Vec<StoreName> {
        let mut scope = scope.to_vec();
        scope.sort();
        scope.dedup();
        scope
    }

    /// Run `body` with shared access to the stores in `scope`.
    pub fn run_read_only<T, E, F>(&self, scope: &[StoreName], body: F) -> Result<T, E>
    where
        E: From<StoreError>,
        F: FnOnce(&mut Tx<'_, ReadOnly>) -> Result<T, E>,
    {
        let scope = Self::normalized_scope(scope);
        let _guards: Vec<RwLockReadGuard<'_, ()>> =
            scope.iter().map(|s| self.locks[s.ordinal()].read()).collect();
        let mut tx = Tx::new(self.backend.as_ref(), scope);
        body(&mut tx)
    }

    /// Run `body` with exclusive access to the stores in `scope`, committing
    /// its writes atomically if it returns `Ok`.
    pub fn run_read_write<T, E, F>(&self, scope: &[StoreName], body: F) -> Result<T, E>
    where
        E: From<StoreError>,
        F: FnOnce(&mut Tx<'_, ReadWrite>) -> Result<T, E>,
    {
        let scope = Self::normalized_scope(scope);
        let _guards: Vec<RwLockWriteGuard<'_, ()>> =
            scope.iter().map(|s| self.locks[s.ordinal()].write()).collect();
        let mut tx = Tx::new(self.backend.as_ref(), scope);
        let result = body(&mut tx)?;
        let ops = tx.into_ops();
        if !ops.is_empty() {
            tracing::trace!(ops = ops.len(), "committing transaction");
            self.backend.write(ops)?;
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(bincode::Encode, bincode::Decode, Clone, Debug, PartialEq)]
    struct Note {
        id: u32,
        tag: String,
    }

    impl StoreRecord for Note {
        const STORE: StoreName = StoreName::Exchanges;
        type Key = u32;

        fn encode_key(key: &u32) -> Vec<u8> {
            key.to_be_bytes().to_vec()
        }

        fn key(&self) -> u32 {
            self.id
        }

        fn index_keys(&self) -> Vec<(IndexName, Vec<u8>)> {
            Vec::new()
        }
    }

    fn note(id: u32, tag: &str) -> Note {
        Note { id, tag: tag.into() }
    }

    const SCOPE: &[StoreName] = &[StoreName::Exchanges];

    #[test]
    fn commit_on_ok() {
        let db = Database::open_memory().unwrap();
        db.run_read_write(SCOPE, |tx| tx.put(&note(1, "a"))).unwrap();
        let got: Option<Note> = db.run_read_only(SCOPE, |tx| tx.get(&1)).unwrap();
        assert_eq!(got, Some(note(1, "a")));
    }

    #[test]
    fn rollback_on_err() {
        let db = Database::open_memory().unwrap();
        let r: Result<(), StoreError> = db.run_read_write(SCOPE, |tx| {
            tx.put(&note(1, "a"))?;
            Err(StoreError::Aborted)
        });
        assert_eq!(r, Err(StoreError::Aborted));
        let got: Option<Note> = db.run_read_only(SCOPE, |tx| tx.get(&1)).unwrap();
        assert_eq!(got, None);
    }

    #[test]
    fn reads_see_own_writes() {
        let db = Database::open_memory().unwrap();
        db.run_read_write(SCOPE, |tx| {
            tx.put(&note(2, "b"))?;
            tx.put(&note(1, "a"))?;
            assert_eq!(tx.get::<Note>(&2)?, Some(note(2, "b")));
            let all = tx.iter::<Note>()?.to_vec()?;
            assert_eq!(all, vec![note(1, "a"), note(2, "b")]);
            tx.delete::<Note>(&1)?;
            assert_eq!(tx.iter::<Note>()?.count(), 1);
            Ok::<_, StoreError>(())
        })
        .unwrap();
    }

    #[test]
    fn scope_is_enforced() {
        let db = Database::open_memory().unwrap();
        let r = db.run_read_only(&[StoreName::Coins], |tx| tx.get::<Note>(&1));
        assert_eq!(r, Err(StoreError::NotInScope(StoreName::Exchanges)));
    }

    #[test]
    fn add_rejects_existing_key() {
        let db = Database::open_memory().unwrap();
        db.run_read_write(SCOPE, |tx| tx.add(&note(1, "a"))).unwrap();
        let r = db.run_read_write(SCOPE, |tx| tx.add(&note(1, "b")));
        assert_eq!(r, Err(StoreError::KeyExists(StoreName::Exchanges)));
    }

    #[test]
    fn schema_version_mismatch_is_detected() {
        let backend = MemoryBackend::new();
        backend
            .write(vec![WriteOp::Put {
                table: Table::Meta,
                key: META_SCHEMA_VERSION.to_vec(),
                value: encode(&(SCHEMA_VERSION + 1)).unwrap(),
            }])
            .unwrap();
        assert!(matches!(Database::open(backend), Err(StoreError::SchemaVersion { .. })));
    }

    #[test]
    fn concurrent_writers_serialize() {
        use std::sync::Arc;
        let db = Arc::new(Database::open_memory().unwrap());
        db.run_read_write(SCOPE, |tx| tx.put(&note(0, "0"))).unwrap();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let db = Arc::clone(&db);
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        db.run_read_write(SCOPE, |tx| {
                            let mut n = tx.get::<Note>(&0)?.unwrap();
                            let v: u32 = n.tag.parse().unwrap();
                            n.tag = (v + 1).to_string();
                            tx.put(&n)
                        })
                        .unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let n: Note = db.run_read_only(SCOPE, |tx| tx.get(&0)).unwrap().unwrap();
        assert_eq!(n.tag, "400");
    }
}
