//! Raw key-value backend interface.

use crate::error::StoreError;
use crate::schema::{IndexName, StoreName};

/// A physical table: an object store, an index, or the metadata table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Table {
    Store(StoreName),
    Index(IndexName),
    Meta,
}

impl Table {
    pub fn name(self) -> &'static str {
        match self {
            Table::Store(s) => s.as_str(),
            Table::Index(i) => i.as_str(),
            Table::Meta => "meta",
        }
    }

    /// Every table a backend must provide.
    pub fn all() -> Vec<Table> {
        let mut tables: Vec<Table> = StoreName::ALL.iter().map(|s| Table::Store(*s)).collect();
        tables.extend(IndexName::ALL.iter().map(|i| Table::Index(*i)));
        tables.push(Table::Meta);
        tables
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WriteOp {
    Put { table: Table, key: Vec<u8>, value: Vec<u8> },
    Delete { table: Table, key: Vec<u8> },
}

/// Ordered key-value storage with atomic batch writes.
///
/// Isolation between transactions is provided by [`Database`](crate::Database);
/// a backend only has to make each [`write`](KvBackend::write) all-or-nothing.
pub trait KvBackend: Send + Sync {
    fn get(&self, table: Table, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError>;

    /// All entries whose key starts with `prefix`, in ascending key order.
    fn scan_prefix(&self, table: Table, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError>;

    /// Apply every operation atomically.
    fn write(&self, ops: Vec<WriteOp>) -> Result<(), StoreError>;
}
