//! In-memory backend.

use std::collections::{BTreeMap, HashMap};

use parking_lot::RwLock;

use crate::backend::{KvBackend, Table, WriteOp};
use crate::error::StoreError;

/// Backend holding every table in a `BTreeMap`. Used by tests and
/// ephemeral wallets.
#[derive(Default)]
pub struct MemoryBackend {
    tables: RwLock<HashMap<Table, BTreeMap<Vec<u8>, Vec<u8>>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvBackend for MemoryBackend {
    fn get(&self, table: Table, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.tables.read().get(&table).and_then(|t| t.get(key).cloned()))
    }

    fn scan_prefix(&self, table: Table, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        let tables = self.tables.read();
        let Some(t) = tables.get(&table) else {
            return Ok(Vec::new());
        };
        Ok(t.range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn write(&self, ops: Vec<WriteOp>) -> Result<(), StoreError> {
        let mut tables = self.tables.write();
        for op in ops {
            match op {
                WriteOp::Put { table, key, value } => {
                    tables.entry(table).or_default().insert(key, value);
                }
                WriteOp::Delete { table, key } => {
                    if let Some(t) = tables.get_mut(&table) {
                        t.remove(&key);
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::StoreName;

    #[test]
    fn prefix_scan_is_ordered_and_bounded() {
        let b = MemoryBackend::new();
        let t = Table::Store(StoreName::Coins);
        let put = |k: &[u8]| WriteOp::Put { table: t, key: k.to_vec(), value: k.to_vec() };
        b.write(vec![put(b"ab2"), put(b"ab1"), put(b"ac"), put(b"a")]).unwrap();

        let keys: Vec<_> = b.scan_prefix(t, b"ab").unwrap().into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec![b"ab1".to_vec(), b"ab2".to_vec()]);
        assert!(b.scan_prefix(Table::Meta, b"").unwrap().is_empty());
    }

    #[test]
    fn delete_removes() {
        let b = MemoryBackend::new();
        let t = Table::Meta;
        b.write(vec![WriteOp::Put { table: t, key: b"k".to_vec(), value: b"v".to_vec() }]).unwrap();
        assert_eq!(b.get(t, b"k").unwrap(), Some(b"v".to_vec()));
        b.write(vec![WriteOp::Delete { table: t, key: b"k".to_vec() }]).unwrap();
        assert_eq!(b.get(t, b"k").unwrap(), None);
    }
}
