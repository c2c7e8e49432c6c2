//! RocksDB backend.
//!
//! One column family per store, per index and for metadata. Batches are
//! committed through a single [`WriteBatch`].

use std::path::Path;

use rocksdb::{ColumnFamilyDescriptor, DB, Direction, IteratorMode, Options, WriteBatch};

use crate::backend::{KvBackend, Table, WriteOp};
use crate::error::StoreError;

pub struct RocksBackend {
    db: DB,
}

fn backend_err(e: rocksdb::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

impl RocksBackend {
    /// Open or create a database at `path`, creating missing column families.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = Table::all()
            .into_iter()
            .map(|t| ColumnFamilyDescriptor::new(t.name(), Options::default()))
            .collect();

        let db = DB::open_cf_descriptors(&db_opts, path.as_ref(), cf_descriptors)
            .map_err(backend_err)?;
        tracing::info!(path = %path.as_ref().display(), "opened rocksdb wallet store");
        Ok(Self { db })
    }

    fn cf_handle(&self, table: Table) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(table.name())
            .ok_or_else(|| StoreError::Backend(format!("missing column family: {}", table.name())))
    }
}

impl KvBackend for RocksBackend {
    fn get(&self, table: Table, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let cf = self.cf_handle(table)?;
        self.db.get_cf(cf, key).map_err(backend_err)
    }

    fn scan_prefix(&self, table: Table, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        let cf = self.cf_handle(table)?;
        let iter = self.db.iterator_cf(cf, IteratorMode::From(prefix, Direction::Forward));
        let mut out = Vec::new();
        for item in iter {
            let (k, v) = item.map_err(backend_err)?;
            if !k.starts_with(prefix) {
                break;
            }
            out.push((k.to_vec(), v.to_vec()));
        }
        Ok(out)
    }

    fn write(&self, ops: Vec<WriteOp>) -> Result<(), StoreError> {
        let mut batch = WriteBatch::default();
        for op in ops {
            match op {
                WriteOp::Put { table, key, value } => batch.put_cf(self.cf_handle(table)?, key, value),
                WriteOp::Delete { table, key } => batch.delete_cf(self.cf_handle(table)?, key),
            }
        }
        self.db.write(batch).map_err(backend_err)
    }
}
