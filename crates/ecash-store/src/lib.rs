//! # ecash-store
//!
//! Transactional key-value store holding all wallet state.
//!
//! Callers open a transaction over a declared set of stores with
//! [`Database::run_read_only`] or [`Database::run_read_write`]. Records are
//! typed through [`StoreRecord`]; secondary indexes are maintained
//! automatically and queried with [`Tx::index`].
//!
//! # Modules
//!
//! - [`backend`]: Raw `KvBackend` trait, tables and write batches.
//! - [`cursor`]: Lazy record cursors.
//! - [`error`]: `StoreError`.
//! - [`memory`]: In-memory backend.
//! - `rocks`: RocksDB backend (feature `rocksdb`).
//! - [`schema`]: Store and index names, record-to-store mapping.
//! - [`transaction`]: `Database` and scoped transactions.

pub mod backend;
pub mod cursor;
pub mod error;
pub mod memory;
#[cfg(feature = "rocksdb")]
pub mod rocks;
pub mod schema;
pub mod transaction;

pub use backend::{KvBackend, Table, WriteOp};
pub use cursor::Cursor;
pub use error::StoreError;
pub use memory::MemoryBackend;
#[cfg(feature = "rocksdb")]
pub use rocks::RocksBackend;
pub use schema::{IndexName, StoreName, StoreRecord, key_parts, planchet_group_index_key};
pub use transaction::{Database, ReadOnly, ReadWrite, Tx};
