//! Store error type.
use thiserror::Error;

use crate::schema::StoreName;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("store {0} is not part of the transaction scope")]
    NotInScope(StoreName),
    #[error("key already exists in store {0}")]
    KeyExists(StoreName),
    #[error("transaction aborted")]
    Aborted,
    #[error("encode: {0}")]
    Encode(String),
    #[error("decode: {0}")]
    Decode(String),
    #[error("backend: {0}")]
    Backend(String),
    #[error("schema version mismatch: found {found}, expected {expected}")]
    SchemaVersion { found: u32, expected: u32 },
}
