//! # ecash-crypto
//!
//! Crypto operations of the wallet and the worker pool that runs them off
//! the scheduler thread.
//!
//! # Modules
//!
//! - [`error`]: `CryptoError`.
//! - [`implementation`]: Synchronous operation bodies (`CryptoImplementation`).
//! - [`ops`]: Request and response payloads, priorities.
//! - [`pool`]: `CryptoWorkerPool`, priority queues and worker slots.
//! - [`primitives`]: Ed25519 signing, SHA-256 and BLAKE3 helpers.
//! - [`worker`]: Worker seam and the default thread workers.

pub mod error;
pub mod implementation;
pub mod ops;
pub mod pool;
pub mod primitives;
pub mod worker;

pub use error::CryptoError;
pub use implementation::{CryptoImplementation, Ed25519Implementation, eddsa_denomination_key};
pub use ops::{CryptoRequest, CryptoResponse, NUM_PRIORITY};
pub use pool::{CryptoWorkerPool, PoolStats, WorkerSink};
pub use worker::{CryptoWorker, CryptoWorkerFactory, ThreadWorkerFactory, WorkerRequest, WorkerResponse};
