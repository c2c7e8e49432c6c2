//! Wallet configuration.
//!
//! [`WalletConfig`] carries defaults for the data directory, network
//! timeouts, retry schedule and crypto pool sizing. Loading it from a file
//! is left to the embedding application.

use std::path::PathBuf;
use std::time::Duration;

use ecash_core::RetryPolicy;
use ecash_core::constants::{
    DEFAULT_NOTIFICATION_CAPACITY, DEFAULT_REQUEST_TIMEOUT_SECS, DEFAULT_WORKER_IDLE_TIMEOUT_SECS,
};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WalletConfig {
    /// Root directory for all persistent data.
    pub data_dir: PathBuf,
    /// Timeout applied to every exchange request.
    pub request_timeout_secs: u64,
    /// Backoff schedule for failed lifecycle steps.
    pub retry: RetryPolicy,
    /// Crypto workers idle this long are shut down.
    pub crypto_idle_timeout_secs: u64,
    /// Overrides the number of crypto workers (default: available CPUs).
    pub crypto_concurrency: Option<usize>,
    /// Buffer size of the notification broadcast channel.
    pub notification_capacity: usize,
}

impl Default for WalletConfig {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("ecash-wallet");

        Self {
            data_dir,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            retry: RetryPolicy::default(),
            crypto_idle_timeout_secs: DEFAULT_WORKER_IDLE_TIMEOUT_SECS,
            crypto_concurrency: None,
            notification_capacity: DEFAULT_NOTIFICATION_CAPACITY,
        }
    }
}

impl WalletConfig {
    /// Path to the RocksDB wallet database.
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("wallet-db")
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn crypto_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.crypto_idle_timeout_secs)
    }
}
