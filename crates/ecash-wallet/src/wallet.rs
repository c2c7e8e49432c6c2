//! The wallet handle: shared state every lifecycle operation runs against.

use std::future::Future;
use std::sync::Arc;

use ecash_core::records::{DenominationRecord, ExchangeRecord};
use ecash_core::{ExchangeClient, ExchangeError};
use ecash_crypto::CryptoWorkerPool;
use ecash_store::{Database, StoreError, StoreName};
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::config::WalletConfig;
use crate::error::WalletError;
use crate::locks::ResourceLocks;
use crate::notifications::{Notifier, WalletNotification};
use crate::single_flight::SingleFlight;
use crate::task::{TaskId, TaskOutcome};

/// Cloneable handle to a wallet.
///
/// Clones share the database, the crypto pool, the resource locks and the
/// table of in-flight task steps.
#[derive(Clone)]
pub struct Wallet {
    pub(crate) db: Arc<Database>,
    pub(crate) crypto: CryptoWorkerPool,
    pub(crate) exchange: Arc<dyn ExchangeClient>,
    pub(crate) config: Arc<WalletConfig>,
    pub(crate) notifier: Notifier,
    pub(crate) locks: Arc<ResourceLocks>,
    pub(crate) inflight: Arc<SingleFlight<TaskId, Result<TaskOutcome, WalletError>>>,
}

impl Wallet {
    pub fn new(
        db: Database,
        crypto: CryptoWorkerPool,
        exchange: Arc<dyn ExchangeClient>,
        config: WalletConfig,
    ) -> Self {
        Self {
            db: Arc::new(db),
            crypto,
            exchange,
            notifier: Notifier::new(config.notification_capacity),
            config: Arc::new(config),
            locks: Arc::new(ResourceLocks::new()),
            inflight: Arc::new(SingleFlight::new()),
        }
    }

    /// Open the RocksDB database under `config.data_dir` and start a
    /// thread-backed crypto pool.
    pub fn open(config: WalletConfig, exchange: Arc<dyn ExchangeClient>) -> Result<Self, WalletError> {
        std::fs::create_dir_all(&config.data_dir).map_err(|e| StoreError::Backend(e.to_string()))?;
        let db = Database::open_rocks(config.db_path())?;
        let crypto = CryptoWorkerPool::with_thread_workers(config.crypto_idle_timeout(), config.crypto_concurrency);
        info!(path = %config.db_path().display(), "wallet opened");
        Ok(Self::new(db, crypto, exchange, config))
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn crypto(&self) -> &CryptoWorkerPool {
        &self.crypto
    }

    pub fn config(&self) -> &WalletConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WalletNotification> {
        self.notifier.subscribe()
    }

    /// Stop the crypto pool. Steps still running fail with a transient
    /// crypto error and are retried after restart.
    pub fn shutdown(&self) {
        self.crypto.stop();
    }

    /// Store an exchange and its current denominations, as fetched by the
    /// embedding application.
    pub fn import_exchange(
        &self,
        exchange: ExchangeRecord,
        denominations: Vec<DenominationRecord>,
    ) -> Result<(), WalletError> {
        debug!(exchange = %exchange.base_url, denoms = denominations.len(), "importing exchange");
        self.db.run_read_write(&[StoreName::Exchanges, StoreName::Denominations], |tx| {
            tx.put(&exchange)?;
            for d in &denominations {
                tx.put(d)?;
            }
            Ok(())
        })
    }

    /// Await an exchange request, bounded by the configured timeout.
    pub(crate) async fn exchange_call<T, F>(&self, request: F) -> Result<T, WalletError>
    where
        F: Future<Output = Result<T, ExchangeError>>,
    {
        match tokio::time::timeout(self.config.request_timeout(), request).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(WalletError::Exchange(ExchangeError::Timeout)),
        }
    }
}
