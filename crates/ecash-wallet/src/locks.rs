//! Named global locks serializing cross-task sequences.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Mutex as AsyncMutex;
use tracing::trace;

/// Held while querying reserves and creating withdrawals from them.
pub const EXCHANGE_RESERVES_LOCK: &str = "exchange-reserves-lock";

/// Held around melt and reveal requests.
pub const EXCHANGE_COINS_LOCK: &str = "exchange-coins-lock";

#[derive(Default)]
pub struct ResourceLocks {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl ResourceLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `fut` while holding every lock in `tokens`.
    ///
    /// Locks are acquired in sorted order, so callers naming the same
    /// tokens in different orders cannot deadlock. They are released when
    /// `fut` completes, whatever its result.
    pub async fn run_sequentialized<T, Fut>(&self, tokens: &[&str], fut: Fut) -> T
    where
        Fut: Future<Output = T>,
    {
        let mut tokens = tokens.to_vec();
        tokens.sort_unstable();
        tokens.dedup();

        let mutexes: Vec<Arc<AsyncMutex<()>>> = {
            let mut map = self.locks.lock();
            tokens
                .iter()
                .map(|t| Arc::clone(map.entry((*t).to_string()).or_default()))
                .collect()
        };

        let mut guards = Vec::with_capacity(mutexes.len());
        for m in mutexes {
            guards.push(m.lock_owned().await);
        }
        trace!(?tokens, "acquired resource locks");
        let out = fut.await;
        drop(guards);
        trace!(?tokens, "released resource locks");
        out
    }
}
