//! Joins concurrent calls for the same key onto one computation.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::OnceCell;

/// Map from key to the cell holding that key's in-flight result.
///
/// The first caller for a key runs its future; callers arriving before it
/// resolves wait on the same cell and receive a clone of its result. The
/// entry is dropped once the result is available, so a later call starts
/// fresh work.
pub struct SingleFlight<K, T> {
    inflight: Mutex<HashMap<K, Arc<OnceCell<T>>>>,
}

impl<K, T> Default for SingleFlight<K, T> {
    fn default() -> Self {
        Self { inflight: Mutex::new(HashMap::new()) }
    }
}

impl<K, T> SingleFlight<K, T>
where
    K: Eq + Hash + Clone,
    T: Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn run<F, Fut>(&self, key: K, f: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let cell = {
            let mut map = self.inflight.lock();
            Arc::clone(map.entry(key.clone()).or_insert_with(|| Arc::new(OnceCell::new())))
        };
        let value = cell.get_or_init(f).await.clone();

        let mut map = self.inflight.lock();
        if map.get(&key).is_some_and(|current| Arc::ptr_eq(current, &cell)) {
            map.remove(&key);
        }
        value
    }

    /// Number of keys with a computation in flight.
    pub fn in_flight(&self) -> usize {
        self.inflight.lock().len()
    }
}
