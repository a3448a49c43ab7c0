use std::{collections::HashMap, sync::Arc};

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::columns::Aggregate;

/// Decrypted hourly aggregates, keyed by bucket start in Unix milliseconds.
pub type BucketMap = HashMap<i64, Aggregate>;

/// In-memory cache of decrypted aggregates with one lock per account.
///
/// [`AggregateCache::acquire`] hands out an owned guard over the
/// account's bucket map. The underlying tokio mutex wakes waiters in FIFO
/// order, so read-modify-write cycles for one account serialize strictly
/// while unrelated accounts proceed concurrently. Mutations made through
/// the guard are visible to the next acquirer the moment the guard drops.
///
/// A holder that never drops its guard blocks that account's slot
/// indefinitely; there is no timeout or deadlock detection.
#[derive(Default)]
pub struct AggregateCache {
    slots: Mutex<HashMap<String, Arc<AsyncMutex<BucketMap>>>>,
}

impl AggregateCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Locks the account's slot, lazily creating an empty bucket map for
    /// accounts never seen before.
    pub async fn acquire(&self, account_id: &str) -> OwnedMutexGuard<BucketMap> {
        let slot = {
            let mut slots = self.slots.lock();
            Arc::clone(slots.entry(account_id.to_string()).or_default())
        };
        slot.lock_owned().await
    }
}
