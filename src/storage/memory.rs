use std::{
    collections::BTreeMap,
    ops::Bound,
    sync::atomic::{AtomicUsize, Ordering},
};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{AggregateRecord, EncryptedBlob, EncryptedUserSecret, Storage, account_slot};
use crate::{error::Result, event::Event};

/// In-memory [`Storage`] used by tests and by embedders that persist
/// elsewhere. Counts collaborator calls so tests can assert on them.
#[derive(Default)]
pub struct MemoryStorage {
    inner: Mutex<Inner>,
    raw_event_fetches: AtomicUsize,
    aggregate_fetches: AtomicUsize,
    aggregate_puts: AtomicUsize,
    aggregate_deletes: AtomicUsize,
    secret_fetches: AtomicUsize,
    secret_puts: AtomicUsize,
    user_secret_fetches: AtomicUsize,
}

#[derive(Default)]
struct Inner {
    raw_events: BTreeMap<String, BTreeMap<String, Event>>,
    aggregates: BTreeMap<String, BTreeMap<i64, EncryptedBlob>>,
    aggregation_secrets: BTreeMap<String, String>,
    user_secrets: BTreeMap<String, Vec<EncryptedUserSecret>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raw_event_fetches(&self) -> usize {
        self.raw_event_fetches.load(Ordering::SeqCst)
    }

    pub fn aggregate_fetches(&self) -> usize {
        self.aggregate_fetches.load(Ordering::SeqCst)
    }

    pub fn aggregate_puts(&self) -> usize {
        self.aggregate_puts.load(Ordering::SeqCst)
    }

    pub fn aggregate_deletes(&self) -> usize {
        self.aggregate_deletes.load(Ordering::SeqCst)
    }

    pub fn secret_fetches(&self) -> usize {
        self.secret_fetches.load(Ordering::SeqCst)
    }

    pub fn secret_puts(&self) -> usize {
        self.secret_puts.load(Ordering::SeqCst)
    }

    pub fn user_secret_fetches(&self) -> usize {
        self.user_secret_fetches.load(Ordering::SeqCst)
    }

    /// Bucket starts currently holding a persisted aggregate.
    pub fn persisted_buckets(&self, account_id: &str) -> Vec<i64> {
        self.inner
            .lock()
            .aggregates
            .get(account_id)
            .map(|buckets| buckets.keys().copied().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn raw_events(
        &self,
        account_id: Option<&str>,
        lower_id: Option<&str>,
        upper_id: Option<&str>,
    ) -> Result<Vec<Event>> {
        self.raw_event_fetches.fetch_add(1, Ordering::SeqCst);
        let inner = self.inner.lock();
        let Some(events) = inner.raw_events.get(account_slot(account_id)) else {
            return Ok(Vec::new());
        };
        let lower = lower_id
            .map(|id| Bound::Included(id.to_string()))
            .unwrap_or(Bound::Unbounded);
        let upper = upper_id
            .map(|id| Bound::Included(id.to_string()))
            .unwrap_or(Bound::Unbounded);
        Ok(events.range((lower, upper)).map(|(_, e)| e.clone()).collect())
    }

    async fn aggregates(
        &self,
        account_id: &str,
        lower_ts: Option<i64>,
        upper_ts: Option<i64>,
    ) -> Result<Vec<AggregateRecord>> {
        self.aggregate_fetches.fetch_add(1, Ordering::SeqCst);
        let inner = self.inner.lock();
        let Some(buckets) = inner.aggregates.get(account_id) else {
            return Ok(Vec::new());
        };
        let lower = lower_ts.map(Bound::Included).unwrap_or(Bound::Unbounded);
        let upper = upper_ts.map(Bound::Included).unwrap_or(Bound::Unbounded);
        Ok(buckets
            .range((lower, upper))
            .map(|(&timestamp, blob)| AggregateRecord {
                timestamp,
                blob: blob.clone(),
            })
            .collect())
    }

    async fn aggregate(&self, account_id: &str, timestamp: i64) -> Result<Option<EncryptedBlob>> {
        let inner = self.inner.lock();
        Ok(inner
            .aggregates
            .get(account_id)
            .and_then(|buckets| buckets.get(&timestamp))
            .cloned())
    }

    async fn put_aggregate(
        &self,
        account_id: &str,
        timestamp: i64,
        blob: EncryptedBlob,
    ) -> Result<()> {
        self.aggregate_puts.fetch_add(1, Ordering::SeqCst);
        self.inner
            .lock()
            .aggregates
            .entry(account_id.to_string())
            .or_default()
            .insert(timestamp, blob);
        Ok(())
    }

    async fn delete_aggregate(&self, account_id: &str, timestamp: i64) -> Result<()> {
        self.aggregate_deletes.fetch_add(1, Ordering::SeqCst);
        if let Some(buckets) = self.inner.lock().aggregates.get_mut(account_id) {
            buckets.remove(&timestamp);
        }
        Ok(())
    }

    async fn aggregation_secret(&self, account_id: &str) -> Result<Option<String>> {
        self.secret_fetches.fetch_add(1, Ordering::SeqCst);
        Ok(self.inner.lock().aggregation_secrets.get(account_id).cloned())
    }

    async fn put_aggregation_secret(&self, account_id: &str, ciphertext: &str) -> Result<()> {
        self.secret_puts.fetch_add(1, Ordering::SeqCst);
        self.inner
            .lock()
            .aggregation_secrets
            .insert(account_id.to_string(), ciphertext.to_string());
        Ok(())
    }

    async fn encrypted_secrets(&self, account_id: &str) -> Result<Vec<EncryptedUserSecret>> {
        self.user_secret_fetches.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .inner
            .lock()
            .user_secrets
            .get(account_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn put_raw_event(&self, event: &Event) -> Result<()> {
        self.inner
            .lock()
            .raw_events
            .entry(account_slot(event.account_id.as_deref()).to_string())
            .or_default()
            .insert(event.event_id.clone(), event.clone());
        Ok(())
    }

    async fn delete_raw_events(
        &self,
        account_id: Option<&str>,
        event_ids: &[String],
    ) -> Result<()> {
        if let Some(events) = self
            .inner
            .lock()
            .raw_events
            .get_mut(account_slot(account_id))
        {
            for event_id in event_ids {
                events.remove(event_id);
            }
        }
        Ok(())
    }

    async fn put_encrypted_secret(
        &self,
        account_id: &str,
        secret: &EncryptedUserSecret,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        let secrets = inner.user_secrets.entry(account_id.to_string()).or_default();
        secrets.retain(|existing| existing.secret_id != secret.secret_id);
        secrets.push(secret.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Payload;
    use ulid::Ulid;

    fn raw_event(account: Option<&str>, ms: u64, n: u128) -> Event {
        Event {
            account_id: account.map(str::to_string),
            event_id: Ulid::from_parts(ms, n).to_string(),
            secret_id: None,
            payload: Payload::Encrypted("ciphertext".to_string()),
        }
    }

    #[tokio::test]
    async fn raw_event_bounds_are_inclusive() {
        let storage = MemoryStorage::new();
        let events = [
            raw_event(Some("acct"), 1_000, 1),
            raw_event(Some("acct"), 2_000, 1),
            raw_event(Some("acct"), 3_000, 1),
        ];
        for event in &events {
            storage.put_raw_event(event).await.unwrap();
        }

        let fetched = storage
            .raw_events(
                Some("acct"),
                Some(&events[0].event_id),
                Some(&events[1].event_id),
            )
            .await
            .unwrap();
        assert_eq!(fetched.len(), 2);
        assert_eq!(fetched[0].event_id, events[0].event_id);

        let all = storage.raw_events(Some("acct"), None, None).await.unwrap();
        assert_eq!(all.len(), 3);
        assert!(storage
            .raw_events(None, None, None)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn aggregate_bucket_range_and_delete() {
        let storage = MemoryStorage::new();
        let blob = EncryptedBlob {
            value: "EVv1:abc".to_string(),
            compressed: false,
        };
        storage.put_aggregate("acct", 0, blob.clone()).await.unwrap();
        storage
            .put_aggregate("acct", 3_600_000, blob.clone())
            .await
            .unwrap();

        let within = storage
            .aggregates("acct", Some(3_600_000), None)
            .await
            .unwrap();
        assert_eq!(within.len(), 1);
        assert_eq!(within[0].timestamp, 3_600_000);

        storage.delete_aggregate("acct", 3_600_000).await.unwrap();
        assert!(storage.aggregate("acct", 3_600_000).await.unwrap().is_none());
        assert_eq!(storage.aggregate_puts(), 2);
        assert_eq!(storage.aggregate_deletes(), 1);
    }
}
