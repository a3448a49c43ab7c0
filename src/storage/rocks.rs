use std::path::Path;

use async_trait::async_trait;
use rocksdb::{DBWithThreadMode, Direction, IteratorMode, MultiThreaded, Options};

use super::{AggregateRecord, EncryptedBlob, EncryptedUserSecret, Storage, account_slot};
use crate::{
    error::{Result, VaultError},
    event::Event,
};

const SEP: u8 = 0x1F;
const PREFIX_RAW_EVENT: &str = "raw";
const PREFIX_AGGREGATE: &str = "agg";
const PREFIX_AGGREGATION_SECRET: &str = "aggkey";
const PREFIX_USER_SECRET: &str = "usrkey";

/// RocksDB-backed [`Storage`].
///
/// Keys are `family ␟ account ␟ suffix` with a unit-separator byte, so
/// each record family for one account occupies a contiguous, ordered key
/// range. Bucket timestamps are zero-padded decimals to keep range scans
/// in chronological order.
pub struct RocksStorage {
    db: DBWithThreadMode<MultiThreaded>,
}

impl RocksStorage {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut options = Options::default();
        options.create_if_missing(true);
        let db =
            DBWithThreadMode::<MultiThreaded>::open(&options, path.as_ref()).map_err(storage_err)?;
        Ok(Self { db })
    }

    /// Key suffixes and values under `prefix`, starting at `start_suffix`.
    fn scan(&self, prefix: &[u8], start_suffix: Option<&str>) -> Result<Vec<(String, Vec<u8>)>> {
        let mut start = prefix.to_vec();
        if let Some(suffix) = start_suffix {
            start.extend_from_slice(suffix.as_bytes());
        }
        let mut entries = Vec::new();
        for item in self
            .db
            .iterator(IteratorMode::From(&start, Direction::Forward))
        {
            let (key, value) = item.map_err(storage_err)?;
            if !key.starts_with(prefix) {
                break;
            }
            let suffix = String::from_utf8_lossy(&key[prefix.len()..]).into_owned();
            entries.push((suffix, value.to_vec()));
        }
        Ok(entries)
    }
}

#[async_trait]
impl Storage for RocksStorage {
    async fn raw_events(
        &self,
        account_id: Option<&str>,
        lower_id: Option<&str>,
        upper_id: Option<&str>,
    ) -> Result<Vec<Event>> {
        let prefix = scope(PREFIX_RAW_EVENT, account_slot(account_id));
        let mut events = Vec::new();
        for (event_id, value) in self.scan(&prefix, lower_id)? {
            if upper_id.is_some_and(|upper| event_id.as_str() > upper) {
                break;
            }
            events.push(serde_json::from_slice(&value)?);
        }
        Ok(events)
    }

    async fn aggregates(
        &self,
        account_id: &str,
        lower_ts: Option<i64>,
        upper_ts: Option<i64>,
    ) -> Result<Vec<AggregateRecord>> {
        let prefix = scope(PREFIX_AGGREGATE, account_id);
        let start = lower_ts.map(bucket_suffix);
        let mut records = Vec::new();
        for (suffix, value) in self.scan(&prefix, start.as_deref())? {
            let timestamp = suffix.parse::<i64>().map_err(|_| {
                VaultError::Storage(format!("malformed aggregate bucket key {suffix}"))
            })?;
            if upper_ts.is_some_and(|upper| timestamp > upper) {
                break;
            }
            records.push(AggregateRecord {
                timestamp,
                blob: serde_json::from_slice(&value)?,
            });
        }
        Ok(records)
    }

    async fn aggregate(&self, account_id: &str, timestamp: i64) -> Result<Option<EncryptedBlob>> {
        let key = record_key(PREFIX_AGGREGATE, account_id, &bucket_suffix(timestamp));
        match self.db.get(key).map_err(storage_err)? {
            Some(value) => Ok(Some(serde_json::from_slice(&value)?)),
            None => Ok(None),
        }
    }

    async fn put_aggregate(
        &self,
        account_id: &str,
        timestamp: i64,
        blob: EncryptedBlob,
    ) -> Result<()> {
        let key = record_key(PREFIX_AGGREGATE, account_id, &bucket_suffix(timestamp));
        self.db
            .put(key, serde_json::to_vec(&blob)?)
            .map_err(storage_err)
    }

    async fn delete_aggregate(&self, account_id: &str, timestamp: i64) -> Result<()> {
        let key = record_key(PREFIX_AGGREGATE, account_id, &bucket_suffix(timestamp));
        self.db.delete(key).map_err(storage_err)
    }

    async fn aggregation_secret(&self, account_id: &str) -> Result<Option<String>> {
        let key = record_key(PREFIX_AGGREGATION_SECRET, account_id, "");
        match self.db.get(key).map_err(storage_err)? {
            Some(value) => String::from_utf8(value)
                .map(Some)
                .map_err(|err| VaultError::Serialization(err.to_string())),
            None => Ok(None),
        }
    }

    async fn put_aggregation_secret(&self, account_id: &str, ciphertext: &str) -> Result<()> {
        let key = record_key(PREFIX_AGGREGATION_SECRET, account_id, "");
        self.db
            .put(key, ciphertext.as_bytes())
            .map_err(storage_err)
    }

    async fn encrypted_secrets(&self, account_id: &str) -> Result<Vec<EncryptedUserSecret>> {
        let prefix = scope(PREFIX_USER_SECRET, account_id);
        let mut secrets = Vec::new();
        for (secret_id, value) in self.scan(&prefix, None)? {
            let value = String::from_utf8(value)
                .map_err(|err| VaultError::Serialization(err.to_string()))?;
            secrets.push(EncryptedUserSecret { secret_id, value });
        }
        Ok(secrets)
    }

    async fn put_raw_event(&self, event: &Event) -> Result<()> {
        let key = record_key(
            PREFIX_RAW_EVENT,
            account_slot(event.account_id.as_deref()),
            &event.event_id,
        );
        self.db
            .put(key, serde_json::to_vec(event)?)
            .map_err(storage_err)
    }

    async fn delete_raw_events(
        &self,
        account_id: Option<&str>,
        event_ids: &[String],
    ) -> Result<()> {
        for event_id in event_ids {
            let key = record_key(PREFIX_RAW_EVENT, account_slot(account_id), event_id);
            self.db.delete(key).map_err(storage_err)?;
        }
        Ok(())
    }

    async fn put_encrypted_secret(
        &self,
        account_id: &str,
        secret: &EncryptedUserSecret,
    ) -> Result<()> {
        let key = record_key(PREFIX_USER_SECRET, account_id, &secret.secret_id);
        self.db
            .put(key, secret.value.as_bytes())
            .map_err(storage_err)
    }
}

fn storage_err(err: impl std::fmt::Display) -> VaultError {
    VaultError::Storage(err.to_string())
}

fn scope(family: &str, account: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(family.len() + account.len() + 2);
    key.extend_from_slice(family.as_bytes());
    key.push(SEP);
    key.extend_from_slice(account.as_bytes());
    key.push(SEP);
    key
}

fn record_key(family: &str, account: &str, suffix: &str) -> Vec<u8> {
    let mut key = scope(family, account);
    key.extend_from_slice(suffix.as_bytes());
    key
}

fn bucket_suffix(timestamp: i64) -> String {
    format!("{timestamp:020}")
}

#[cfg(test)]
mod tests {
    use ulid::Ulid;

    use super::*;
    use crate::event::Payload;

    fn raw_event(account: &str, ms: u64) -> Event {
        Event {
            account_id: Some(account.to_string()),
            event_id: Ulid::from_parts(ms, 42).to_string(),
            secret_id: None,
            payload: Payload::Encrypted("ciphertext".to_string()),
        }
    }

    #[tokio::test]
    async fn raw_events_scan_respects_account_and_bounds() {
        let dir = tempfile::tempdir().unwrap();
        let storage = RocksStorage::open(dir.path().join("vault")).unwrap();

        let first = raw_event("acct", 1_000);
        let second = raw_event("acct", 2_000);
        let foreign = raw_event("acct-2", 1_500);
        for event in [&first, &second, &foreign] {
            storage.put_raw_event(event).await.unwrap();
        }

        let events = storage.raw_events(Some("acct"), None, None).await.unwrap();
        assert_eq!(events, vec![first.clone(), second.clone()]);

        let bounded = storage
            .raw_events(Some("acct"), None, Some(&first.event_id))
            .await
            .unwrap();
        assert_eq!(bounded, vec![first.clone()]);

        storage
            .delete_raw_events(Some("acct"), &[first.event_id.clone()])
            .await
            .unwrap();
        let remaining = storage.raw_events(Some("acct"), None, None).await.unwrap();
        assert_eq!(remaining, vec![second]);
    }

    #[tokio::test]
    async fn aggregates_round_trip_in_bucket_order() {
        let dir = tempfile::tempdir().unwrap();
        let storage = RocksStorage::open(dir.path().join("vault")).unwrap();

        let blob = EncryptedBlob {
            value: "EVv1:payload".to_string(),
            compressed: true,
        };
        storage
            .put_aggregate("acct", 7_200_000, blob.clone())
            .await
            .unwrap();
        storage
            .put_aggregate("acct", 3_600_000, blob.clone())
            .await
            .unwrap();

        let records = storage.aggregates("acct", None, None).await.unwrap();
        assert_eq!(
            records.iter().map(|r| r.timestamp).collect::<Vec<_>>(),
            vec![3_600_000, 7_200_000]
        );

        let upper_bounded = storage
            .aggregates("acct", Some(3_600_000), Some(3_600_000))
            .await
            .unwrap();
        assert_eq!(upper_bounded.len(), 1);
        assert_eq!(upper_bounded[0].blob, blob);

        storage.delete_aggregate("acct", 3_600_000).await.unwrap();
        assert!(storage
            .aggregate("acct", 3_600_000)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn secrets_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let storage = RocksStorage::open(dir.path().join("vault")).unwrap();

        assert!(storage.aggregation_secret("acct").await.unwrap().is_none());
        storage
            .put_aggregation_secret("acct", "EVx1:wrapped")
            .await
            .unwrap();
        assert_eq!(
            storage.aggregation_secret("acct").await.unwrap().as_deref(),
            Some("EVx1:wrapped")
        );

        let secret = EncryptedUserSecret {
            secret_id: "user-1".to_string(),
            value: "EVx1:user".to_string(),
        };
        storage.put_encrypted_secret("acct", &secret).await.unwrap();
        assert_eq!(
            storage.encrypted_secrets("acct").await.unwrap(),
            vec![secret]
        );
    }
}
