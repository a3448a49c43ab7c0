use std::{
    collections::{HashMap, HashSet},
    io::{Read, Write},
    sync::Arc,
};

use chrono::{DateTime, Utc};
use flate2::{Compression, read::GzDecoder, write::GzEncoder};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::{
    cache::AggregateCache,
    columns::Aggregate,
    config::VaultConfig,
    crypto::{self, Crypto, PrivateKey, PublicKey, SymmetricKey},
    error::Result,
    event::{self, Event, FIELD_EVENT_ID},
    secrets::SecretManager,
    storage::{EncryptedBlob, Storage},
};

/// Key material identifying one account's view of the vault.
///
/// Key fields are optional: a caller without them can still read as long
/// as the aggregation secret is already resident in-process, but events
/// encrypted under the account keypair will be skipped.
#[derive(Debug, Clone)]
pub struct AccountKeys {
    pub account_id: String,
    pub public_key: Option<PublicKey>,
    pub private_key: Option<PrivateKey>,
}

impl AccountKeys {
    pub fn new(account_id: impl Into<String>, public_key: PublicKey, private_key: PrivateKey) -> Self {
        Self {
            account_id: account_id.into(),
            public_key: Some(public_key),
            private_key: Some(private_key),
        }
    }
}

/// The aggregating event store.
///
/// On read it reconciles raw encrypted events against cached and
/// persisted encrypted aggregates, decrypts only what is missing, merges
/// newly decrypted events into hourly buckets, re-encrypts and persists
/// changed buckets in the background, and returns a flat validated event
/// list.
pub struct EventVault {
    storage: Arc<dyn Storage>,
    crypto: Arc<dyn Crypto>,
    secrets: SecretManager,
    cache: AggregateCache,
    config: VaultConfig,
    pending_writes: Mutex<Vec<JoinHandle<()>>>,
}

impl EventVault {
    pub fn new(storage: Arc<dyn Storage>, crypto: Arc<dyn Crypto>, config: VaultConfig) -> Self {
        Self {
            secrets: SecretManager::new(Arc::clone(&storage), Arc::clone(&crypto)),
            cache: AggregateCache::new(),
            storage,
            crypto,
            config,
            pending_writes: Mutex::new(Vec::new()),
        }
    }

    /// Returns all valid events for the account within the inclusive time
    /// bounds.
    ///
    /// Without an account this bypasses aggregation entirely and serves
    /// the anonymous event table. Secret-resolution failures abort the
    /// call; individual events that fail decryption or validation are
    /// dropped silently. Persistence of updated aggregate buckets happens
    /// behind the returned result; see [`EventVault::flush`].
    pub async fn get_events(
        &self,
        account: Option<&AccountKeys>,
        lower: Option<DateTime<Utc>>,
        upper: Option<DateTime<Utc>>,
    ) -> Result<Vec<Event>> {
        let lower_id = lower.map(event::id_lower_bound);
        let upper_id = upper.map(event::id_upper_bound);
        let events = match account {
            None => {
                self.storage
                    .raw_events(None, lower_id.as_deref(), upper_id.as_deref())
                    .await?
            }
            Some(account) => {
                self.account_events(
                    account,
                    lower,
                    upper,
                    lower_id.as_deref(),
                    upper_id.as_deref(),
                )
                .await?
            }
        };
        Ok(events
            .iter()
            .filter_map(Event::validate_and_parse)
            .collect())
    }

    /// Awaits every background aggregate write scheduled so far. Callers
    /// of [`EventVault::get_events`] never observe write failures; this
    /// is the seam for tests and shutdown paths that want to.
    pub async fn flush(&self) {
        let handles: Vec<_> = std::mem::take(&mut *self.pending_writes.lock());
        for handle in handles {
            if let Err(err) = handle.await {
                warn!(%err, "background write task failed");
            }
        }
    }

    async fn account_events(
        &self,
        account: &AccountKeys,
        lower: Option<DateTime<Utc>>,
        upper: Option<DateTime<Utc>>,
        lower_id: Option<&str>,
        upper_id: Option<&str>,
    ) -> Result<Vec<Event>> {
        let account_id = account.account_id.as_str();
        let key = self
            .secrets
            .ensure_aggregation_secret(
                account_id,
                account.public_key.as_ref(),
                account.private_key.as_ref(),
            )
            .await?;

        let (raw_events, bucket_records, wrapped_secrets) = tokio::join!(
            self.storage
                .raw_events(Some(account_id), lower_id, upper_id),
            self.storage.aggregates(
                account_id,
                lower.map(event::hour_floor),
                upper.map(event::hour_floor),
            ),
            self.storage.encrypted_secrets(account_id),
        );
        let raw_events = raw_events?;
        let bucket_records = bucket_records?;
        let wrapped_secrets = wrapped_secrets?;

        let mut cache = self.cache.acquire(account_id).await;

        for record in &bucket_records {
            if cache.contains_key(&record.timestamp) {
                continue;
            }
            let aggregate = self.decrypt_aggregate(&key, &record.blob)?;
            cache.insert(record.timestamp, aggregate);
        }

        let mut aggregated = Vec::new();
        for aggregate in cache.values() {
            for record in aggregate.inflate()? {
                let event = event::denormalize_event(record)?;
                if within_bounds(&event.event_id, lower_id, upper_id) {
                    aggregated.push(event);
                }
            }
        }

        let raw_ids: HashSet<&str> = raw_events.iter().map(|e| e.event_id.as_str()).collect();
        let aggregated_ids: HashSet<&str> =
            aggregated.iter().map(|e| e.event_id.as_str()).collect();

        let missing: Vec<Event> = raw_events
            .iter()
            .filter(|e| !aggregated_ids.contains(e.event_id.as_str()))
            .cloned()
            .collect();
        let extraneous: HashSet<String> = aggregated
            .iter()
            .filter(|e| !raw_ids.contains(e.event_id.as_str()))
            .map(|e| e.event_id.clone())
            .collect();
        debug!(
            account_id,
            missing = missing.len(),
            extraneous = extraneous.len(),
            "reconciling raw events against aggregates"
        );

        let user_secrets = match &account.private_key {
            Some(private_key) => {
                crypto::unwrap_user_secrets(self.crypto.as_ref(), &wrapped_secrets, private_key)
            }
            None => HashMap::new(),
        };
        let new_events = crypto::decrypt_events(
            self.crypto.as_ref(),
            missing,
            &user_secrets,
            account.private_key.as_ref(),
        );

        let mut dirty = HashSet::new();

        let mut additions: HashMap<i64, Vec<_>> = HashMap::new();
        for event in &new_events {
            let bucket = match event::hour_bucket(&event.event_id) {
                Ok(bucket) => bucket,
                Err(err) => {
                    warn!(event_id = %event.event_id, %err, "dropping event with unusable id");
                    continue;
                }
            };
            additions
                .entry(bucket)
                .or_default()
                .push(event::normalize_event(event)?);
        }
        for (bucket, records) in additions {
            // new events first, then the existing bucket contents
            let mut merged = Aggregate::from_events(records);
            if let Some(existing) = cache.remove(&bucket) {
                merged.merge(existing);
            }
            cache.insert(bucket, merged);
            dirty.insert(bucket);
        }

        let mut removals: HashMap<i64, HashSet<String>> = HashMap::new();
        for event_id in &extraneous {
            match event::hour_bucket(event_id) {
                Ok(bucket) => {
                    removals.entry(bucket).or_default().insert(event_id.clone());
                }
                Err(err) => {
                    warn!(%event_id, %err, "cannot map deleted event to a bucket");
                }
            }
        }
        for (bucket, ids) in removals {
            if let Some(aggregate) = cache.get_mut(&bucket) {
                aggregate.remove_where(FIELD_EVENT_ID, &ids);
                dirty.insert(bucket);
            }
        }

        for bucket in dirty {
            match cache.get(&bucket) {
                Some(aggregate) if !aggregate.is_empty() => {
                    let blob = self.encode_aggregate(&key, aggregate)?;
                    self.spawn_write(account_id.to_string(), bucket, Some(blob));
                }
                _ => {
                    cache.remove(&bucket);
                    self.spawn_write(account_id.to_string(), bucket, None);
                }
            }
        }
        drop(cache);

        let mut results = new_events;
        results.extend(
            aggregated
                .into_iter()
                .filter(|event| !extraneous.contains(&event.event_id)),
        );
        Ok(results)
    }

    fn decrypt_aggregate(&self, key: &SymmetricKey, blob: &EncryptedBlob) -> Result<Aggregate> {
        let bytes = self.crypto.decrypt_symmetric(key, &blob.value)?;
        let bytes = if blob.compressed {
            gunzip(&bytes)?
        } else {
            bytes
        };
        Ok(serde_json::from_slice(&bytes)?)
    }

    fn encode_aggregate(&self, key: &SymmetricKey, aggregate: &Aggregate) -> Result<EncryptedBlob> {
        let serialized = serde_json::to_vec(aggregate)?;
        let compress =
            self.config.compression && serialized.len() > self.config.compression_threshold;
        let payload = if compress {
            gzip(&serialized)?
        } else {
            serialized
        };
        Ok(EncryptedBlob {
            value: self.crypto.encrypt_symmetric(key, &payload)?,
            compressed: compress,
        })
    }

    fn spawn_write(&self, account_id: String, bucket: i64, blob: Option<EncryptedBlob>) {
        let storage = Arc::clone(&self.storage);
        let handle = tokio::spawn(async move {
            let outcome = match blob {
                Some(blob) => storage.put_aggregate(&account_id, bucket, blob).await,
                None => storage.delete_aggregate(&account_id, bucket).await,
            };
            if let Err(err) = outcome {
                warn!(%account_id, bucket, %err, "background aggregate write failed");
            }
        });
        self.pending_writes.lock().push(handle);
    }
}

fn within_bounds(event_id: &str, lower: Option<&str>, upper: Option<&str>) -> bool {
    lower.is_none_or(|lower| event_id >= lower) && upper.is_none_or(|upper| event_id <= upper)
}

fn gzip(bytes: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes)?;
    Ok(encoder.finish()?)
}

fn gunzip(bytes: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(bytes);
    let mut plain = Vec::new();
    decoder.read_to_end(&mut plain)?;
    Ok(plain)
}
