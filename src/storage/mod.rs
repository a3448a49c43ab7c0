mod memory;
mod rocks;

pub use memory::MemoryStorage;
pub use rocks::RocksStorage;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{error::Result, event::Event};

/// An encrypted aggregate at rest, plus whether the plaintext was gzipped
/// before encryption.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncryptedBlob {
    pub value: String,
    pub compressed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateRecord {
    /// Hour-bucket start, Unix milliseconds.
    pub timestamp: i64,
    #[serde(flatten)]
    pub blob: EncryptedBlob,
}

/// A per-user symmetric key, wrapped under the account keypair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedUserSecret {
    pub secret_id: String,
    pub value: String,
}

/// Opaque persistence collaborator.
///
/// Record families: raw (still individually encrypted) events keyed by
/// event id, encrypted hourly aggregates keyed by bucket start, one
/// wrapped aggregation secret per account, and wrapped per-user secrets.
/// `account_id == None` addresses the anonymous/local event table.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Raw events within the inclusive event-id bounds, in id order.
    async fn raw_events(
        &self,
        account_id: Option<&str>,
        lower_id: Option<&str>,
        upper_id: Option<&str>,
    ) -> Result<Vec<Event>>;

    /// Encrypted aggregates whose bucket start falls within the inclusive
    /// millisecond bounds, in bucket order.
    async fn aggregates(
        &self,
        account_id: &str,
        lower_ts: Option<i64>,
        upper_ts: Option<i64>,
    ) -> Result<Vec<AggregateRecord>>;

    async fn aggregate(&self, account_id: &str, timestamp: i64) -> Result<Option<EncryptedBlob>>;

    async fn put_aggregate(
        &self,
        account_id: &str,
        timestamp: i64,
        blob: EncryptedBlob,
    ) -> Result<()>;

    async fn delete_aggregate(&self, account_id: &str, timestamp: i64) -> Result<()>;

    async fn aggregation_secret(&self, account_id: &str) -> Result<Option<String>>;

    async fn put_aggregation_secret(&self, account_id: &str, ciphertext: &str) -> Result<()>;

    async fn encrypted_secrets(&self, account_id: &str) -> Result<Vec<EncryptedUserSecret>>;

    /// Ingestion seam used by embedders and tests; the read path never
    /// writes raw events.
    async fn put_raw_event(&self, event: &Event) -> Result<()>;

    /// Raw-event deletion is driven externally; the read path only reacts
    /// to the raw set shrinking.
    async fn delete_raw_events(&self, account_id: Option<&str>, event_ids: &[String])
        -> Result<()>;

    async fn put_encrypted_secret(
        &self,
        account_id: &str,
        secret: &EncryptedUserSecret,
    ) -> Result<()>;
}

pub(crate) fn account_slot(account_id: Option<&str>) -> &str {
    account_id.unwrap_or("")
}
