//! Client-side encrypted event aggregation store.
//!
//! Raw events arrive individually encrypted; reading them back decrypts
//! each one exactly once and folds it into an hour-bucketed, columnar
//! [`Aggregate`] that is re-encrypted under a per-account aggregation
//! secret and persisted. Subsequent reads decrypt whole buckets instead
//! of individual events. Per-account FIFO locking serializes the
//! decrypt-merge-encrypt cycle; different accounts proceed concurrently.
//!
//! [`EventVault`] is the public entry point; [`Storage`] and [`Crypto`]
//! are the collaborator seams for persistence and key primitives, with
//! [`MemoryStorage`], [`RocksStorage`] and [`DefaultCrypto`] as the
//! bundled implementations.

mod cache;
mod columns;
mod config;
mod crypto;
mod error;
mod event;
mod secrets;
mod storage;
mod store;

pub use cache::{AggregateCache, BucketMap};
pub use columns::Aggregate;
pub use config::{DEFAULT_COMPRESSION_THRESHOLD, VaultConfig};
pub use crypto::{
    Crypto, DefaultCrypto, PrivateKey, PublicKey, SymmetricKey, decrypt_events, generate_keypair,
    unwrap_user_secrets,
};
pub use error::{Result, VaultError};
pub use event::{
    Event, EventPayload, Payload, denormalize_event, event_timestamp_ms, hour_bucket, hour_floor,
    id_lower_bound, id_upper_bound, normalize_event,
};
pub use secrets::SecretManager;
pub use storage::{
    AggregateRecord, EncryptedBlob, EncryptedUserSecret, MemoryStorage, RocksStorage, Storage,
};
pub use store::{AccountKeys, EventVault};
