use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, VaultError>;

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("no aggregation secret available for account {0}")]
    MissingAggregationSecret(String),
    #[error("missing key material: {0}")]
    MissingKeyMaterial(String),
    #[error("crypto error: {0}")]
    Crypto(String),
    #[error("corrupt aggregate: {0}")]
    CorruptAggregate(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<toml::de::Error> for VaultError {
    fn from(err: toml::de::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for VaultError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
