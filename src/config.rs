use std::{fs, path::Path};

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Serialized aggregates larger than this are gzipped before encryption.
pub const DEFAULT_COMPRESSION_THRESHOLD: usize = 1024;

fn default_true() -> bool {
    true
}

fn default_compression_threshold() -> usize {
    DEFAULT_COMPRESSION_THRESHOLD
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultConfig {
    /// Whether to gzip serialized aggregates before encrypting them.
    #[serde(default = "default_true")]
    pub compression: bool,
    /// Minimum serialized size, in bytes, before compression kicks in.
    #[serde(default = "default_compression_threshold")]
    pub compression_threshold: usize,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            compression: true,
            compression_threshold: DEFAULT_COMPRESSION_THRESHOLD,
        }
    }
}

impl VaultConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config = toml::from_str(&contents)?;
        Ok(config)
    }
}
