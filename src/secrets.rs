use std::{collections::HashMap, sync::Arc};

use parking_lot::Mutex;
use tokio::sync::OnceCell;

use crate::{
    crypto::{Crypto, PrivateKey, PublicKey, SymmetricKey},
    error::{Result, VaultError},
    storage::Storage,
};

/// Obtains or creates the one symmetric aggregation secret per account.
///
/// Resolved secrets are cached for the life of the process. The cache
/// stores one cell per account, so concurrent first calls share the same
/// in-flight resolution instead of racing to create two secrets.
pub struct SecretManager {
    storage: Arc<dyn Storage>,
    crypto: Arc<dyn Crypto>,
    secrets: Mutex<HashMap<String, Arc<OnceCell<SymmetricKey>>>>,
}

impl SecretManager {
    pub fn new(storage: Arc<dyn Storage>, crypto: Arc<dyn Crypto>) -> Self {
        Self {
            storage,
            crypto,
            secrets: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the account's aggregation secret.
    ///
    /// Without any key material this only ever serves the in-process
    /// cache; a cache miss is an error naming the account. With key
    /// material, a persisted secret is unwrapped with the private key,
    /// and a missing one is generated, wrapped under the public key and
    /// persisted before being returned.
    pub async fn ensure_aggregation_secret(
        &self,
        account_id: &str,
        public_key: Option<&PublicKey>,
        private_key: Option<&PrivateKey>,
    ) -> Result<SymmetricKey> {
        let cell = {
            let mut secrets = self.secrets.lock();
            Arc::clone(secrets.entry(account_id.to_string()).or_default())
        };
        if public_key.is_none() && private_key.is_none() {
            return cell
                .get()
                .cloned()
                .ok_or_else(|| VaultError::MissingAggregationSecret(account_id.to_string()));
        }
        let key = cell
            .get_or_try_init(|| self.resolve(account_id, public_key, private_key))
            .await?;
        Ok(key.clone())
    }

    async fn resolve(
        &self,
        account_id: &str,
        public_key: Option<&PublicKey>,
        private_key: Option<&PrivateKey>,
    ) -> Result<SymmetricKey> {
        match self.storage.aggregation_secret(account_id).await? {
            Some(wrapped) => {
                let private_key = private_key.ok_or_else(|| {
                    VaultError::MissingKeyMaterial(format!(
                        "private key required to unwrap the aggregation secret for account {account_id}"
                    ))
                })?;
                let bytes = self.crypto.decrypt_asymmetric(private_key, &wrapped)?;
                SymmetricKey::from_bytes(&bytes)
            }
            None => {
                let public_key = public_key.ok_or_else(|| {
                    VaultError::MissingKeyMaterial(format!(
                        "public key required to create an aggregation secret for account {account_id}"
                    ))
                })?;
                let key = self.crypto.create_symmetric_key();
                let wrapped = self.crypto.encrypt_asymmetric(public_key, key.as_bytes())?;
                self.storage
                    .put_aggregation_secret(account_id, &wrapped)
                    .await?;
                Ok(key)
            }
        }
    }
}
