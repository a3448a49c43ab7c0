use std::{collections::HashMap, fmt};

use aes_gcm::{Aes256Gcm, Key, KeyInit, Nonce, aead::Aead};
use base64::{Engine, engine::general_purpose::STANDARD};
use rand_core::{OsRng, RngCore};
use sha2::{Digest, Sha256};
use tracing::warn;
use x25519_dalek::{EphemeralSecret, StaticSecret};

use crate::{
    error::{Result, VaultError},
    event::{Event, Payload},
    storage::EncryptedUserSecret,
};

const SYMMETRIC_PREFIX: &str = "EVv1:";
const ASYMMETRIC_PREFIX: &str = "EVx1:";
const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;

#[derive(Clone, PartialEq, Eq)]
pub struct SymmetricKey([u8; KEY_LEN]);

impl SymmetricKey {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let bytes: [u8; KEY_LEN] = bytes
            .try_into()
            .map_err(|_| VaultError::Crypto("symmetric key must be 32 bytes".to_string()))?;
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SymmetricKey(..)")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicKey([u8; KEY_LEN]);

impl PublicKey {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

#[derive(Clone)]
pub struct PrivateKey([u8; KEY_LEN]);

impl PrivateKey {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PrivateKey(..)")
    }
}

/// Generates a fresh account keypair for wrapping aggregation secrets.
pub fn generate_keypair() -> (PublicKey, PrivateKey) {
    let secret = StaticSecret::random_from_rng(OsRng);
    let public = x25519_dalek::PublicKey::from(&secret);
    (PublicKey(public.to_bytes()), PrivateKey(secret.to_bytes()))
}

/// Opaque cryptography collaborator.
///
/// The aggregation core never inspects key or ciphertext internals; any
/// implementation producing stable string ciphertexts will do.
pub trait Crypto: Send + Sync {
    fn create_symmetric_key(&self) -> SymmetricKey;
    fn encrypt_symmetric(&self, key: &SymmetricKey, plaintext: &[u8]) -> Result<String>;
    fn decrypt_symmetric(&self, key: &SymmetricKey, ciphertext: &str) -> Result<Vec<u8>>;
    fn encrypt_asymmetric(&self, public_key: &PublicKey, plaintext: &[u8]) -> Result<String>;
    fn decrypt_asymmetric(&self, private_key: &PrivateKey, ciphertext: &str) -> Result<Vec<u8>>;
}

/// AES-256-GCM for symmetric operations; X25519 ephemeral Diffie-Hellman
/// feeding the same AES-GCM core for the asymmetric wrap. Ciphertexts are
/// base64 strings carrying a versioned prefix.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultCrypto;

impl Crypto for DefaultCrypto {
    fn create_symmetric_key(&self) -> SymmetricKey {
        let mut bytes = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut bytes);
        SymmetricKey(bytes)
    }

    fn encrypt_symmetric(&self, key: &SymmetricKey, plaintext: &[u8]) -> Result<String> {
        let sealed = seal(&key.0, plaintext)?;
        Ok(format!("{SYMMETRIC_PREFIX}{}", STANDARD.encode(sealed)))
    }

    fn decrypt_symmetric(&self, key: &SymmetricKey, ciphertext: &str) -> Result<Vec<u8>> {
        let combined = decode_prefixed(ciphertext, SYMMETRIC_PREFIX)?;
        if combined.len() <= NONCE_LEN {
            return Err(VaultError::Crypto(
                "encrypted payload too short".to_string(),
            ));
        }
        open(&key.0, &combined)
    }

    fn encrypt_asymmetric(&self, public_key: &PublicKey, plaintext: &[u8]) -> Result<String> {
        let ephemeral = EphemeralSecret::random_from_rng(OsRng);
        let ephemeral_public = x25519_dalek::PublicKey::from(&ephemeral);
        let shared = ephemeral.diffie_hellman(&x25519_dalek::PublicKey::from(public_key.0));
        let key: [u8; KEY_LEN] = Sha256::digest(shared.as_bytes()).into();

        let sealed = seal(&key, plaintext)?;
        let mut combined = Vec::with_capacity(KEY_LEN + sealed.len());
        combined.extend_from_slice(ephemeral_public.as_bytes());
        combined.extend_from_slice(&sealed);
        Ok(format!("{ASYMMETRIC_PREFIX}{}", STANDARD.encode(combined)))
    }

    fn decrypt_asymmetric(&self, private_key: &PrivateKey, ciphertext: &str) -> Result<Vec<u8>> {
        let combined = decode_prefixed(ciphertext, ASYMMETRIC_PREFIX)?;
        if combined.len() <= KEY_LEN + NONCE_LEN {
            return Err(VaultError::Crypto(
                "encrypted payload too short".to_string(),
            ));
        }
        let (ephemeral_bytes, sealed) = combined.split_at(KEY_LEN);
        let ephemeral_public: [u8; KEY_LEN] = ephemeral_bytes
            .try_into()
            .map_err(|_| VaultError::Crypto("malformed ephemeral key".to_string()))?;
        let secret = StaticSecret::from(private_key.0);
        let shared = secret.diffie_hellman(&x25519_dalek::PublicKey::from(ephemeral_public));
        let key: [u8; KEY_LEN] = Sha256::digest(shared.as_bytes()).into();
        open(&key, sealed)
    }
}

fn seal(key: &[u8; KEY_LEN], plaintext: &[u8]) -> Result<Vec<u8>> {
    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);
    #[allow(deprecated)]
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    #[allow(deprecated)]
    let nonce = Nonce::from_slice(&nonce_bytes);
    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|err| VaultError::Crypto(format!("encryption failure: {err}")))?;

    let mut combined = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    combined.extend_from_slice(&nonce_bytes);
    combined.extend_from_slice(&ciphertext);
    Ok(combined)
}

fn open(key: &[u8; KEY_LEN], combined: &[u8]) -> Result<Vec<u8>> {
    let (nonce_bytes, ciphertext) = combined.split_at(NONCE_LEN);
    #[allow(deprecated)]
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    #[allow(deprecated)]
    let nonce = Nonce::from_slice(nonce_bytes);
    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|err| VaultError::Crypto(format!("failed to decrypt payload: {err}")))
}

fn decode_prefixed(data: &str, prefix: &str) -> Result<Vec<u8>> {
    let encoded = data.strip_prefix(prefix).ok_or_else(|| {
        VaultError::Crypto("encrypted payload missing expected prefix".to_string())
    })?;
    STANDARD
        .decode(encoded)
        .map_err(|err| VaultError::Crypto(format!("invalid encrypted payload: {err}")))
}

/// Unwraps per-user symmetric keys from their asymmetrically encrypted
/// form. Secrets that fail to unwrap are skipped with a warning; events
/// referring to them will simply fail decryption later and be dropped.
pub fn unwrap_user_secrets(
    crypto: &dyn Crypto,
    encrypted: &[EncryptedUserSecret],
    private_key: &PrivateKey,
) -> HashMap<String, SymmetricKey> {
    let mut secrets = HashMap::with_capacity(encrypted.len());
    for wrapped in encrypted {
        let unwrapped = crypto
            .decrypt_asymmetric(private_key, &wrapped.value)
            .and_then(|bytes| SymmetricKey::from_bytes(&bytes));
        match unwrapped {
            Ok(key) => {
                secrets.insert(wrapped.secret_id.clone(), key);
            }
            Err(err) => {
                warn!(secret_id = %wrapped.secret_id, %err, "skipping user secret that failed to unwrap");
            }
        }
    }
    secrets
}

/// Decrypts a batch of raw events, dropping any event whose payload
/// cannot be decrypted or parsed. Events that are already decrypted pass
/// through unchanged.
pub fn decrypt_events(
    crypto: &dyn Crypto,
    events: Vec<Event>,
    user_secrets: &HashMap<String, SymmetricKey>,
    private_key: Option<&PrivateKey>,
) -> Vec<Event> {
    let mut decrypted = Vec::with_capacity(events.len());
    for mut event in events {
        let ciphertext = match &event.payload {
            Payload::Encrypted(ciphertext) => ciphertext.clone(),
            Payload::Decrypted(_) => {
                decrypted.push(event);
                continue;
            }
        };
        let plaintext = match (&event.secret_id, private_key) {
            (Some(secret_id), _) => match user_secrets.get(secret_id) {
                Some(key) => crypto.decrypt_symmetric(key, &ciphertext),
                None => Err(VaultError::Crypto(format!(
                    "no user secret {secret_id} available"
                ))),
            },
            (None, Some(private_key)) => crypto.decrypt_asymmetric(private_key, &ciphertext),
            (None, None) => Err(VaultError::MissingKeyMaterial(
                "private key required for account-encrypted events".to_string(),
            )),
        };
        let payload = plaintext
            .and_then(|bytes| serde_json::from_slice(&bytes).map_err(VaultError::from));
        match payload {
            Ok(payload) => {
                event.payload = Payload::Decrypted(payload);
                decrypted.push(event);
            }
            Err(err) => {
                warn!(event_id = %event.event_id, %err, "dropping event that failed to decrypt");
            }
        }
    }
    decrypted
}
