//! EncryptionEngine - High-level encryption API
//!
//! Owns the key ring (current key pair plus retained previous pairs), the
//! shared-secret cache and the key store.
//!
//! ## Example
//!
//! ```rust,ignore
//! use chainchat_core::crypto::EncryptionEngine;
//!
//! let engine = EncryptionEngine::open(pool, storage_key, 3).await?;
//!
//! // Encrypt for a counterpart
//! let ciphertext = engine.encrypt("0xbob", &bob_public_key, b"Hello!").await?;
//!
//! // Decrypt anything addressed to (or sent by) one of our retained keys
//! let plaintext = engine.decrypt(&ciphertext).await?;
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use sqlx::SqlitePool;
use tokio::sync::RwLock;
use x25519_dalek::PublicKey;
use zeroize::Zeroizing;

use crate::crypto::envelope::{self, Envelope};
use crate::crypto::errors::{CryptoError, CryptoResult};
use crate::crypto::keys::{derive_shared_secret, parse_public_key, KeyPair, SharedSecret};
use crate::crypto::keystore::{KeyStore, StorageKey};

/// Cached conversation secret for one counterpart address
struct CachedSecret {
    own_key_id: String,
    counterpart: PublicKey,
    secret: SharedSecret,
}

/// Current key pair, retained pairs (newest first) and the secret cache.
///
/// Replaced under one write lock on rotation, so readers see either the old
/// ring with its cache or the new ring with an empty cache.
struct KeyRing {
    current: Arc<KeyPair>,
    retired: Vec<Arc<KeyPair>>,
    cache: HashMap<String, CachedSecret>,
}

impl KeyRing {
    fn keys(&self) -> impl Iterator<Item = &Arc<KeyPair>> {
        std::iter::once(&self.current).chain(self.retired.iter())
    }
}

/// High-level encryption service
///
/// Thread-safe; shared behind an `Arc` by the queue, sync engine and read model.
pub struct EncryptionEngine {
    store: KeyStore,
    ring: RwLock<KeyRing>,
    retention: usize,
}

impl EncryptionEngine {
    /// Open the engine, loading the key ring or creating a first key pair
    pub async fn open(db: SqlitePool, storage_key: StorageKey, retention: usize) -> CryptoResult<Self> {
        let store = KeyStore::new(db, storage_key);

        let mut stored = store.load_all().await?;
        let has_current = stored.first().map_or(false, |s| s.retired_at.is_none());
        let current = if has_current {
            let current = Arc::new(stored.remove(0).key_pair);
            tracing::info!("Loaded key ring, current key {}", current.key_id());
            current
        } else {
            let key_pair = Self::generate_key_pair()?;
            store.save_current(&key_pair).await?;
            tracing::info!("Created new key pair {}", key_pair.key_id());
            Arc::new(key_pair)
        };

        let retired = stored
            .into_iter()
            .filter(|s| s.retired_at.is_some())
            .take(retention)
            .map(|s| Arc::new(s.key_pair))
            .collect();

        Ok(Self {
            store,
            ring: RwLock::new(KeyRing {
                current,
                retired,
                cache: HashMap::new(),
            }),
            retention,
        })
    }

    /// Generate a fresh key pair
    pub fn generate_key_pair() -> CryptoResult<KeyPair> {
        KeyPair::generate()
    }

    /// Derive the conversation secret for an own key pair and a counterpart key
    pub fn derive_shared_secret(own: &KeyPair, counterpart: &PublicKey) -> CryptoResult<SharedSecret> {
        derive_shared_secret(own, counterpart)
    }

    /// Our current public key (to publish to counterparts)
    pub async fn public_key(&self) -> PublicKey {
        self.ring.read().await.current.public
    }

    /// Identifier of the current key epoch
    pub async fn key_id(&self) -> String {
        self.ring.read().await.current.key_id()
    }

    /// Number of key pairs able to decrypt (current + retained)
    pub async fn key_count(&self) -> usize {
        let ring = self.ring.read().await;
        1 + ring.retired.len()
    }

    /// Number of cached conversation secrets
    pub async fn cached_secrets(&self) -> usize {
        self.ring.read().await.cache.len()
    }

    /// Encrypt `plaintext` for the counterpart at `counterpart_address`
    ///
    /// Returns the base64 envelope.
    pub async fn encrypt(
        &self,
        counterpart_address: &str,
        counterpart_public: &[u8],
        plaintext: &[u8],
    ) -> CryptoResult<String> {
        let counterpart = parse_public_key(counterpart_public)
            .map_err(|e| CryptoError::EncryptionError(e.to_string()))?;

        let (own, cached) = {
            let ring = self.ring.read().await;
            let cached = ring.cache.get(counterpart_address).and_then(|c| {
                (c.own_key_id == ring.current.key_id() && c.counterpart == counterpart)
                    .then(|| c.secret.clone())
            });
            (Arc::clone(&ring.current), cached)
        };

        let secret = match cached {
            Some(secret) => secret,
            None => {
                let secret = derive_shared_secret(&own, &counterpart)
                    .map_err(|e| CryptoError::EncryptionError(e.to_string()))?;

                let mut ring = self.ring.write().await;
                // A rotation in between owns a fresh cache; keep the stale secret out of it
                if ring.current.key_id() == own.key_id() {
                    ring.cache.insert(
                        counterpart_address.to_string(),
                        CachedSecret {
                            own_key_id: own.key_id(),
                            counterpart,
                            secret: secret.clone(),
                        },
                    );
                }
                secret
            }
        };

        let bytes = envelope::seal(plaintext, &own, &counterpart, &secret)?;
        Ok(envelope::encode(&bytes))
    }

    /// Decrypt with whichever retained key pair the envelope names
    ///
    /// `KeyUnavailable` means none of our keys is an endpoint of the envelope.
    pub async fn decrypt(&self, ciphertext: &str) -> CryptoResult<Zeroizing<Vec<u8>>> {
        let bytes = envelope::decode(ciphertext)?;
        let envelope = Envelope::parse(&bytes)?;

        let ring = self.ring.read().await;
        for own in ring.keys() {
            if let Some(counterpart) = envelope.counterpart_of(&own.public) {
                let secret = derive_shared_secret(own, &counterpart)
                    .map_err(|e| CryptoError::DecryptionError(e.to_string()))?;
                return envelope.open(&secret);
            }
        }

        Err(CryptoError::KeyUnavailable(format!(
            "envelope keys {} / {}",
            crate::crypto::keys::fingerprint(&envelope.sender_key),
            crate::crypto::keys::fingerprint(&envelope.recipient_key)
        )))
    }

    /// Decrypt with an explicit own key pair
    pub fn decrypt_with_key(ciphertext: &str, own: &KeyPair) -> CryptoResult<Zeroizing<Vec<u8>>> {
        let bytes = envelope::decode(ciphertext)?;
        let envelope = Envelope::parse(&bytes)?;
        let counterpart = envelope.counterpart_of(&own.public).ok_or_else(|| {
            CryptoError::KeyUnavailable(format!("key {} is not an endpoint", own.key_id()))
        })?;
        let secret = derive_shared_secret(own, &counterpart)
            .map_err(|e| CryptoError::DecryptionError(e.to_string()))?;
        envelope.open(&secret)
    }

    /// Rotate to a new key pair
    ///
    /// The previous pair is retained for decryption, pairs beyond the
    /// retention count are dropped, and the secret cache is cleared.
    pub async fn rotate_keys(&self) -> CryptoResult<PublicKey> {
        let next = Self::generate_key_pair()?;

        let mut ring = self.ring.write().await;
        self.store.rotate(&next, self.retention).await?;

        let next = Arc::new(next);
        let previous = std::mem::replace(&mut ring.current, Arc::clone(&next));
        ring.retired.insert(0, previous);
        ring.retired.truncate(self.retention);
        ring.cache.clear();

        tracing::info!(
            "Rotated key pair, current key {}, {} retained",
            next.key_id(),
            ring.retired.len()
        );
        Ok(next.public)
    }
}
