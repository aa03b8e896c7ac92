//! Key Storage
//!
//! Persists the current key pair and the retained previous key pairs in the
//! local SQLite database. Secret keys are wrapped with AES-256-GCM under a
//! device storage key before they are written.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use sqlx::{Row, SqlitePool};
use zeroize::Zeroizing;

use crate::crypto::errors::{CryptoError, CryptoResult};
use crate::crypto::keys::KeyPair;

/// Key for wrapping private keys at rest
pub type StorageKey = [u8; 32];

const WRAP_NONCE_LEN: usize = 12;

/// A key pair loaded from storage
#[derive(Debug)]
pub struct StoredKeyPair {
    pub key_pair: KeyPair,
    /// `None` for the current key pair
    pub retired_at: Option<i64>,
}

/// Manages storage and retrieval of key pairs
pub struct KeyStore {
    /// Database connection pool
    db: SqlitePool,
    /// Key for wrapping secret keys before storage
    storage_key: Zeroizing<StorageKey>,
}

impl KeyStore {
    /// Create a new key store
    pub fn new(db: SqlitePool, storage_key: StorageKey) -> Self {
        Self {
            db,
            storage_key: Zeroizing::new(storage_key),
        }
    }

    /// Save a key pair as the current one
    pub async fn save_current(&self, key_pair: &KeyPair) -> CryptoResult<()> {
        let key_id = key_pair.key_id();
        let wrapped = self.wrap_secret(&key_id, &key_pair.secret_key_bytes()[..])?;

        sqlx::query(
            r#"
            INSERT INTO key_pairs (key_id, public_key, wrapped_secret, created_at, retired_at)
            VALUES ($1, $2, $3, $4, NULL)
            "#,
        )
        .bind(&key_id)
        .bind(hex::encode(key_pair.public_key_bytes()))
        .bind(&wrapped)
        .bind(key_pair.created_at)
        .execute(&self.db)
        .await?;

        Ok(())
    }

    /// Load all key pairs, current first, then retired pairs newest first
    pub async fn load_all(&self) -> CryptoResult<Vec<StoredKeyPair>> {
        let rows = sqlx::query(
            r#"
            SELECT key_id, public_key, wrapped_secret, created_at, retired_at
            FROM key_pairs
            ORDER BY retired_at IS NOT NULL, retired_at DESC, created_at DESC
            "#,
        )
        .fetch_all(&self.db)
        .await?;

        let mut pairs = Vec::with_capacity(rows.len());
        for row in rows {
            let key_id: String = row.get("key_id");
            let public_hex: String = row.get("public_key");
            let wrapped: String = row.get("wrapped_secret");
            let created_at: i64 = row.get("created_at");
            let retired_at: Option<i64> = row.get("retired_at");

            let public = hex::decode(&public_hex).map_err(|e| {
                CryptoError::SerializationError(format!("Failed to decode public key: {}", e))
            })?;
            let secret = self.unwrap_secret(&key_id, &wrapped)?;
            let key_pair = KeyPair::from_bytes(&public, &secret[..], created_at)?;

            pairs.push(StoredKeyPair {
                key_pair,
                retired_at,
            });
        }

        Ok(pairs)
    }

    /// Retire the current key pair, store `next` as current and prune retired
    /// pairs beyond `retention`, all in one transaction
    pub async fn rotate(&self, next: &KeyPair, retention: usize) -> CryptoResult<()> {
        let key_id = next.key_id();
        let wrapped = self.wrap_secret(&key_id, &next.secret_key_bytes()[..])?;
        let now = chrono::Utc::now().timestamp_millis();

        let mut tx = self.db.begin().await?;

        sqlx::query(r#"UPDATE key_pairs SET retired_at = $1 WHERE retired_at IS NULL"#)
            .bind(now)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            r#"
            INSERT INTO key_pairs (key_id, public_key, wrapped_secret, created_at, retired_at)
            VALUES ($1, $2, $3, $4, NULL)
            "#,
        )
        .bind(&key_id)
        .bind(hex::encode(next.public_key_bytes()))
        .bind(&wrapped)
        .bind(next.created_at)
        .execute(&mut *tx)
        .await?;

        let pruned = sqlx::query(
            r#"
            DELETE FROM key_pairs
            WHERE retired_at IS NOT NULL AND key_id NOT IN (
                SELECT key_id FROM key_pairs
                WHERE retired_at IS NOT NULL
                ORDER BY retired_at DESC, created_at DESC
                LIMIT $1
            )
            "#,
        )
        .bind(retention as i64)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        if pruned.rows_affected() > 0 {
            tracing::info!("Pruned {} expired key pairs", pruned.rows_affected());
        }
        Ok(())
    }

    fn wrap_secret(&self, key_id: &str, secret: &[u8]) -> CryptoResult<String> {
        let mut nonce = [0u8; WRAP_NONCE_LEN];
        OsRng
            .try_fill_bytes(&mut nonce)
            .map_err(|e| CryptoError::EncryptionError(format!("Randomness unavailable: {}", e)))?;

        let cipher = Aes256Gcm::new_from_slice(&self.storage_key[..])
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        let ciphertext = cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: secret,
                    aad: key_id.as_bytes(),
                },
            )
            .map_err(|_| CryptoError::EncryptionError("Key wrapping failed".to_string()))?;

        let mut out = Vec::with_capacity(WRAP_NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(base64::engine::general_purpose::STANDARD.encode(out))
    }

    fn unwrap_secret(&self, key_id: &str, wrapped: &str) -> CryptoResult<Zeroizing<Vec<u8>>> {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(wrapped)
            .map_err(|e| {
                CryptoError::SerializationError(format!("Failed to decode wrapped key: {}", e))
            })?;
        if bytes.len() <= WRAP_NONCE_LEN {
            return Err(CryptoError::SerializationError(
                "Wrapped key too short".to_string(),
            ));
        }

        let (nonce, ciphertext) = bytes.split_at(WRAP_NONCE_LEN);
        let cipher = Aes256Gcm::new_from_slice(&self.storage_key[..])
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        let secret = cipher
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: ciphertext,
                    aad: key_id.as_bytes(),
                },
            )
            .map_err(|_| CryptoError::InvalidKey(format!("Cannot unwrap key {}", key_id)))?;
        Ok(Zeroizing::new(secret))
    }
}

/// Derive a storage key from a device secret
pub fn derive_storage_key(secret: &[u8], salt: &[u8]) -> CryptoResult<StorageKey> {
    use hkdf::Hkdf;
    use sha2::Sha256;

    let hkdf = Hkdf::<Sha256>::new(Some(salt), secret);
    let mut key = [0u8; 32];
    hkdf.expand(b"chainchat storage key v1", &mut key)
        .map_err(|e| CryptoError::InvalidKey(format!("HKDF expand failed: {}", e)))?;
    Ok(key)
}

/// Generate a random storage key (for new installations)
pub fn generate_storage_key() -> CryptoResult<StorageKey> {
    let mut key = [0u8; 32];
    OsRng
        .try_fill_bytes(&mut key)
        .map_err(|e| CryptoError::KeyGenerationFailed(e.to_string()))?;
    Ok(key)
}
