//! Key types and key agreement
//!
//! Every identity holds one X25519 key pair per key epoch. Conversations derive
//! a shared secret from (own secret, counterpart public) with X25519 followed by
//! HKDF-SHA256, so both parties arrive at the same secret independently.

use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

use crate::crypto::errors::{CryptoError, CryptoResult};

const SHARED_SECRET_SALT: &[u8] = b"chainchat shared secret v1";

/// X25519 key pair for one key epoch
///
/// The secret never leaves this type except through `secret_key_bytes`, which
/// exists only so the key store can wrap it for storage.
pub struct KeyPair {
    /// Public key (safe to share)
    pub public: PublicKey,
    /// Secret key (never leaves device, zeroized on drop)
    secret: StaticSecret,
    /// Unix timestamp (ms) when this pair was generated
    pub created_at: i64,
}

impl KeyPair {
    /// Generate a new random key pair from the OS randomness source
    pub fn generate() -> CryptoResult<Self> {
        let mut seed = Zeroizing::new([0u8; 32]);
        OsRng
            .try_fill_bytes(&mut seed[..])
            .map_err(|e| CryptoError::KeyGenerationFailed(e.to_string()))?;

        let secret = StaticSecret::from(*seed);
        let public = PublicKey::from(&secret);
        Ok(Self {
            public,
            secret,
            created_at: chrono::Utc::now().timestamp_millis(),
        })
    }

    /// Restore from stored key bytes, checking that both halves belong together
    pub fn from_bytes(public_bytes: &[u8], secret_bytes: &[u8], created_at: i64) -> CryptoResult<Self> {
        let public = parse_public_key(public_bytes)?;
        let secret_arr: Zeroizing<[u8; 32]> = Zeroizing::new(
            secret_bytes
                .try_into()
                .map_err(|_| CryptoError::InvalidKey("Secret key must be 32 bytes".to_string()))?,
        );

        let secret = StaticSecret::from(*secret_arr);
        if PublicKey::from(&secret) != public {
            return Err(CryptoError::InvalidKey(
                "Public key does not match secret key".to_string(),
            ));
        }

        Ok(Self {
            public,
            secret,
            created_at,
        })
    }

    /// Get the public key bytes
    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.public.to_bytes()
    }

    /// Get the secret key bytes (for wrapping before storage)
    pub fn secret_key_bytes(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(self.secret.to_bytes())
    }

    /// Short identifier of this key epoch
    pub fn key_id(&self) -> String {
        fingerprint(&self.public)
    }

    pub(crate) fn secret(&self) -> &StaticSecret {
        &self.secret
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("key_id", &self.key_id())
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

/// Symmetric secret shared by two key pairs
pub struct SharedSecret(Zeroizing<[u8; 32]>);

impl SharedSecret {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl Clone for SharedSecret {
    fn clone(&self) -> Self {
        Self(Zeroizing::new(*self.0))
    }
}

impl std::fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SharedSecret(..)")
    }
}

/// Derive the conversation secret for (own key pair, counterpart public key)
///
/// Deterministic and symmetric: both parties compute the same value. X25519 is
/// constant time; the HKDF info binds both public keys in sorted order.
pub fn derive_shared_secret(own: &KeyPair, counterpart: &PublicKey) -> CryptoResult<SharedSecret> {
    let dh = own.secret().diffie_hellman(counterpart);
    if !dh.was_contributory() {
        return Err(CryptoError::InvalidKey(
            "Counterpart public key is a low-order point".to_string(),
        ));
    }

    let own_public = own.public.to_bytes();
    let their_public = counterpart.to_bytes();
    let (first, second) = if own_public <= their_public {
        (own_public, their_public)
    } else {
        (their_public, own_public)
    };
    let mut info = Vec::with_capacity(64);
    info.extend_from_slice(&first);
    info.extend_from_slice(&second);

    let hkdf = Hkdf::<Sha256>::new(Some(SHARED_SECRET_SALT), dh.as_bytes());
    let mut out = Zeroizing::new([0u8; 32]);
    hkdf.expand(&info, &mut out[..])
        .map_err(|e| CryptoError::InvalidKey(format!("HKDF expand failed: {}", e)))?;
    Ok(SharedSecret(out))
}

/// Parse a 32-byte X25519 public key
pub fn parse_public_key(bytes: &[u8]) -> CryptoResult<PublicKey> {
    let arr: [u8; 32] = bytes
        .try_into()
        .map_err(|_| CryptoError::InvalidKey("Public key must be 32 bytes".to_string()))?;
    Ok(PublicKey::from(arr))
}

/// Hex fingerprint of a public key (first 8 bytes of SHA-256)
pub fn fingerprint(public: &PublicKey) -> String {
    let hash = Sha256::digest(public.as_bytes());
    hex::encode(&hash[..8])
}
