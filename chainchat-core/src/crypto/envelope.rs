//! Ciphertext envelope
//!
//! Wire format (base64 encoded on the ledger):
//!
//! ```text
//! [ version (1) | sender key (32) | recipient key (32) | salt (16) | nonce (12)
//!   | ciphertext + tag | checksum (8) ]
//! ```
//!
//! The per-message AES-256-GCM key is HKDF(shared secret, salt), so each message
//! gets a fresh key and nonce. The header is authenticated as associated data.
//! Both public keys travel in the header: either party can locate its own key
//! pair and derive the same shared secret, which lets the sender read back its
//! own messages. The trailing checksum (truncated SHA-256 over everything before
//! it) classifies corrupted frames as `DecryptionError` before any key lookup.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::Engine;
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use x25519_dalek::PublicKey;
use zeroize::Zeroizing;

use crate::crypto::errors::{CryptoError, CryptoResult};
use crate::crypto::keys::{parse_public_key, KeyPair, SharedSecret};

/// Current envelope version
pub const ENVELOPE_VERSION: u8 = 1;

const KEY_LEN: usize = 32;
const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const CHECKSUM_LEN: usize = 8;
const HEADER_LEN: usize = 1 + KEY_LEN + KEY_LEN + SALT_LEN + NONCE_LEN;
const MESSAGE_KEY_INFO: &[u8] = b"chainchat message key v1";

/// Parsed, checksum-verified envelope
#[derive(Debug)]
pub struct Envelope<'a> {
    pub sender_key: PublicKey,
    pub recipient_key: PublicKey,
    salt: &'a [u8],
    nonce: &'a [u8],
    header: &'a [u8],
    ciphertext: &'a [u8],
}

impl<'a> Envelope<'a> {
    /// Parse raw envelope bytes
    pub fn parse(bytes: &'a [u8]) -> CryptoResult<Self> {
        if bytes.len() < HEADER_LEN + TAG_LEN + CHECKSUM_LEN {
            return Err(CryptoError::DecryptionError("Envelope too short".to_string()));
        }

        let (body, checksum) = bytes.split_at(bytes.len() - CHECKSUM_LEN);
        if checksum_of(body).as_slice() != checksum {
            return Err(CryptoError::DecryptionError(
                "Envelope checksum mismatch".to_string(),
            ));
        }

        if body[0] != ENVELOPE_VERSION {
            return Err(CryptoError::DecryptionError(format!(
                "Unknown envelope version: {}",
                body[0]
            )));
        }

        let (header, ciphertext) = body.split_at(HEADER_LEN);
        let sender_key = parse_public_key(&header[1..1 + KEY_LEN])?;
        let recipient_key = parse_public_key(&header[1 + KEY_LEN..1 + 2 * KEY_LEN])?;
        let salt_start = 1 + 2 * KEY_LEN;
        let nonce_start = salt_start + SALT_LEN;

        Ok(Self {
            sender_key,
            recipient_key,
            salt: &header[salt_start..nonce_start],
            nonce: &header[nonce_start..HEADER_LEN],
            header,
            ciphertext,
        })
    }

    /// The other party's key if `own` is one of the two endpoints
    pub fn counterpart_of(&self, own: &PublicKey) -> Option<PublicKey> {
        if &self.sender_key == own {
            Some(self.recipient_key)
        } else if &self.recipient_key == own {
            Some(self.sender_key)
        } else {
            None
        }
    }

    /// Decrypt with the conversation secret
    pub fn open(&self, shared: &SharedSecret) -> CryptoResult<Zeroizing<Vec<u8>>> {
        let key = message_key(shared, self.salt)?;
        let cipher = Aes256Gcm::new_from_slice(&key[..])
            .map_err(|e| CryptoError::DecryptionError(e.to_string()))?;

        let plaintext = cipher.decrypt(
            Nonce::from_slice(self.nonce),
            Payload {
                msg: self.ciphertext,
                aad: self.header,
            },
        )?;
        Ok(Zeroizing::new(plaintext))
    }
}

/// Encrypt `plaintext` from `own` to `counterpart` under their shared secret
pub fn seal(
    plaintext: &[u8],
    own: &KeyPair,
    counterpart: &PublicKey,
    shared: &SharedSecret,
) -> CryptoResult<Vec<u8>> {
    let mut salt = [0u8; SALT_LEN];
    let mut nonce = [0u8; NONCE_LEN];
    OsRng
        .try_fill_bytes(&mut salt)
        .and_then(|_| OsRng.try_fill_bytes(&mut nonce))
        .map_err(|e| CryptoError::EncryptionError(format!("Randomness unavailable: {}", e)))?;

    let mut out = Vec::with_capacity(HEADER_LEN + plaintext.len() + TAG_LEN + CHECKSUM_LEN);
    out.push(ENVELOPE_VERSION);
    out.extend_from_slice(own.public.as_bytes());
    out.extend_from_slice(counterpart.as_bytes());
    out.extend_from_slice(&salt);
    out.extend_from_slice(&nonce);

    let key = message_key(shared, &salt)?;
    let cipher = Aes256Gcm::new_from_slice(&key[..])
        .map_err(|e| CryptoError::EncryptionError(e.to_string()))?;
    let ciphertext = cipher
        .encrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: plaintext,
                aad: &out[..HEADER_LEN],
            },
        )
        .map_err(|_| CryptoError::EncryptionError("AES-GCM operation failed".to_string()))?;

    out.extend_from_slice(&ciphertext);
    let checksum = checksum_of(&out);
    out.extend_from_slice(&checksum);
    Ok(out)
}

/// Base64 text form used on the ledger and in the queue
pub fn encode(bytes: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

/// Decode the base64 text form
pub fn decode(text: &str) -> CryptoResult<Vec<u8>> {
    base64::engine::general_purpose::STANDARD
        .decode(text)
        .map_err(|e| CryptoError::DecryptionError(format!("Invalid envelope encoding: {}", e)))
}

fn message_key(shared: &SharedSecret, salt: &[u8]) -> CryptoResult<Zeroizing<[u8; 32]>> {
    let hkdf = Hkdf::<Sha256>::new(Some(salt), shared.as_bytes());
    let mut key = Zeroizing::new([0u8; 32]);
    hkdf.expand(MESSAGE_KEY_INFO, &mut key[..])
        .map_err(|e| CryptoError::EncryptionError(format!("HKDF expand failed: {}", e)))?;
    Ok(key)
}

fn checksum_of(bytes: &[u8]) -> [u8; CHECKSUM_LEN] {
    let hash = Sha256::digest(bytes);
    let mut out = [0u8; CHECKSUM_LEN];
    out.copy_from_slice(&hash[..CHECKSUM_LEN]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::keys::derive_shared_secret;

    fn sealed(plaintext: &[u8]) -> (KeyPair, KeyPair, Vec<u8>) {
        let alice = KeyPair::generate().unwrap();
        let bob = KeyPair::generate().unwrap();
        let shared = derive_shared_secret(&alice, &bob.public).unwrap();
        let bytes = seal(plaintext, &alice, &bob.public, &shared).unwrap();
        (alice, bob, bytes)
    }

    #[test]
    fn test_both_parties_can_open() {
        let (alice, bob, bytes) = sealed(b"hello");
        let envelope = Envelope::parse(&bytes).unwrap();

        let counterpart = envelope.counterpart_of(&bob.public).unwrap();
        assert_eq!(counterpart, alice.public);
        let shared = derive_shared_secret(&bob, &counterpart).unwrap();
        assert_eq!(&envelope.open(&shared).unwrap()[..], b"hello");

        let counterpart = envelope.counterpart_of(&alice.public).unwrap();
        let shared = derive_shared_secret(&alice, &counterpart).unwrap();
        assert_eq!(&envelope.open(&shared).unwrap()[..], b"hello");
    }

    #[test]
    fn test_stranger_has_no_counterpart() {
        let (_, _, bytes) = sealed(b"hello");
        let eve = KeyPair::generate().unwrap();
        let envelope = Envelope::parse(&bytes).unwrap();
        assert!(envelope.counterpart_of(&eve.public).is_none());
    }

    #[test]
    fn test_fresh_salt_and_nonce_per_message() {
        let alice = KeyPair::generate().unwrap();
        let bob = KeyPair::generate().unwrap();
        let shared = derive_shared_secret(&alice, &bob.public).unwrap();
        let first = seal(b"same", &alice, &bob.public, &shared).unwrap();
        let second = seal(b"same", &alice, &bob.public, &shared).unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn test_short_and_garbage_input_rejected() {
        assert!(matches!(
            Envelope::parse(&[1, 2, 3]),
            Err(CryptoError::DecryptionError(_))
        ));
        assert!(matches!(
            decode("not base64!!"),
            Err(CryptoError::DecryptionError(_))
        ));
    }

    #[test]
    fn test_wrong_secret_fails_authentication() {
        let (_, _, bytes) = sealed(b"hello");
        let mallory = KeyPair::generate().unwrap();
        let other = KeyPair::generate().unwrap();
        let wrong = derive_shared_secret(&mallory, &other.public).unwrap();
        let envelope = Envelope::parse(&bytes).unwrap();
        assert!(matches!(
            envelope.open(&wrong),
            Err(CryptoError::DecryptionError(_))
        ));
    }
}
