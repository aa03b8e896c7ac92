//! Cryptographic error types
//!
//! `DecryptionError` and `KeyUnavailable` are deliberately separate: the first
//! means the bytes are bad (corrupted, tampered, wrong key), the second means
//! the ciphertext belongs to a key pair this device does not hold.

use thiserror::Error;

/// Errors that can occur during cryptographic operations
#[derive(Debug, Error)]
pub enum CryptoError {
    /// The randomness source failed
    #[error("Key generation failed: {0}")]
    KeyGenerationFailed(String),

    /// Failed to parse or use a key
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    /// Encryption failed
    #[error("Encryption failed: {0}")]
    EncryptionError(String),

    /// Corrupted ciphertext or authentication tag mismatch
    #[error("Decryption failed: {0}")]
    DecryptionError(String),

    /// Ciphertext is not addressed to any retained key pair
    #[error("No matching key pair: {0}")]
    KeyUnavailable(String),

    /// Database error
    #[error("Database error: {0}")]
    DatabaseError(#[from] sqlx::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl From<aes_gcm::Error> for CryptoError {
    fn from(_: aes_gcm::Error) -> Self {
        CryptoError::DecryptionError("AES-GCM authentication failed".to_string())
    }
}

/// Result type for cryptographic operations
pub type CryptoResult<T> = Result<T, CryptoError>;
