//! Error types for the chainchat core

use thiserror::Error;

use crate::crypto::CryptoError;
use crate::models::MessageStatus;

/// Core-wide error type
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Key generation error: {0}")]
    KeyGeneration(String),

    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("Decryption error: {0}")]
    Decryption(String),

    /// The ciphertext is addressed to a key we do not hold (other recipient or pruned epoch)
    #[error("No key available for ciphertext: {0}")]
    KeyUnavailable(String),

    #[error("Persistence error: {0}")]
    Persistence(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Ledger submission failed: {0}")]
    Submission(String),

    #[error("Ledger call timed out after {0} ms")]
    Timeout(u64),

    #[error("Invalid status transition for {id}: {from} -> {to}")]
    InvalidTransition {
        id: String,
        from: MessageStatus,
        to: MessageStatus,
    },

    #[error("Message not found: {0}")]
    NotFound(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Failures the sync engine recovers from by retrying with backoff
    pub fn is_retryable(&self) -> bool {
        matches!(self, CoreError::Submission(_) | CoreError::Timeout(_))
    }

    /// Decryption failures that are skipped during batch processing
    pub fn is_benign_decrypt(&self) -> bool {
        matches!(self, CoreError::Decryption(_) | CoreError::KeyUnavailable(_))
    }
}

impl From<CryptoError> for CoreError {
    fn from(e: CryptoError) -> Self {
        match e {
            CryptoError::KeyGenerationFailed(m) => CoreError::KeyGeneration(m),
            CryptoError::InvalidKey(m) | CryptoError::EncryptionError(m) => {
                CoreError::Encryption(m)
            }
            CryptoError::DecryptionError(m) => CoreError::Decryption(m),
            CryptoError::KeyUnavailable(m) => CoreError::KeyUnavailable(m),
            CryptoError::DatabaseError(e) => CoreError::Persistence(e),
            CryptoError::SerializationError(m) => CoreError::Internal(m),
        }
    }
}

/// Result type alias for core operations
pub type CoreResult<T> = Result<T, CoreError>;

// Errors cross IPC/FFI boundaries as their display string
impl serde::Serialize for CoreError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(CoreError::Submission("rejected".into()).is_retryable());
        assert!(CoreError::Timeout(30_000).is_retryable());
        assert!(!CoreError::NotFound("x".into()).is_retryable());
        assert!(!CoreError::InvalidTransition {
            id: "x".into(),
            from: MessageStatus::Confirmed,
            to: MessageStatus::Pending,
        }
        .is_retryable());
    }

    #[test]
    fn test_crypto_error_mapping() {
        let err: CoreError = CryptoError::KeyUnavailable("abc".into()).into();
        assert!(err.is_benign_decrypt());
        let err: CoreError = CryptoError::DecryptionError("tag".into()).into();
        assert!(matches!(err, CoreError::Decryption(_)));
    }

    #[test]
    fn test_serializes_as_string() {
        let err = CoreError::Timeout(5);
        let json = serde_json::to_string(&err).unwrap();
        assert_eq!(json, "\"Ledger call timed out after 5 ms\"");
    }
}
