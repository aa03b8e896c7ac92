//! End-to-end encryption module
//!
//! Messages are encrypted with a static-static X25519 key agreement between the
//! sender's current key pair and the recipient's published public key, so no
//! handshake round-trip is needed before the first message.
//!
//! ## Components
//!
//! - **keys**: Key pairs, shared-secret derivation, fingerprints
//! - **envelope**: Authenticated ciphertext wire format
//! - **keystore**: Wrapped key pair persistence (SQLite-backed)
//! - **service**: High-level EncryptionEngine facade with key rotation
//!
//! ## Usage
//!
//! ```rust,ignore
//! use chainchat_core::crypto::EncryptionEngine;
//!
//! let engine = EncryptionEngine::open(db_pool, storage_key, 3).await?;
//! let ciphertext = engine.encrypt(peer_address, &peer_public_key, plaintext).await?;
//! let plaintext = engine.decrypt(&ciphertext).await?;
//! ```

pub mod envelope;
pub mod errors;
pub mod keys;
pub mod keystore;
pub mod service;

// Re-export commonly used types
pub use errors::{CryptoError, CryptoResult};
pub use keys::{derive_shared_secret, fingerprint, parse_public_key, KeyPair, SharedSecret};
pub use keystore::{derive_storage_key, generate_storage_key, KeyStore, StorageKey};
pub use service::EncryptionEngine;
