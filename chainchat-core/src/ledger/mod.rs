//! Ledger and signer boundaries
//!
//! The ledger is an append-only store of `(sender, recipient, ciphertext)`
//! records, queryable per counterpart pair. The core only talks to it through
//! the [`Ledger`] trait; [`memory`] provides an in-process implementation.

pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;

use crate::error::CoreError;

/// A message record as stored on the ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerRecord {
    /// Position in the ledger, strictly increasing
    pub index: u64,
    pub sender: String,
    pub recipient: String,
    pub ciphertext: String,
    /// Ledger (block) time in ms
    pub timestamp: i64,
}

/// Acknowledgment of an accepted submission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Confirmation {
    pub index: u64,
    pub timestamp: i64,
}

/// Event emitted by the ledger when a message is stored
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum LedgerEvent {
    MessageSent { from: String, to: String, timestamp: i64 },
}

/// Errors reported by a ledger implementation
#[derive(Debug, Error)]
pub enum LedgerError {
    /// The ledger refused the submission
    #[error("Rejected by ledger: {0}")]
    Rejected(String),

    /// The ledger could not be reached
    #[error("Ledger unavailable: {0}")]
    Unavailable(String),
}

impl From<LedgerError> for CoreError {
    fn from(e: LedgerError) -> Self {
        CoreError::Submission(e.to_string())
    }
}

/// Append-only message ledger
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Submit a ciphertext from the session's address to `recipient`
    async fn submit(&self, recipient: &str, ciphertext: &str) -> Result<Confirmation, LedgerError>;

    /// Records exchanged with `counterpart` (both directions) with an index
    /// above `since`, ordered by index
    async fn fetch_history(
        &self,
        counterpart: &str,
        since: u64,
    ) -> Result<Vec<LedgerRecord>, LedgerError>;

    /// Optional `MessageSent` event stream
    fn subscribe(&self) -> Option<broadcast::Receiver<LedgerEvent>> {
        None
    }
}

/// Identity that owns the ledger session
pub trait Signer: Send + Sync {
    fn address(&self) -> String;

    fn sign(&self, payload: &[u8]) -> Result<Vec<u8>, LedgerError>;
}
