//! Shared data types for the queue, the sync engine and the read model

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

// ============================================================================
// Message Types
// ============================================================================

/// Delivery status of a message
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Pending,
    Submitting,
    Confirmed,
    Failed,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Pending => "pending",
            MessageStatus::Submitting => "submitting",
            MessageStatus::Confirmed => "confirmed",
            MessageStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MessageStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(MessageStatus::Pending),
            "submitting" => Ok(MessageStatus::Submitting),
            "confirmed" => Ok(MessageStatus::Confirmed),
            "failed" => Ok(MessageStatus::Failed),
            other => Err(CoreError::Internal(format!("Unknown message status: {}", other))),
        }
    }
}

/// A chat message
///
/// `plaintext` only ever lives in memory; the durable layers store `ciphertext`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub sender: String,
    pub recipient: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plaintext: Option<String>,
    /// Base64 envelope as stored on the ledger
    pub ciphertext: String,
    /// Client creation time in milliseconds since the epoch
    pub timestamp: i64,
    pub status: MessageStatus,
    /// Reason of the last failed attempt, shown for `failed` messages
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Payload sealed inside every envelope
///
/// Carries the message id and creation time so any party reading ledger
/// history can dedup and order without trusting ledger metadata.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SealedBody {
    pub id: String,
    pub sent_at: i64,
    pub body: String,
}

impl SealedBody {
    pub fn to_bytes(&self) -> CoreResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> CoreResult<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| CoreError::Decryption(format!("Malformed sealed body: {}", e)))
    }
}

// ============================================================================
// Queue Types
// ============================================================================

/// A queued outbound message with sync bookkeeping
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct QueueEntry {
    pub message: Message,
    pub attempt_count: u32,
    /// Earliest time (ms) the next attempt may run
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_retry_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Ledger position once confirmed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ledger_index: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ledger_timestamp: Option<i64>,
}

impl QueueEntry {
    pub fn id(&self) -> &str {
        &self.message.id
    }

    pub fn status(&self) -> MessageStatus {
        self.message.status
    }

    pub fn is_due(&self, now: i64) -> bool {
        self.next_retry_at.map_or(true, |at| now >= at)
    }

    /// The outcome of an earlier attempt is unknown: the process died while
    /// `submitting`, or an earlier attempt failed after the request may have
    /// reached the ledger. A user retry keeps `last_error`, so a reset entry
    /// stays in doubt.
    pub fn is_in_doubt(&self) -> bool {
        self.message.status == MessageStatus::Submitting
            || self.attempt_count > 0
            || self.last_error.is_some()
    }
}

/// Per-counterpart bookmark into ledger history
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ConversationCursor {
    pub last_index: u64,
    pub last_timestamp: i64,
}

impl ConversationCursor {
    /// Cursors never move backwards
    pub fn advanced_to(self, index: u64, timestamp: i64) -> Self {
        if index > self.last_index {
            Self {
                last_index: index,
                last_timestamp: timestamp.max(self.last_timestamp),
            }
        } else {
            self
        }
    }
}

// ============================================================================
// Report Types
// ============================================================================

/// Outcome of one sync pass
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    /// The pass did not run because another one was in progress
    pub coalesced: bool,
    pub submitted: usize,
    pub confirmed: usize,
    /// Confirmed through the idempotency check without a resubmission
    pub recovered: usize,
    pub retried: usize,
    pub failed: usize,
    /// Skipped because not yet due or blocked behind an earlier message
    pub deferred: usize,
    pub stopped_early: bool,
}

/// Outcome of one history refresh
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RefreshReport {
    pub fetched: usize,
    pub merged: usize,
    pub duplicates: usize,
    pub skipped: usize,
    pub cursor: ConversationCursor,
}
