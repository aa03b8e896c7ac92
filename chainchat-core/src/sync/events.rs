//! Sync engine notifications
//!
//! Delivered over a `tokio::sync::broadcast` channel in emission order.

use serde::Serialize;

use crate::models::SyncReport;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SyncEvent {
    PassStarted,
    Submitting {
        id: String,
    },
    Confirmed {
        id: String,
        recipient: String,
        ledger_index: u64,
        /// Found on the ledger by the idempotency check, not resubmitted
        recovered: bool,
    },
    RetryScheduled {
        id: String,
        attempt: u32,
        next_retry_at: i64,
        error: String,
    },
    Failed {
        id: String,
        error: String,
    },
    /// A queue operation was refused (invalid transition or missing entry)
    EntryError {
        id: String,
        error: String,
    },
    PassFinished(SyncReport),
}
