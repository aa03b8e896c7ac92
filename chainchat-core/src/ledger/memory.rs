//! In-process ledger
//!
//! A [`LedgerBook`] is one shared ledger; [`LedgerBook::session`] opens a
//! per-address view implementing [`Ledger`] and [`Signer`]. Scripted outcomes,
//! latency and an offline switch let tests drive the sync engine through
//! failures.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::sync::broadcast;

use super::{Confirmation, Ledger, LedgerError, LedgerEvent, LedgerRecord, Signer};

/// Scripted result for the next submission
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Refuse the submission
    Reject(String),
    /// Store the record but report a failure, as if the acknowledgment was lost
    AckLost,
}

#[derive(Default)]
struct BookState {
    records: Vec<LedgerRecord>,
    outcomes: VecDeque<Outcome>,
    /// Remaining rejections per recipient
    rejected_recipients: HashMap<String, usize>,
    submissions: usize,
    latency: Option<Duration>,
    offline: bool,
}

/// Shared in-memory ledger
#[derive(Clone)]
pub struct LedgerBook {
    state: Arc<Mutex<BookState>>,
    events: broadcast::Sender<LedgerEvent>,
}

impl Default for LedgerBook {
    fn default() -> Self {
        Self::new()
    }
}

impl LedgerBook {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            state: Arc::new(Mutex::new(BookState::default())),
            events,
        }
    }

    /// Ledger view for the identity at `address`
    pub fn session(&self, address: &str) -> MemoryLedger {
        MemoryLedger {
            book: self.clone(),
            address: address.to_string(),
        }
    }

    /// Queue a scripted outcome for the next submission (any sender)
    pub fn push_outcome(&self, outcome: Outcome) {
        self.lock().outcomes.push_back(outcome);
    }

    /// Reject the next `times` submissions addressed to `recipient`
    pub fn reject_recipient(&self, recipient: &str, times: usize) {
        self.lock()
            .rejected_recipients
            .insert(recipient.to_string(), times);
    }

    /// Delay applied to every call
    pub fn set_latency(&self, latency: Option<Duration>) {
        self.lock().latency = latency;
    }

    /// While offline every call fails with `Unavailable`
    pub fn set_offline(&self, offline: bool) {
        self.lock().offline = offline;
    }

    /// Number of submission attempts that reached the ledger
    pub fn submission_count(&self) -> usize {
        self.lock().submissions
    }

    /// All stored records
    pub fn records(&self) -> Vec<LedgerRecord> {
        self.lock().records.clone()
    }

    /// Append a record directly, bypassing scripted outcomes
    pub fn append(&self, sender: &str, recipient: &str, ciphertext: &str) -> Confirmation {
        let mut state = self.lock();
        let confirmation = Self::store(&mut state, sender, recipient, ciphertext);
        drop(state);
        self.emit(sender, recipient, confirmation.timestamp);
        confirmation
    }

    fn store(state: &mut BookState, sender: &str, recipient: &str, ciphertext: &str) -> Confirmation {
        let index = state.records.len() as u64 + 1;
        // Ledger time never goes backwards
        let timestamp = state
            .records
            .last()
            .map_or(0, |r| r.timestamp)
            .max(chrono::Utc::now().timestamp_millis());

        state.records.push(LedgerRecord {
            index,
            sender: sender.to_string(),
            recipient: recipient.to_string(),
            ciphertext: ciphertext.to_string(),
            timestamp,
        });
        Confirmation { index, timestamp }
    }

    fn emit(&self, from: &str, to: &str, timestamp: i64) {
        // No receivers is fine
        let _ = self.events.send(LedgerEvent::MessageSent {
            from: from.to_string(),
            to: to.to_string(),
            timestamp,
        });
    }

    fn lock(&self) -> MutexGuard<'_, BookState> {
        // A panicking test thread must not wedge the others
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn delay(&self) {
        let latency = self.lock().latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }
}

/// One identity's view of a [`LedgerBook`]
#[derive(Clone)]
pub struct MemoryLedger {
    book: LedgerBook,
    address: String,
}

#[async_trait]
impl Ledger for MemoryLedger {
    async fn submit(&self, recipient: &str, ciphertext: &str) -> Result<Confirmation, LedgerError> {
        self.book.delay().await;

        let mut state = self.book.lock();
        if state.offline {
            return Err(LedgerError::Unavailable("offline".to_string()));
        }
        state.submissions += 1;

        if let Some(remaining) = state.rejected_recipients.get_mut(recipient) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(LedgerError::Rejected(format!("recipient {} refused", recipient)));
            }
        }

        match state.outcomes.pop_front() {
            Some(Outcome::Reject(reason)) => Err(LedgerError::Rejected(reason)),
            Some(Outcome::AckLost) => {
                let confirmation = LedgerBook::store(&mut state, &self.address, recipient, ciphertext);
                drop(state);
                self.book.emit(&self.address, recipient, confirmation.timestamp);
                Err(LedgerError::Unavailable("connection reset before acknowledgment".to_string()))
            }
            None => {
                let confirmation = LedgerBook::store(&mut state, &self.address, recipient, ciphertext);
                drop(state);
                self.book.emit(&self.address, recipient, confirmation.timestamp);
                Ok(confirmation)
            }
        }
    }

    async fn fetch_history(
        &self,
        counterpart: &str,
        since: u64,
    ) -> Result<Vec<LedgerRecord>, LedgerError> {
        self.book.delay().await;

        let state = self.book.lock();
        if state.offline {
            return Err(LedgerError::Unavailable("offline".to_string()));
        }

        let me = self.address.as_str();
        Ok(state
            .records
            .iter()
            .filter(|r| r.index > since)
            .filter(|r| {
                (r.sender == me && r.recipient == counterpart)
                    || (r.sender == counterpart && r.recipient == me)
            })
            .cloned()
            .collect())
    }

    fn subscribe(&self) -> Option<broadcast::Receiver<LedgerEvent>> {
        Some(self.book.events.subscribe())
    }
}

impl Signer for MemoryLedger {
    fn address(&self) -> String {
        self.address.clone()
    }

    /// Deterministic stand-in signature: SHA-256 over address and payload
    fn sign(&self, payload: &[u8]) -> Result<Vec<u8>, LedgerError> {
        let mut hasher = Sha256::new();
        hasher.update(self.address.as_bytes());
        hasher.update(payload);
        Ok(hasher.finalize().to_vec())
    }
}
