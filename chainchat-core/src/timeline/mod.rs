//! Conversation read model
//!
//! Merges ledger-confirmed history with undelivered queue entries into one
//! timeline per counterpart. Everything here is derived: the in-memory cache
//! can be dropped at any time and is rebuilt from the `ledger_messages` cache,
//! the queue and ledger history.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{broadcast, Mutex, RwLock};

use crate::crypto::EncryptionEngine;
use crate::db::{ConfirmedRecord, HistoryStore, QueueStore};
use crate::error::{CoreError, CoreResult};
use crate::ledger::{Confirmation, Ledger, LedgerRecord};
use crate::models::{ConversationCursor, Message, MessageStatus, RefreshReport, SealedBody};

/// Read model notifications
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum TimelineEvent {
    /// A message was sent locally and shows up optimistically
    MessageAdded { counterpart: String, id: String },
    StatusChanged {
        counterpart: String,
        id: String,
        status: MessageStatus,
    },
    /// New ledger history was merged
    ConversationUpdated { counterpart: String, merged: usize },
}

/// Decrypted confirmed messages of one conversation, by id
type ConversationCache = HashMap<String, Message>;

/// Read model over the queue and confirmed history
pub struct MessageStore {
    own_address: String,
    engine: Arc<EncryptionEngine>,
    ledger: Arc<dyn Ledger>,
    queue: QueueStore,
    history: HistoryStore,
    ledger_timeout: Duration,
    cache: RwLock<HashMap<String, ConversationCache>>,
    /// Serializes refreshes so cursor updates never interleave
    refresh_lock: Mutex<()>,
    events: broadcast::Sender<TimelineEvent>,
}

impl MessageStore {
    pub fn new(
        own_address: String,
        engine: Arc<EncryptionEngine>,
        ledger: Arc<dyn Ledger>,
        queue: QueueStore,
        history: HistoryStore,
        ledger_timeout: Duration,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            own_address,
            engine,
            ledger,
            queue,
            history,
            ledger_timeout,
            cache: RwLock::new(HashMap::new()),
            refresh_lock: Mutex::new(()),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TimelineEvent> {
        self.events.subscribe()
    }

    /// Ordered timeline for a conversation
    ///
    /// Local only: confirmed messages from the cache plus pending, submitting
    /// and failed queue entries. Never touches the ledger and never waits for a
    /// sync pass.
    pub async fn get_conversation(&self, counterpart: &str) -> CoreResult<Vec<Message>> {
        self.ensure_loaded(counterpart).await?;

        // Queue before cache, so an entry confirmed and removed in between is still seen
        let entries = self.queue.list_for_recipient(counterpart).await?;
        let mut by_id: HashMap<String, Message> = self
            .cache
            .read()
            .await
            .get(counterpart)
            .cloned()
            .unwrap_or_default();

        for entry in entries {
            if by_id.contains_key(entry.id()) {
                // Confirmed wins over a stale queue row
                continue;
            }
            let mut message = entry.message;
            message.plaintext = self.open_body(&message.ciphertext).await.map(|b| b.body);
            by_id.insert(message.id.clone(), message);
        }

        let mut timeline: Vec<Message> = by_id.into_values().collect();
        timeline.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
        Ok(timeline)
    }

    /// Pull ledger history past the cursor and merge it
    ///
    /// Entries that cannot be decrypted are skipped; the cursor is persisted
    /// only past entries whose outcome is settled.
    pub async fn refresh(&self, counterpart: &str) -> CoreResult<RefreshReport> {
        let _guard = self.refresh_lock.lock().await;
        self.ensure_loaded(counterpart).await?;

        let start = self.history.cursor(counterpart).await?;
        let records = match tokio::time::timeout(
            self.ledger_timeout,
            self.ledger.fetch_history(counterpart, start.last_index),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => return Err(CoreError::Timeout(self.ledger_timeout.as_millis() as u64)),
        };

        let mut report = RefreshReport {
            fetched: records.len(),
            cursor: start,
            ..Default::default()
        };
        let mut outcome = Ok(());

        for record in records {
            // Keep concurrent readers of the cache responsive during large pulls
            tokio::task::yield_now().await;

            match self.merge_record(counterpart, &record).await {
                Ok(true) => report.merged += 1,
                Ok(false) => report.duplicates += 1,
                Err(e) if e.is_benign_decrypt() => {
                    tracing::debug!(
                        "Skipping ledger entry {} with {}: {}",
                        record.index,
                        counterpart,
                        e
                    );
                    report.skipped += 1;
                }
                Err(e) => {
                    outcome = Err(e);
                    break;
                }
            }
            report.cursor = report.cursor.advanced_to(record.index, record.timestamp);
        }

        if report.cursor != start {
            report.cursor = self.history.advance_cursor(counterpart, report.cursor).await?;
        }

        if report.merged > 0 {
            let _ = self.events.send(TimelineEvent::ConversationUpdated {
                counterpart: counterpart.to_string(),
                merged: report.merged,
            });
        }

        tracing::debug!(
            "Refreshed {}: {} fetched, {} merged, {} duplicate, {} skipped",
            counterpart,
            report.fetched,
            report.merged,
            report.duplicates,
            report.skipped
        );

        outcome.map(|_| report)
    }

    /// Cache a message the sync engine just confirmed
    pub async fn record_confirmed(&self, message: &Message, confirmation: Confirmation) -> CoreResult<()> {
        // Loaded before the history write, so no stale snapshot can replace it later
        self.ensure_loaded(&message.recipient).await?;

        let record = ConfirmedRecord {
            id: message.id.clone(),
            counterpart: message.recipient.clone(),
            sender: message.sender.clone(),
            recipient: message.recipient.clone(),
            ciphertext: message.ciphertext.clone(),
            sent_at: message.timestamp,
            ledger_index: confirmation.index,
            ledger_timestamp: confirmation.timestamp,
        };
        self.history.insert_confirmed(&record).await?;

        let mut confirmed = Message {
            status: MessageStatus::Confirmed,
            last_error: None,
            ..message.clone()
        };
        if confirmed.plaintext.is_none() {
            confirmed.plaintext = self.open_body(&confirmed.ciphertext).await.map(|b| b.body);
        }
        self.insert_cached(&record.counterpart, confirmed).await;

        self.notify_status(&record.counterpart, &record.id, MessageStatus::Confirmed);
        Ok(())
    }

    /// Announce an optimistic local message
    pub fn notify_added(&self, counterpart: &str, id: &str) {
        let _ = self.events.send(TimelineEvent::MessageAdded {
            counterpart: counterpart.to_string(),
            id: id.to_string(),
        });
    }

    /// Announce a queue status change
    pub fn notify_status(&self, counterpart: &str, id: &str, status: MessageStatus) {
        let _ = self.events.send(TimelineEvent::StatusChanged {
            counterpart: counterpart.to_string(),
            id: id.to_string(),
            status,
        });
    }

    /// Confirmed copy of a message, if history already has it
    pub(crate) async fn confirmed_copy(&self, id: &str) -> CoreResult<Option<ConfirmedRecord>> {
        self.history.get(id).await
    }

    /// How far a conversation's ledger history has been merged
    pub(crate) async fn cursor(&self, counterpart: &str) -> CoreResult<ConversationCursor> {
        self.history.cursor(counterpart).await
    }

    /// Drop the in-memory read model; the next read rebuilds it
    pub async fn rebuild(&self) {
        self.cache.write().await.clear();
        tracing::info!("Read model cleared, rebuilding on demand");
    }

    /// Decrypt one ledger record and add it to history and cache
    ///
    /// Returns `false` for a message already known by id.
    async fn merge_record(&self, counterpart: &str, record: &LedgerRecord) -> CoreResult<bool> {
        let sealed = self.decrypt_body(&record.ciphertext).await?;

        let confirmed = ConfirmedRecord {
            id: sealed.id.clone(),
            counterpart: counterpart.to_string(),
            sender: record.sender.clone(),
            recipient: record.recipient.clone(),
            ciphertext: record.ciphertext.clone(),
            sent_at: sealed.sent_at,
            ledger_index: record.index,
            ledger_timestamp: record.timestamp,
        };
        let inserted = self.history.insert_confirmed(&confirmed).await?;
        let message = message_from(&confirmed, sealed.body);

        let cached = self.insert_cached(counterpart, message).await;
        Ok(inserted || cached)
    }

    /// Load a conversation's confirmed history into the cache if absent
    async fn ensure_loaded(&self, counterpart: &str) -> CoreResult<()> {
        if self.cache.read().await.contains_key(counterpart) {
            return Ok(());
        }

        let conversation = self.load_conversation(counterpart).await?;
        self.install(counterpart, conversation).await;
        Ok(())
    }

    /// Decrypted snapshot of a conversation's durable history
    async fn load_conversation(&self, counterpart: &str) -> CoreResult<ConversationCache> {
        let records = self.history.load_conversation(counterpart).await?;
        let mut conversation = ConversationCache::with_capacity(records.len());
        for record in records {
            tokio::task::yield_now().await;
            match self.decrypt_body(&record.ciphertext).await {
                Ok(sealed) => {
                    conversation.insert(record.id.clone(), message_from(&record, sealed.body));
                }
                Err(e) if e.is_benign_decrypt() => {
                    tracing::debug!("Cached message {} no longer decryptable: {}", record.id, e);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(conversation)
    }

    /// Install a loaded snapshot unless another load got there first
    async fn install(&self, counterpart: &str, conversation: ConversationCache) {
        self.cache
            .write()
            .await
            .entry(counterpart.to_string())
            .or_insert(conversation);
    }

    /// Returns `true` if the message was not cached yet
    ///
    /// The first copy of an id wins, like the `ledger_messages` row.
    async fn insert_cached(&self, counterpart: &str, message: Message) -> bool {
        let mut cache = self.cache.write().await;
        match cache.get_mut(counterpart) {
            Some(conversation) => match conversation.entry(message.id.clone()) {
                Entry::Occupied(_) => false,
                Entry::Vacant(slot) => {
                    slot.insert(message);
                    true
                }
            },
            // Not loaded yet: the next read loads it from history
            None => false,
        }
    }

    async fn decrypt_body(&self, ciphertext: &str) -> CoreResult<SealedBody> {
        let plaintext = self.engine.decrypt(ciphertext).await?;
        SealedBody::from_bytes(&plaintext)
    }

    async fn open_body(&self, ciphertext: &str) -> Option<SealedBody> {
        match self.decrypt_body(ciphertext).await {
            Ok(sealed) => Some(sealed),
            Err(e) => {
                tracing::warn!("Cannot open own message for {}: {}", self.own_address, e);
                None
            }
        }
    }
}

fn message_from(record: &ConfirmedRecord, body: String) -> Message {
    Message {
        id: record.id.clone(),
        sender: record.sender.clone(),
        recipient: record.recipient.clone(),
        plaintext: Some(body),
        ciphertext: record.ciphertext.clone(),
        timestamp: record.sent_at,
        status: MessageStatus::Confirmed,
        last_error: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::ledger::memory::LedgerBook;
    use crate::ledger::Ledger as _;

    struct Party {
        engine: Arc<EncryptionEngine>,
        store: MessageStore,
        queue: QueueStore,
    }

    async fn party(book: &LedgerBook, address: &str) -> Party {
        let pool = db::open_in_memory().await.unwrap();
        let engine = Arc::new(EncryptionEngine::open(pool.clone(), [1u8; 32], 3).await.unwrap());
        let queue = QueueStore::new(pool.clone());
        let store = MessageStore::new(
            address.to_string(),
            engine.clone(),
            Arc::new(book.session(address)),
            queue.clone(),
            HistoryStore::new(pool),
            Duration::from_secs(5),
        );
        Party { engine, store, queue }
    }

    async fn seal(from: &Party, to: &Party, to_address: &str, id: &str, sent_at: i64, body: &str) -> String {
        let sealed = SealedBody {
            id: id.to_string(),
            sent_at,
            body: body.to_string(),
        };
        from.engine
            .encrypt(
                to_address,
                to.engine.public_key().await.as_bytes(),
                &sealed.to_bytes().unwrap(),
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_refresh_merges_both_directions_in_order() {
        let book = LedgerBook::new();
        let alice = party(&book, "alice").await;
        let bob = party(&book, "bob").await;

        let a1 = seal(&alice, &bob, "bob", "a1", 100, "hi bob").await;
        let b1 = seal(&bob, &alice, "alice", "b1", 200, "hi alice").await;
        book.append("alice", "bob", &a1);
        book.append("bob", "alice", &b1);

        let report = alice.store.refresh("bob").await.unwrap();
        assert_eq!(report.fetched, 2);
        assert_eq!(report.merged, 2);
        assert_eq!(report.cursor.last_index, 2);

        let timeline = alice.store.get_conversation("bob").await.unwrap();
        let bodies: Vec<_> = timeline.iter().map(|m| m.plaintext.clone().unwrap()).collect();
        assert_eq!(bodies, vec!["hi bob", "hi alice"]);
        assert!(timeline.iter().all(|m| m.status == MessageStatus::Confirmed));

        // Nothing new past the cursor
        let again = alice.store.refresh("bob").await.unwrap();
        assert_eq!(again.fetched, 0);
    }

    #[tokio::test]
    async fn test_undecryptable_entries_are_skipped() {
        let book = LedgerBook::new();
        let alice = party(&book, "alice").await;
        let bob = party(&book, "bob").await;

        let good = seal(&bob, &alice, "alice", "b1", 100, "readable").await;
        book.append("bob", "alice", "not an envelope");
        book.append("bob", "alice", &good);

        let report = alice.store.refresh("bob").await.unwrap();
        assert_eq!(report.skipped, 1);
        assert_eq!(report.merged, 1);
        assert_eq!(report.cursor.last_index, 2);
        assert_eq!(alice.store.get_conversation("bob").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_dedup_by_id_and_rebuild() {
        let book = LedgerBook::new();
        let alice = party(&book, "alice").await;
        let bob = party(&book, "bob").await;

        let b1 = seal(&bob, &alice, "alice", "b1", 100, "once").await;
        book.append("bob", "alice", &b1);
        // Same message id delivered twice (resubmitted by the sender)
        let b1_again = seal(&bob, &alice, "alice", "b1", 100, "once").await;
        book.append("bob", "alice", &b1_again);

        let report = alice.store.refresh("bob").await.unwrap();
        assert_eq!(report.merged, 1);
        assert_eq!(report.duplicates, 1);

        alice.store.rebuild().await;
        let timeline = alice.store.get_conversation("bob").await.unwrap();
        assert_eq!(timeline.len(), 1);
        assert_eq!(timeline[0].plaintext.as_deref(), Some("once"));
    }

    #[tokio::test]
    async fn test_reused_id_keeps_first_confirmed_copy() {
        let book = LedgerBook::new();
        let alice = party(&book, "alice").await;
        let bob = party(&book, "bob").await;

        let first = seal(&bob, &alice, "alice", "x", 100, "original").await;
        book.append("bob", "alice", &first);
        assert_eq!(alice.store.refresh("bob").await.unwrap().merged, 1);

        let second = seal(&bob, &alice, "alice", "x", 150, "REPLACED").await;
        book.append("bob", "alice", &second);
        let report = alice.store.refresh("bob").await.unwrap();
        assert_eq!(report.duplicates, 1);
        assert_eq!(report.merged, 0);

        let cached = alice.store.get_conversation("bob").await.unwrap();
        assert_eq!(cached.len(), 1);
        assert_eq!(cached[0].plaintext.as_deref(), Some("original"));
        assert_eq!(cached[0].timestamp, 100);

        alice.store.rebuild().await;
        let rebuilt = alice.store.get_conversation("bob").await.unwrap();
        assert_eq!(rebuilt, cached);
    }

    #[tokio::test]
    async fn test_confirmation_survives_concurrent_cache_load() {
        let book = LedgerBook::new();
        let alice = party(&book, "alice").await;
        let bob = party(&book, "bob").await;

        let ciphertext = seal(&alice, &bob, "bob", "m1", 100, "sent").await;
        let message = Message {
            id: "m1".into(),
            sender: "alice".into(),
            recipient: "bob".into(),
            plaintext: None,
            ciphertext: ciphertext.clone(),
            timestamp: 100,
            status: MessageStatus::Pending,
            last_error: None,
        };
        alice.queue.enqueue(&message).await.unwrap();

        // A reader snapshots history before the confirmation is written
        let stale = alice.store.load_conversation("bob").await.unwrap();
        assert!(stale.is_empty());

        alice.queue.mark_submitting("m1").await.unwrap();
        let confirmation = book.session("alice").submit("bob", &ciphertext).await.unwrap();
        alice.queue.mark_confirmed("m1", confirmation.index, confirmation.timestamp).await.unwrap();
        alice.store.record_confirmed(&message, confirmation).await.unwrap();
        alice.queue.remove("m1").await.unwrap();

        // ...and installs it afterwards
        alice.store.install("bob", stale).await;

        let timeline = alice.store.get_conversation("bob").await.unwrap();
        assert_eq!(timeline.len(), 1);
        assert_eq!(timeline[0].id, "m1");
        assert_eq!(timeline[0].status, MessageStatus::Confirmed);
    }

    #[tokio::test]
    async fn test_pending_entries_show_optimistically_offline() {
        let book = LedgerBook::new();
        let alice = party(&book, "alice").await;
        let bob = party(&book, "bob").await;
        book.set_offline(true);

        let ciphertext = seal(&alice, &bob, "bob", "m1", 100, "queued").await;
        alice
            .queue
            .enqueue(&Message {
                id: "m1".into(),
                sender: "alice".into(),
                recipient: "bob".into(),
                plaintext: None,
                ciphertext,
                timestamp: 100,
                status: MessageStatus::Pending,
                last_error: None,
            })
            .await
            .unwrap();

        let timeline = alice.store.get_conversation("bob").await.unwrap();
        assert_eq!(timeline.len(), 1);
        assert_eq!(timeline[0].status, MessageStatus::Pending);
        assert_eq!(timeline[0].plaintext.as_deref(), Some("queued"));

        assert!(matches!(
            alice.store.refresh("bob").await,
            Err(CoreError::Submission(_))
        ));
    }

    #[tokio::test]
    async fn test_record_confirmed_replaces_pending_view() {
        let book = LedgerBook::new();
        let alice = party(&book, "alice").await;
        let bob = party(&book, "bob").await;
        let mut events = alice.store.subscribe();

        let ciphertext = seal(&alice, &bob, "bob", "m1", 100, "sent").await;
        let message = Message {
            id: "m1".into(),
            sender: "alice".into(),
            recipient: "bob".into(),
            plaintext: None,
            ciphertext: ciphertext.clone(),
            timestamp: 100,
            status: MessageStatus::Pending,
            last_error: None,
        };
        alice.queue.enqueue(&message).await.unwrap();
        alice.queue.mark_submitting("m1").await.unwrap();
        let confirmation = book.session("alice").submit("bob", &ciphertext).await.unwrap();
        alice.queue.mark_confirmed("m1", confirmation.index, confirmation.timestamp).await.unwrap();

        alice.store.record_confirmed(&message, confirmation).await.unwrap();
        let timeline = alice.store.get_conversation("bob").await.unwrap();
        assert_eq!(timeline.len(), 1);
        assert_eq!(timeline[0].status, MessageStatus::Confirmed);
        assert_eq!(timeline[0].plaintext.as_deref(), Some("sent"));

        assert_eq!(
            events.recv().await.unwrap(),
            TimelineEvent::StatusChanged {
                counterpart: "bob".into(),
                id: "m1".into(),
                status: MessageStatus::Confirmed,
            }
        );

        // The same message arriving through history is a duplicate
        let report = alice.store.refresh("bob").await.unwrap();
        assert_eq!(report.duplicates, 1);
        assert_eq!(report.merged, 0);
    }
}
