//! Sync pass
//!
//! Drains the durable queue against the ledger. One pass at a time: a trigger
//! that arrives while a pass is running is coalesced into it. Per entry:
//!
//! ```text
//! pending -> submitting -> confirmed -> removed
//!                       -> pending (retry after backoff)
//!                       -> failed  (budget exhausted, user-retriable)
//! ```
//!
//! Entries whose earlier outcome is unknown (left `submitting` by a crash, or
//! a failed attempt that may still have landed) are first looked up in ledger
//! history and confirmed without a resubmission when found.

use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, Mutex, Notify};

use crate::config::CoreConfig;
use crate::db::QueueStore;
use crate::error::{CoreError, CoreResult};
use crate::ledger::{Confirmation, Ledger, LedgerError};
use crate::models::{MessageStatus, QueueEntry, SyncReport};
use crate::sync::backoff;
use crate::sync::events::SyncEvent;
use crate::timeline::MessageStore;

/// What happened to one entry
enum Outcome {
    Confirmed,
    Retrying,
    Failed,
}

/// Drains the outbound queue; shared behind an `Arc`
pub struct SyncEngine {
    own_address: String,
    queue: QueueStore,
    ledger: Arc<dyn Ledger>,
    store: Arc<MessageStore>,
    config: CoreConfig,
    pass_lock: Mutex<()>,
    stop: AtomicBool,
    pub(crate) trigger: Notify,
    events: broadcast::Sender<SyncEvent>,
}

impl SyncEngine {
    pub fn new(
        own_address: String,
        queue: QueueStore,
        ledger: Arc<dyn Ledger>,
        store: Arc<MessageStore>,
        config: CoreConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            own_address,
            queue,
            ledger,
            store,
            config,
            pass_lock: Mutex::new(()),
            stop: AtomicBool::new(false),
            trigger: Notify::new(),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    /// Ask the running pass to stop after its current entry
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    /// Wake a spawned scheduler for an immediate pass
    pub fn trigger(&self) {
        self.trigger.notify_one();
    }

    /// Whether a pass is in progress
    pub fn is_running(&self) -> bool {
        self.pass_lock.try_lock().is_err()
    }

    /// `failed -> pending` with a fresh retry budget
    pub async fn retry_failed(&self, id: &str) -> CoreResult<()> {
        let entry = self
            .queue
            .get(id)
            .await?
            .ok_or_else(|| CoreError::NotFound(id.to_string()))?;
        self.queue.reset_failed(id).await?;

        tracing::info!("Message {} queued for retry by user", id);
        self.store
            .notify_status(&entry.message.recipient, id, MessageStatus::Pending);
        self.trigger();
        Ok(())
    }

    /// Run one sync pass
    ///
    /// Returns a coalesced report without doing anything if a pass is already
    /// running. Per-entry failures are recorded and never abort the pass; a
    /// persistence failure does, since nothing after it could be recorded.
    pub async fn run_pass(&self) -> CoreResult<SyncReport> {
        let _guard = match self.pass_lock.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                tracing::debug!("Sync pass already running, coalescing trigger");
                return Ok(SyncReport {
                    coalesced: true,
                    ..Default::default()
                });
            }
        };
        self.stop.store(false, Ordering::SeqCst);
        self.emit(SyncEvent::PassStarted);

        let mut report = SyncReport::default();
        self.finish_confirmed().await?;

        let entries = self.queue.list_pending().await?;
        let now = chrono::Utc::now().timestamp_millis();
        // Recipients whose earlier message is still undelivered in this pass
        let mut blocked: HashSet<String> = HashSet::new();

        for entry in entries {
            if self.stop.load(Ordering::SeqCst) {
                tracing::info!("Sync pass stopped on request");
                report.stopped_early = true;
                break;
            }

            let recipient = entry.message.recipient.clone();
            if blocked.contains(&recipient) {
                report.deferred += 1;
                continue;
            }
            if entry.status() == MessageStatus::Pending && !entry.is_due(now) {
                blocked.insert(recipient);
                report.deferred += 1;
                continue;
            }

            match self.process(&entry, &mut report).await {
                Ok(Outcome::Confirmed) => {}
                Ok(Outcome::Retrying) | Ok(Outcome::Failed) => {
                    blocked.insert(recipient);
                }
                Err(e @ CoreError::Persistence(_)) => {
                    tracing::error!("Sync pass aborted on {}: {}", entry.id(), e);
                    return Err(e);
                }
                Err(e) => {
                    tracing::error!("Queue entry {} rejected: {}", entry.id(), e);
                    self.emit(SyncEvent::EntryError {
                        id: entry.id().to_string(),
                        error: e.to_string(),
                    });
                    blocked.insert(recipient);
                }
            }
        }

        tracing::info!(
            "Sync pass done: {} submitted, {} confirmed ({} recovered), {} retrying, {} failed, {} deferred",
            report.submitted,
            report.confirmed,
            report.recovered,
            report.retried,
            report.failed,
            report.deferred
        );
        self.emit(SyncEvent::PassFinished(report.clone()));
        Ok(report)
    }

    async fn process(&self, entry: &QueueEntry, report: &mut SyncReport) -> CoreResult<Outcome> {
        let id = entry.id();
        if entry.status() == MessageStatus::Pending {
            self.queue.mark_submitting(id).await?;
            self.emit(SyncEvent::Submitting { id: id.to_string() });
        }

        if entry.is_in_doubt() {
            match self.find_on_ledger(entry).await {
                Ok(Some(confirmation)) => {
                    tracing::info!(
                        "Message {} already on ledger at index {}, confirming without resubmit",
                        id,
                        confirmation.index
                    );
                    self.confirm(entry, confirmation, true).await?;
                    report.confirmed += 1;
                    report.recovered += 1;
                    return Ok(Outcome::Confirmed);
                }
                Ok(None) => {}
                Err(e) => {
                    // Cannot rule out a duplicate; try again later
                    return self.handle_failure(entry, e, report).await;
                }
            }
        }

        report.submitted += 1;
        let submitted = self
            .with_timeout(self.ledger.submit(&entry.message.recipient, &entry.message.ciphertext))
            .await;

        match submitted {
            Ok(confirmation) => {
                self.confirm(entry, confirmation, false).await?;
                report.confirmed += 1;
                Ok(Outcome::Confirmed)
            }
            Err(e) => self.handle_failure(entry, e, report).await,
        }
    }

    /// Ledger position of a record matching sender, recipient and ciphertext,
    /// no older than the entry minus the idempotency window
    ///
    /// History merged by a refresh is checked first; the ledger is only asked
    /// for records past the conversation cursor, since anything at or below it
    /// was merged already.
    async fn find_on_ledger(&self, entry: &QueueEntry) -> CoreResult<Option<Confirmation>> {
        let message = &entry.message;
        let earliest = message.timestamp - self.config.idempotency_window_ms;
        let matches = |sender: &str, recipient: &str, ciphertext: &str, timestamp: i64| {
            sender == self.own_address
                && recipient == message.recipient
                && ciphertext == message.ciphertext
                && timestamp >= earliest
        };

        if let Some(copy) = self.store.confirmed_copy(entry.id()).await? {
            if matches(&copy.sender, &copy.recipient, &copy.ciphertext, copy.ledger_timestamp) {
                return Ok(Some(Confirmation {
                    index: copy.ledger_index,
                    timestamp: copy.ledger_timestamp,
                }));
            }
        }

        let since = self.store.cursor(&message.recipient).await?.last_index;
        let records = self
            .with_timeout(self.ledger.fetch_history(&message.recipient, since))
            .await?;

        Ok(records
            .into_iter()
            .find(|r| matches(&r.sender, &r.recipient, &r.ciphertext, r.timestamp))
            .map(|r| Confirmation {
                index: r.index,
                timestamp: r.timestamp,
            }))
    }

    async fn confirm(
        &self,
        entry: &QueueEntry,
        confirmation: Confirmation,
        recovered: bool,
    ) -> CoreResult<()> {
        let id = entry.id();
        self.queue
            .mark_confirmed(id, confirmation.index, confirmation.timestamp)
            .await?;
        self.store.record_confirmed(&entry.message, confirmation).await?;
        self.queue.remove(id).await?;

        tracing::debug!("Message {} confirmed at index {}", id, confirmation.index);
        self.emit(SyncEvent::Confirmed {
            id: id.to_string(),
            recipient: entry.message.recipient.clone(),
            ledger_index: confirmation.index,
            recovered,
        });
        Ok(())
    }

    async fn handle_failure(
        &self,
        entry: &QueueEntry,
        error: CoreError,
        report: &mut SyncReport,
    ) -> CoreResult<Outcome> {
        let id = entry.id();
        let attempt = entry.attempt_count + 1;
        let error_text = error.to_string();

        if error.is_retryable() && attempt < self.config.retry.max_attempts {
            let delay = backoff::retry_delay(&self.config.retry, attempt, &mut rand::thread_rng());
            let next_retry_at =
                backoff::next_retry_at(chrono::Utc::now().timestamp_millis(), delay);
            self.queue.schedule_retry(id, &error_text, next_retry_at).await?;

            tracing::warn!(
                "Message {} attempt {} failed, retrying in {} ms: {}",
                id,
                attempt,
                delay.as_millis(),
                error_text
            );
            report.retried += 1;
            self.store
                .notify_status(&entry.message.recipient, id, MessageStatus::Pending);
            self.emit(SyncEvent::RetryScheduled {
                id: id.to_string(),
                attempt,
                next_retry_at,
                error: error_text,
            });
            Ok(Outcome::Retrying)
        } else {
            self.queue.mark_failed(id, &error_text).await?;

            tracing::warn!("Message {} failed after {} attempts: {}", id, attempt, error_text);
            report.failed += 1;
            self.store
                .notify_status(&entry.message.recipient, id, MessageStatus::Failed);
            self.emit(SyncEvent::Failed {
                id: id.to_string(),
                error: error_text,
            });
            Ok(Outcome::Failed)
        }
    }

    /// Complete entries confirmed by an earlier pass that stopped before removal
    async fn finish_confirmed(&self) -> CoreResult<()> {
        for entry in self.queue.list_confirmed().await? {
            if let (Some(index), Some(timestamp)) = (entry.ledger_index, entry.ledger_timestamp) {
                self.store
                    .record_confirmed(&entry.message, Confirmation { index, timestamp })
                    .await?;
            }
            self.queue.remove(entry.id()).await?;
            tracing::info!("Finished confirmation of {}", entry.id());
        }
        Ok(())
    }

    async fn with_timeout<T>(
        &self,
        call: impl Future<Output = Result<T, LedgerError>>,
    ) -> CoreResult<T> {
        let limit = self.config.ledger_timeout();
        match tokio::time::timeout(limit, call).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(CoreError::Timeout(limit.as_millis() as u64)),
        }
    }

    fn emit(&self, event: SyncEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::crypto::EncryptionEngine;
    use crate::db::{self, HistoryStore};
    use crate::ledger::memory::{LedgerBook, Outcome as Scripted};
    use crate::models::{Message, SealedBody};

    struct Fixture {
        book: LedgerBook,
        queue: QueueStore,
        store: Arc<MessageStore>,
        sync: Arc<SyncEngine>,
        engine: Arc<EncryptionEngine>,
    }

    async fn fixture(config: CoreConfig) -> Fixture {
        let book = LedgerBook::new();
        let pool = db::open_in_memory().await.unwrap();
        let engine = Arc::new(EncryptionEngine::open(pool.clone(), [3u8; 32], 3).await.unwrap());
        let ledger: Arc<dyn Ledger> = Arc::new(book.session("alice"));
        let queue = QueueStore::new(pool.clone());
        let store = Arc::new(MessageStore::new(
            "alice".into(),
            engine.clone(),
            ledger.clone(),
            queue.clone(),
            HistoryStore::new(pool),
            config.ledger_timeout(),
        ));
        let sync = Arc::new(SyncEngine::new(
            "alice".into(),
            queue.clone(),
            ledger,
            store.clone(),
            config,
        ));
        Fixture {
            book,
            queue,
            store,
            sync,
            engine,
        }
    }

    async fn enqueue(f: &Fixture, id: &str, recipient: &str, timestamp: i64) {
        let peer = crate::crypto::KeyPair::generate().unwrap();
        let sealed = SealedBody {
            id: id.into(),
            sent_at: timestamp,
            body: format!("body of {}", id),
        };
        let ciphertext = f
            .engine
            .encrypt(recipient, peer.public.as_bytes(), &sealed.to_bytes().unwrap())
            .await
            .unwrap();
        f.queue
            .enqueue(&Message {
                id: id.into(),
                sender: "alice".into(),
                recipient: recipient.into(),
                plaintext: None,
                ciphertext,
                timestamp,
                status: MessageStatus::Pending,
                last_error: None,
            })
            .await
            .unwrap();
    }

    fn fast_retry() -> CoreConfig {
        let mut config = CoreConfig::default();
        config.retry.base_delay_ms = 1;
        config.retry.max_delay_ms = 1;
        config.retry.jitter_ratio = 0.0;
        config
    }

    #[tokio::test]
    async fn test_pass_confirms_and_removes() {
        let f = fixture(CoreConfig::default()).await;
        enqueue(&f, "m1", "bob", 1).await;
        enqueue(&f, "m2", "bob", 2).await;

        let report = f.sync.run_pass().await.unwrap();
        assert_eq!(report.submitted, 2);
        assert_eq!(report.confirmed, 2);
        assert!(f.queue.list_pending().await.unwrap().is_empty());
        assert!(f.queue.list_confirmed().await.unwrap().is_empty());
        assert_eq!(f.book.records().len(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_trigger_is_coalesced() {
        let f = fixture(CoreConfig::default()).await;
        enqueue(&f, "m1", "bob", 1).await;
        f.book.set_latency(Some(Duration::from_millis(100)));

        let first = {
            let sync = f.sync.clone();
            tokio::spawn(async move { sync.run_pass().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(f.sync.is_running());

        let second = f.sync.run_pass().await.unwrap();
        assert!(second.coalesced);

        let first = first.await.unwrap().unwrap();
        assert!(!first.coalesced);
        assert_eq!(f.book.submission_count(), 1);
    }

    #[tokio::test]
    async fn test_timeout_is_retryable() {
        let mut config = fast_retry();
        config.ledger_timeout_ms = 20;
        let f = fixture(config).await;
        enqueue(&f, "m1", "bob", 1).await;
        f.book.set_latency(Some(Duration::from_millis(200)));

        let report = f.sync.run_pass().await.unwrap();
        assert_eq!(report.retried, 1);
        let entry = f.queue.get("m1").await.unwrap().unwrap();
        assert_eq!(entry.status(), MessageStatus::Pending);
        assert_eq!(entry.attempt_count, 1);
        assert!(entry.last_error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_budget_exhaustion_marks_failed_and_user_retry() {
        let mut config = fast_retry();
        config.retry.max_attempts = 2;
        let f = fixture(config).await;
        enqueue(&f, "m1", "bob", 1).await;
        f.book.reject_recipient("bob", 2);

        assert_eq!(f.sync.run_pass().await.unwrap().retried, 1);
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(f.sync.run_pass().await.unwrap().failed, 1);

        let failed = f.queue.list_failed().await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].attempt_count, 2);

        // Failed entries wait for the user
        let idle = f.sync.run_pass().await.unwrap();
        assert_eq!(idle.submitted, 0);

        f.sync.retry_failed("m1").await.unwrap();
        let report = f.sync.run_pass().await.unwrap();
        assert_eq!(report.confirmed, 1);
        assert!(f.queue.get("m1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_lost_ack_is_recovered_without_resubmit() {
        let f = fixture(fast_retry()).await;
        enqueue(&f, "m1", "bob", chrono::Utc::now().timestamp_millis()).await;
        f.book.push_outcome(Scripted::AckLost);

        let first = f.sync.run_pass().await.unwrap();
        assert_eq!(first.retried, 1);
        assert_eq!(f.book.records().len(), 1);

        tokio::time::sleep(Duration::from_millis(5)).await;
        let second = f.sync.run_pass().await.unwrap();
        assert_eq!(second.recovered, 1);
        assert_eq!(second.submitted, 0);
        assert_eq!(f.book.submission_count(), 1);
        assert_eq!(f.book.records().len(), 1);
    }

    #[tokio::test]
    async fn test_lost_ack_found_in_merged_history_skips_ledger() {
        let f = fixture(fast_retry()).await;
        enqueue(&f, "m1", "bob", chrono::Utc::now().timestamp_millis()).await;
        f.book.push_outcome(Scripted::AckLost);
        assert_eq!(f.sync.run_pass().await.unwrap().retried, 1);

        // A refresh merges our own landed message before the retry
        let refreshed = f.store.refresh("bob").await.unwrap();
        assert_eq!(refreshed.merged, 1);
        assert_eq!(refreshed.cursor.last_index, 1);

        // No ledger access needed to settle it
        f.book.set_offline(true);
        tokio::time::sleep(Duration::from_millis(5)).await;
        let report = f.sync.run_pass().await.unwrap();
        assert_eq!(report.recovered, 1);
        assert_eq!(report.submitted, 0);
        assert!(f.queue.get("m1").await.unwrap().is_none());
        assert_eq!(f.book.records().len(), 1);
    }

    #[tokio::test]
    async fn test_foreign_record_with_same_id_is_not_a_confirmation() {
        let f = fixture(fast_retry()).await;
        enqueue(&f, "m1", "bob", chrono::Utc::now().timestamp_millis()).await;
        f.book.reject_recipient("bob", 1);
        assert_eq!(f.sync.run_pass().await.unwrap().retried, 1);

        // bob publishes a message reusing our id
        let sealed = SealedBody {
            id: "m1".into(),
            sent_at: 1,
            body: "spoofed".into(),
        };
        let bob = EncryptionEngine::open(db::open_in_memory().await.unwrap(), [4u8; 32], 3)
            .await
            .unwrap();
        let spoof = bob
            .encrypt(
                "alice",
                f.engine.public_key().await.as_bytes(),
                &sealed.to_bytes().unwrap(),
            )
            .await
            .unwrap();
        f.book.append("bob", "alice", &spoof);
        assert_eq!(f.store.refresh("bob").await.unwrap().merged, 1);

        tokio::time::sleep(Duration::from_millis(5)).await;
        let report = f.sync.run_pass().await.unwrap();
        assert_eq!(report.recovered, 0);
        assert_eq!(report.submitted, 1);
        assert_eq!(report.confirmed, 1);
    }

    #[tokio::test]
    async fn test_not_due_entry_blocks_its_conversation_only() {
        let mut config = CoreConfig::default();
        config.retry.base_delay_ms = 60_000;
        config.retry.max_delay_ms = 60_000;
        let f = fixture(config).await;
        enqueue(&f, "b1", "bob", 1).await;
        enqueue(&f, "b2", "bob", 2).await;
        enqueue(&f, "c1", "carol", 3).await;
        f.book.reject_recipient("bob", 1);

        let report = f.sync.run_pass().await.unwrap();
        assert_eq!(report.retried, 1);
        assert_eq!(report.deferred, 1);
        assert_eq!(report.confirmed, 1);

        // b1 waits for its backoff, b2 must not overtake it
        let report = f.sync.run_pass().await.unwrap();
        assert_eq!(report.deferred, 2);
        assert_eq!(report.submitted, 0);
    }

    #[tokio::test]
    async fn test_request_stop_ends_pass_after_current_entry() {
        let f = fixture(CoreConfig::default()).await;
        for i in 0..3 {
            enqueue(&f, &format!("m{}", i), &format!("peer{}", i), i).await;
        }
        f.book.set_latency(Some(Duration::from_millis(50)));

        let pass = {
            let sync = f.sync.clone();
            tokio::spawn(async move { sync.run_pass().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        f.sync.request_stop();

        let report = pass.await.unwrap().unwrap();
        assert!(report.stopped_early);
        assert_eq!(report.confirmed, 1);
        assert_eq!(f.queue.list_pending().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_events_in_order() {
        let f = fixture(CoreConfig::default()).await;
        let mut events = f.sync.subscribe();
        enqueue(&f, "m1", "bob", 1).await;
        f.sync.run_pass().await.unwrap();

        assert_eq!(events.recv().await.unwrap(), SyncEvent::PassStarted);
        assert_eq!(
            events.recv().await.unwrap(),
            SyncEvent::Submitting { id: "m1".into() }
        );
        assert!(matches!(
            events.recv().await.unwrap(),
            SyncEvent::Confirmed { recovered: false, .. }
        ));
        assert!(matches!(
            events.recv().await.unwrap(),
            SyncEvent::PassFinished(_)
        ));
    }
}
