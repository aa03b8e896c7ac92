//! Core service object
//!
//! `ChatCore` owns the encryption engine, the durable queue, the read model and
//! the sync engine for one identity. It is the single entry point a host (UI,
//! FFI or IPC layer) talks to; no global state is involved.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use sqlx::SqlitePool;
use tokio::sync::{broadcast, watch};
use zeroize::Zeroizing;

use crate::config::CoreConfig;
use crate::crypto::{EncryptionEngine, StorageKey};
use crate::db::{self, HistoryStore, QueueStore};
use crate::error::CoreResult;
use crate::ledger::{Ledger, LedgerEvent, Signer};
use crate::models::{Message, MessageStatus, RefreshReport, SealedBody, SyncReport};
use crate::sync::{Connectivity, SyncEngine, SyncEvent, SyncHandle};
use crate::timeline::{MessageStore, TimelineEvent};

/// Offline-first messaging core for one identity
pub struct ChatCore {
    /// Database connection pool
    pub db: SqlitePool,
    address: String,
    config: CoreConfig,
    engine: Arc<EncryptionEngine>,
    queue: QueueStore,
    store: Arc<MessageStore>,
    sync: Arc<SyncEngine>,
    ledger: Arc<dyn Ledger>,
    /// Last assigned message timestamp, keeps same-millisecond sends ordered
    last_timestamp: AtomicI64,
}

impl ChatCore {
    /// Open the core with the configuration stored in the database
    pub async fn open(
        db: SqlitePool,
        storage_key: StorageKey,
        signer: Arc<dyn Signer>,
        ledger: Arc<dyn Ledger>,
    ) -> CoreResult<Self> {
        let config = CoreConfig::load(&db).await?;
        Self::open_with_config(db, storage_key, signer, ledger, config).await
    }

    /// Open the core with an explicit configuration
    pub async fn open_with_config(
        db: SqlitePool,
        storage_key: StorageKey,
        signer: Arc<dyn Signer>,
        ledger: Arc<dyn Ledger>,
        config: CoreConfig,
    ) -> CoreResult<Self> {
        config.validate()?;

        let address = signer.address();
        let engine = Arc::new(EncryptionEngine::open(db.clone(), storage_key, config.key_retention).await?);
        let queue = QueueStore::new(db.clone());
        let store = Arc::new(MessageStore::new(
            address.clone(),
            engine.clone(),
            ledger.clone(),
            queue.clone(),
            HistoryStore::new(db.clone()),
            config.ledger_timeout(),
        ));
        let sync = Arc::new(SyncEngine::new(
            address.clone(),
            queue.clone(),
            ledger.clone(),
            store.clone(),
            config.clone(),
        ));

        let pending = queue.list_pending().await?;
        if !pending.is_empty() {
            tracing::info!("Recovered {} undelivered messages from the queue", pending.len());
        }

        tracing::info!("Chat core initialized for {}", address);

        Ok(Self {
            db,
            address,
            config,
            engine,
            queue,
            store,
            sync,
            ledger,
            last_timestamp: AtomicI64::new(0),
        })
    }

    /// Our ledger address
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    /// Current public key to publish to counterparts
    pub async fn public_key(&self) -> [u8; 32] {
        self.engine.public_key().await.to_bytes()
    }

    pub fn encryption(&self) -> &Arc<EncryptionEngine> {
        &self.engine
    }

    pub fn queue(&self) -> &QueueStore {
        &self.queue
    }

    pub fn message_store(&self) -> &Arc<MessageStore> {
        &self.store
    }

    pub fn sync_engine(&self) -> &Arc<SyncEngine> {
        &self.sync
    }

    /// Encrypt and durably queue a message
    ///
    /// Works offline. The message is `pending` and visible in the conversation
    /// when this returns; delivery happens in a later sync pass.
    pub async fn send(&self, recipient: &str, recipient_public: &[u8], text: &str) -> CoreResult<Message> {
        let id = uuid::Uuid::new_v4().to_string();
        let timestamp = self.next_timestamp();

        let sealed = SealedBody {
            id: id.clone(),
            sent_at: timestamp,
            body: text.to_string(),
        };
        let payload = Zeroizing::new(sealed.to_bytes()?);
        let ciphertext = self.engine.encrypt(recipient, recipient_public, &payload).await?;

        let message = Message {
            id,
            sender: self.address.clone(),
            recipient: recipient.to_string(),
            plaintext: Some(text.to_string()),
            ciphertext,
            timestamp,
            status: MessageStatus::Pending,
            last_error: None,
        };
        self.queue.enqueue(&message).await?;

        tracing::info!("Queued message {} for {}", message.id, recipient);
        self.store.notify_added(recipient, &message.id);
        self.sync.trigger();
        Ok(message)
    }

    /// User retry of a failed message
    pub async fn retry(&self, id: &str) -> CoreResult<()> {
        self.sync.retry_failed(id).await
    }

    /// Ordered local timeline with a counterpart (works offline)
    pub async fn conversation(&self, counterpart: &str) -> CoreResult<Vec<Message>> {
        self.store.get_conversation(counterpart).await
    }

    /// Pull and merge new ledger history with a counterpart
    pub async fn refresh(&self, counterpart: &str) -> CoreResult<RefreshReport> {
        self.store.refresh(counterpart).await
    }

    /// Run a sync pass now
    pub async fn sync_now(&self) -> CoreResult<SyncReport> {
        self.sync.run_pass().await
    }

    /// Rotate to a new key pair; returns the new public key
    pub async fn rotate_keys(&self) -> CoreResult<[u8; 32]> {
        let public = self.engine.rotate_keys().await?;
        Ok(public.to_bytes())
    }

    /// React to a ledger `MessageSent` event
    ///
    /// Refreshes the affected conversation when the event involves us.
    pub async fn on_ledger_event(&self, event: LedgerEvent) -> CoreResult<Option<RefreshReport>> {
        let LedgerEvent::MessageSent { from, to, .. } = event;
        let counterpart = if to == self.address {
            from
        } else if from == self.address {
            to
        } else {
            return Ok(None);
        };

        self.store.refresh(&counterpart).await.map(Some)
    }

    pub fn subscribe_sync(&self) -> broadcast::Receiver<SyncEvent> {
        self.sync.subscribe()
    }

    pub fn subscribe_timeline(&self) -> broadcast::Receiver<TimelineEvent> {
        self.store.subscribe()
    }

    /// Start background sync and, if the ledger offers one, the event listener
    pub fn spawn_sync(self: &Arc<Self>, connectivity: watch::Receiver<Connectivity>) -> SyncHandle {
        let mut handle = self.sync.spawn(connectivity);

        if let Some(mut events) = self.ledger.subscribe() {
            let core = Arc::clone(self);
            let mut shutdown = handle.shutdown_signal();
            handle.attach(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        event = events.recv() => match event {
                            Ok(event) => {
                                if let Err(e) = core.on_ledger_event(event).await {
                                    tracing::debug!("Ledger event refresh failed: {}", e);
                                }
                            }
                            Err(broadcast::error::RecvError::Lagged(n)) => {
                                tracing::warn!("Missed {} ledger events", n);
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        },
                    }
                }
            }));
        }

        handle
    }

    /// Timestamps are strictly increasing within this process
    fn next_timestamp(&self) -> i64 {
        let now = chrono::Utc::now().timestamp_millis();
        let mut last = self.last_timestamp.load(Ordering::SeqCst);
        loop {
            let next = now.max(last + 1);
            match self
                .last_timestamp
                .compare_exchange(last, next, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return next,
                Err(actual) => last = actual,
            }
        }
    }
}

/// Thread-safe shared core type
pub type SharedCore = Arc<ChatCore>;

/// Open a database file and create a shared core on it
pub async fn create_shared_core(
    db_path: &str,
    storage_key: StorageKey,
    signer: Arc<dyn Signer>,
    ledger: Arc<dyn Ledger>,
) -> CoreResult<SharedCore> {
    let db = db::open(db_path).await?;
    let core = ChatCore::open(db, storage_key, signer, ledger).await?;
    Ok(Arc::new(core))
}
