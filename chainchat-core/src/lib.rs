//! Chainchat - Core library
//!
//! Offline-first core of a peer-to-peer encrypted messenger whose transport is
//! an append-only ledger. Messages are encrypted on the device, persisted in a
//! durable queue before any network call, delivered exactly once by the sync
//! engine and merged with confirmed ledger history into one timeline per
//! conversation.
//!
//! ```rust,ignore
//! let core = Arc::new(ChatCore::open(db, storage_key, signer, ledger).await?);
//! let handle = core.spawn_sync(connectivity_rx);
//!
//! core.send(&bob_address, &bob_public_key, "hello").await?;
//! let timeline = core.conversation(&bob_address).await?;
//! ```

pub mod config;
pub mod crypto;
pub mod db;
pub mod error;
pub mod ledger;
pub mod models;
pub mod state;
pub mod sync;
pub mod timeline;

pub use config::{CoreConfig, RetryPolicy};
pub use error::{CoreError, CoreResult};
pub use state::{create_shared_core, ChatCore, SharedCore};

/// Install the global tracing subscriber
///
/// `RUST_LOG` wins over `default_filter`. Safe to call more than once; later
/// calls are ignored.
pub fn init_tracing(default_filter: &str) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .try_init();
}
